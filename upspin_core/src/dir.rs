//! Directory server collaborator trait.
//!
//! Every operation may fail with the `FollowLink` sentinel carrying a
//! link-typed entry whose name is a prefix of the requested path; the
//! client's resolver substitutes the link target and retries.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entry::{DirEntry, Endpoint};
use crate::errors::Result;

#[async_trait]
pub trait DirServer: Debug + Send + Sync {
    /// Looks up a name. A link at or on the way to `name` is reported via
    /// the `FollowLink` sentinel.
    async fn lookup(&self, name: &str) -> Result<DirEntry>;

    /// Stores an entry, assigning its sequence. Returns the stored entry as
    /// the server now holds it.
    async fn put(&self, entry: &DirEntry) -> Result<DirEntry>;

    /// Removes the entry for `name` and returns it. A link in the interior
    /// of the path is reported via `FollowLink`; a link at `name` itself is
    /// removed, not followed.
    async fn delete(&self, name: &str) -> Result<DirEntry>;

    /// Expands a glob pattern; results are sorted by path name.
    async fn glob(&self, pattern: &str) -> Result<Vec<DirEntry>>;

    /// The Access file governing `name`, or `None` when the owner has
    /// never written one.
    async fn which_access(&self, name: &str) -> Result<Option<DirEntry>>;
}

/// Maps an endpoint to a live [`DirServer`].
#[async_trait]
pub trait DirDialer: Debug + Send + Sync {
    async fn dial_dir(&self, endpoint: &Endpoint) -> Result<Arc<dyn DirServer>>;
}
