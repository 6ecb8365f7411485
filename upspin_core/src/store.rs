//! Blob store collaborator trait.
//!
//! A [`Store`] holds opaque byte blobs keyed by [`Reference`]. Client-side
//! writes are content-addressed: the reference is derived from the blake3
//! digest of the ciphertext, so identical blocks dedupe for free. Server-side
//! callers (the directory log's root record) use well-known references.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;

use crate::entry::{Endpoint, Location};
use crate::errors::Result;

pub use crate::entry::Reference;

/// The result of a `get`: the blob itself, or a redirect list naming other
/// stores that hold it. Replicated blobs surface as redirects; the caller
/// iterates the locations until one succeeds.
#[derive(Debug, Clone)]
pub enum Fetched {
    Bytes(Bytes),
    Redirect(Vec<Location>),
}

#[async_trait]
pub trait Store: Debug + Send + Sync {
    /// The endpoint clients should record in block locations.
    fn endpoint(&self) -> Endpoint;

    async fn get(&self, reference: &str) -> Result<Fetched>;

    async fn put(&self, reference: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, reference: &str) -> Result<()>;
}

/// Maps an endpoint to a live [`Store`].
#[async_trait]
pub trait StoreDialer: Debug + Send + Sync {
    async fn dial_store(&self, endpoint: &Endpoint) -> Result<Arc<dyn Store>>;
}

/// The content-addressed reference for `data`: URL-safe base64 of its
/// blake3 digest.
pub fn content_reference(data: &[u8]) -> Reference {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(blake3::hash(data).as_bytes())
}

/// Stores `data` under its content-addressed reference and returns the
/// location to record in a block.
pub async fn put_block(store: &dyn Store, data: Bytes) -> Result<Location> {
    let reference = content_reference(&data);
    store.put(&reference, data).await?;
    Ok(Location {
        endpoint: store.endpoint(),
        reference,
    })
}
