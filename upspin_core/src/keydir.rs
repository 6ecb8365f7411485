//! User key lookup collaborator trait.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::entry::Endpoint;
use crate::errors::Result;
use crate::factotum::PublicKey;
use crate::path::UserName;

/// What the key directory knows about one user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: UserName,
    pub public_key: PublicKey,
    /// Directory server endpoints, in preference order.
    pub dirs: Vec<Endpoint>,
    /// Store server endpoints, in preference order.
    pub stores: Vec<Endpoint>,
}

#[async_trait]
pub trait KeyDirectory: Debug + Send + Sync {
    /// Resolves a user name; `NotExist` for unknown users.
    async fn lookup(&self, user: &str) -> Result<UserRecord>;
}
