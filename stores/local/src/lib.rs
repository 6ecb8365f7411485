//! Local-filesystem blob store.
//!
//! Blobs live as plain files under `base_path/blobs/<reference>`. References
//! are opaque but must not escape the blob directory, so anything containing
//! a path separator or `..` is rejected.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use upspin_core::entry::Endpoint;
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::store::{Fetched, Store};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LocalStoreConfig {
    pub base_path: String,
    /// Endpoint address clients record in block locations.
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    base_path: PathBuf,
    endpoint: Endpoint,
}

impl LocalStore {
    pub fn create(config: LocalStoreConfig) -> LocalStore {
        LocalStore {
            base_path: PathBuf::from(config.base_path).join("blobs"),
            endpoint: Endpoint::in_process(config.addr),
        }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        if reference.is_empty() || reference.contains('/') || reference.contains("..") {
            return Err(Error::new(Kind::Invalid)
                .op("store.resolve")
                .msg(format!("invalid reference {reference:?}")));
        }
        Ok(self.base_path.join(reference))
    }
}

#[async_trait]
impl Store for LocalStore {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn get(&self, reference: &str) -> Result<Fetched> {
        let path = self.resolve(reference)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Fetched::Bytes(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::new(Kind::NotExist).op("store.get").msg(reference.to_string()))
            }
            Err(e) => Err(Error::from(e).op("store.get")),
        }
    }

    async fn put(&self, reference: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(reference)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from(e).op("store.put"))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::from(e).op("store.put"))
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let path = self.resolve(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::new(Kind::NotExist).op("store.delete").msg(reference.to_string()))
            }
            Err(e) => Err(Error::from(e).op("store.delete")),
        }
    }
}
