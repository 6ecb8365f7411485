//! In-memory blob store, used by tests and benches.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use upspin_core::entry::{Endpoint, Location};
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::store::{Fetched, Store};

#[derive(Debug)]
pub struct MemoryStore {
    endpoint: Endpoint,
    blobs: DashMap<String, Bytes>,
    // When set, `get` answers with a redirect to these locations instead of
    // the blob itself, mimicking a store that only indexes replicas.
    redirect_to: Option<Vec<Location>>,
}

impl MemoryStore {
    /// A store reachable in-process at `addr`.
    pub fn new(addr: impl Into<String>) -> MemoryStore {
        MemoryStore {
            endpoint: Endpoint::in_process(addr),
            blobs: DashMap::new(),
            redirect_to: None,
        }
    }

    /// A store that redirects every `get` to `locations`.
    pub fn redirecting(addr: impl Into<String>, locations: Vec<Location>) -> MemoryStore {
        MemoryStore {
            endpoint: Endpoint::in_process(addr),
            blobs: DashMap::new(),
            redirect_to: Some(locations),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn get(&self, reference: &str) -> Result<Fetched> {
        if let Some(locations) = &self.redirect_to {
            return Ok(Fetched::Redirect(locations.clone()));
        }
        self.blobs
            .get(reference)
            .map(|b| Fetched::Bytes(b.clone()))
            .ok_or_else(|| Error::new(Kind::NotExist).op("store.get").msg(reference.to_string()))
    }

    async fn put(&self, reference: &str, data: Bytes) -> Result<()> {
        self.blobs.insert(reference.to_string(), data);
        Ok(())
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        self.blobs
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| Error::new(Kind::NotExist).op("store.delete").msg(reference.to_string()))
    }
}
