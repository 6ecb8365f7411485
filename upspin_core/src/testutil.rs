//! In-process collaborators for integration tests (feature `testutil`).
//!
//! [`InProcessDirServer`] keeps one or more users' trees in a flat ordered
//! map and implements the full [`DirServer`] contract, including the
//! `FollowLink` sentinel and glob expansion. It exists to exercise clients;
//! it performs no access-policy checks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::access::ACCESS_FILE;
use crate::dir::{DirDialer, DirServer};
use crate::entry::{DirEntry, Endpoint, SEQ_BASE, SEQ_NOT_EXIST};
use crate::errors::{Error, Kind, Result};
use crate::keydir::{KeyDirectory, UserRecord};
use crate::path::{match_elem, Parsed, PathName, UserName};
use crate::store::{Store, StoreDialer};

/// An in-memory key directory.
#[derive(Debug, Default)]
pub struct InProcessKeyDir {
    users: DashMap<UserName, UserRecord>,
}

impl InProcessKeyDir {
    pub fn new() -> InProcessKeyDir {
        InProcessKeyDir::default()
    }

    pub fn add(&self, record: UserRecord) {
        self.users.insert(record.name.clone(), record);
    }

    pub fn remove(&self, user: &str) {
        self.users.remove(user);
    }
}

#[async_trait]
impl KeyDirectory for InProcessKeyDir {
    async fn lookup(&self, user: &str) -> Result<UserRecord> {
        self.users
            .get(user)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::new(Kind::NotExist).op("keydir.lookup").user(user))
    }
}

#[derive(Default)]
struct DirState {
    // Canonical path -> entry; roots are stored as "user@domain/".
    entries: BTreeMap<PathName, DirEntry>,
    sequences: HashMap<UserName, i64>,
}

/// An in-memory directory server.
#[derive(Default)]
pub struct InProcessDirServer {
    state: Mutex<DirState>,
}

impl fmt::Debug for InProcessDirServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessDirServer").finish()
    }
}

impl InProcessDirServer {
    pub fn new() -> InProcessDirServer {
        InProcessDirServer::default()
    }
}

// Child-listing prefix for a directory path.
fn child_prefix(dir_path: &str) -> String {
    if dir_path.ends_with('/') {
        dir_path.to_string()
    } else {
        format!("{dir_path}/")
    }
}

impl DirState {
    // Reports the first link on the way to `parsed` via the FollowLink
    // sentinel. `include_final` controls whether a link at the full path
    // itself is reported too.
    fn check_links(&self, parsed: &Parsed, include_final: bool) -> Result<()> {
        let last = if include_final {
            parsed.nelem()
        } else {
            parsed.nelem().saturating_sub(1)
        };
        for n in 1..=last {
            let prefix = parsed.first(n);
            if let Some(e) = self.entries.get(prefix.path())
                && e.is_link()
            {
                return Err(Error::follow_link(e.clone()));
            }
        }
        Ok(())
    }

    fn next_sequence(&mut self, user: &str) -> i64 {
        let seq = self
            .sequences
            .entry(user.to_string())
            .or_insert(SEQ_BASE - 1);
        *seq += 1;
        *seq
    }

    // Direct children of `dir_path`, in name order.
    fn children(&self, dir_path: &str) -> Vec<&DirEntry> {
        let prefix = child_prefix(dir_path);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(_, e)| e)
            .collect()
    }
}

#[async_trait]
impl DirServer for InProcessDirServer {
    async fn lookup(&self, name: &str) -> Result<DirEntry> {
        let parsed = Parsed::parse(name)?;
        let state = self.state.lock().unwrap();
        state.check_links(&parsed, true)?;
        state
            .entries
            .get(parsed.path())
            .cloned()
            .ok_or_else(|| Error::new(Kind::NotExist).op("dir.lookup").path(parsed.path()))
    }

    async fn put(&self, entry: &DirEntry) -> Result<DirEntry> {
        let op = "dir.put";
        let parsed = Parsed::parse(&entry.name)?;
        let mut state = self.state.lock().unwrap();

        if parsed.is_root() {
            if !entry.is_dir() {
                return Err(Error::new(Kind::NotDir).op(op).path(parsed.path()));
            }
        } else {
            state.check_links(&parsed, true)?;
            let parent = parsed.dir();
            match state.entries.get(parent.path()) {
                Some(p) if p.is_dir() => {}
                Some(_) => return Err(Error::new(Kind::NotDir).op(op).path(parent.path())),
                None => return Err(Error::new(Kind::NotExist).op(op).path(parent.path())),
            }
        }

        match state.entries.get(parsed.path()) {
            Some(_) if entry.sequence == SEQ_NOT_EXIST => {
                return Err(Error::new(Kind::Exist).op(op).path(parsed.path()));
            }
            Some(old) => {
                if entry.sequence > 0 && entry.sequence != old.sequence {
                    return Err(Error::new(Kind::Invalid)
                        .op(op)
                        .path(parsed.path())
                        .msg("sequence number mismatch"));
                }
                if old.is_dir() && !entry.is_dir() {
                    return Err(Error::new(Kind::IsDir).op(op).path(parsed.path()));
                }
                if !old.is_dir() && entry.is_dir() {
                    return Err(Error::new(Kind::NotDir).op(op).path(parsed.path()));
                }
            }
            None => {}
        }

        let mut stored = entry.clone();
        stored.name = parsed.path().to_string();
        stored.sequence = state.next_sequence(parsed.user());
        state.entries.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<DirEntry> {
        let op = "dir.delete";
        let parsed = Parsed::parse(name)?;
        let mut state = self.state.lock().unwrap();
        // A link at the final element is deleted, never followed.
        state.check_links(&parsed, false)?;
        let entry = state
            .entries
            .get(parsed.path())
            .cloned()
            .ok_or_else(|| Error::new(Kind::NotExist).op(op).path(parsed.path()))?;
        if entry.is_dir() && !state.children(parsed.path()).is_empty() {
            return Err(Error::new(Kind::NotEmpty).op(op).path(parsed.path()));
        }
        state.entries.remove(parsed.path());
        Ok(entry)
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<DirEntry>> {
        let parsed = Parsed::parse(pattern)?;
        let state = self.state.lock().unwrap();
        let root = parsed.first(0);
        if !state.entries.contains_key(root.path()) {
            return Err(Error::new(Kind::NotExist).op("dir.glob").path(root.path()));
        }
        let mut dirs: Vec<PathName> = vec![root.path().to_string()];
        for n in 0..parsed.nelem() {
            let elem = parsed.elem(n);
            let mut next = Vec::new();
            for dir in &dirs {
                for child in state.children(dir) {
                    let base = child.name.rsplit('/').next().unwrap_or("");
                    if match_elem(elem, base)? {
                        next.push(child.name.clone());
                    }
                }
            }
            dirs = next;
            if dirs.is_empty() {
                break;
            }
        }
        let mut out: Vec<DirEntry> = dirs
            .iter()
            .filter_map(|p| state.entries.get(p).cloned())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn which_access(&self, name: &str) -> Result<Option<DirEntry>> {
        let parsed = Parsed::parse(name)?;
        let state = self.state.lock().unwrap();
        state.check_links(&parsed, true)?;
        for n in (0..=parsed.nelem()).rev() {
            let candidate = parsed.first(n).join(ACCESS_FILE)?;
            if let Some(e) = state.entries.get(candidate.path()) {
                return Ok(Some(e.clone()));
            }
        }
        Ok(None)
    }
}

/// Endpoint-keyed registry of in-process services, acting as both dialers.
#[derive(Debug, Clone, Default)]
pub struct TestNet {
    dirs: Arc<DashMap<String, Arc<dyn DirServer>>>,
    stores: Arc<DashMap<String, Arc<dyn Store>>>,
}

impl TestNet {
    pub fn new() -> TestNet {
        TestNet::default()
    }

    pub fn add_dir(&self, addr: impl Into<String>, server: Arc<dyn DirServer>) {
        self.dirs.insert(addr.into(), server);
    }

    pub fn add_store(&self, addr: impl Into<String>, store: Arc<dyn Store>) {
        self.stores.insert(addr.into(), store);
    }
}

#[async_trait]
impl DirDialer for TestNet {
    async fn dial_dir(&self, endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
        self.dirs
            .get(&endpoint.net_addr)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                Error::new(Kind::IO)
                    .op("dial")
                    .msg(format!("no directory server at {:?}", endpoint.net_addr))
            })
    }
}

#[async_trait]
impl StoreDialer for TestNet {
    async fn dial_store(&self, endpoint: &Endpoint) -> Result<Arc<dyn Store>> {
        self.stores
            .get(&endpoint.net_addr)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| {
                Error::new(Kind::IO)
                    .op("dial")
                    .msg(format!("no store server at {:?}", endpoint.net_addr))
            })
    }
}
