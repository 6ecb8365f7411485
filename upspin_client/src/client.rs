//! The client facade.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use upspin_core::access::{self, Access, GroupCache, Right, UsersResult, ALL_USERS};
use upspin_core::config::Config;
use upspin_core::dir::DirDialer;
use upspin_core::entry::{
    Attribute, DirEntry, Location, Packing, SEQ_IGNORE, SEQ_NOT_EXIST,
};
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::factotum::{Factotum, PublicKey};
use upspin_core::keydir::KeyDirectory;
use upspin_core::path::Parsed;
use upspin_core::store::{put_block, Fetched, StoreDialer};
use upspin_core::MAX_BLOCK_SIZE;
use upspin_pack::{PackContext, Packer, PackerRegistry};

use crate::file::{ReadableFile, WritableFile};

/// A user's view of the global namespace.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<Config>,
    factotum: Arc<Factotum>,
    keys: Arc<dyn KeyDirectory>,
    dir_dialer: Arc<dyn DirDialer>,
    store_dialer: Arc<dyn StoreDialer>,
    packers: Arc<PackerRegistry>,
    groups: GroupCache,
    block_size: usize,
}

impl Client {
    pub fn new(
        config: Config,
        factotum: Arc<Factotum>,
        keys: Arc<dyn KeyDirectory>,
        dir_dialer: Arc<dyn DirDialer>,
        store_dialer: Arc<dyn StoreDialer>,
        packers: Arc<PackerRegistry>,
    ) -> Client {
        Client {
            config: Arc::new(config),
            factotum,
            keys,
            dir_dialer,
            store_dialer,
            packers,
            groups: GroupCache::new(),
            block_size: MAX_BLOCK_SIZE,
        }
    }

    /// Overrides the write chunk size. Test hook; clamped to the packers'
    /// block limit.
    pub fn with_block_size(mut self, block_size: usize) -> Client {
        self.block_size = block_size.clamp(1, MAX_BLOCK_SIZE);
        self
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn dir_dialer(&self) -> &Arc<dyn DirDialer> {
        &self.dir_dialer
    }

    pub(crate) fn keys(&self) -> &Arc<dyn KeyDirectory> {
        &self.keys
    }

    fn pack_context(&self) -> PackContext {
        PackContext::new(
            self.config.user_name.clone(),
            self.factotum.clone(),
            self.keys.clone(),
        )
    }

    /// Stores `data` at `name`, packing it block by block. Access and Group
    /// files are validated against their grammars and always packed plain;
    /// for ee, the file key is wrapped for every reader the governing
    /// Access file grants read to.
    pub async fn put(&self, name: &str, data: &[u8]) -> Result<DirEntry> {
        self.put_sequenced(name, SEQ_IGNORE, data).await
    }

    /// As `put`, but demands a sequence: `SEQ_NOT_EXIST` to create only,
    /// or the sequence of the version being replaced, for optimistic
    /// concurrency against other writers.
    pub async fn put_sequenced(&self, name: &str, sequence: i64, data: &[u8]) -> Result<DirEntry> {
        let op = "client.put";
        let parsed = Parsed::parse(name)?;
        let is_access = access::is_access_file(&parsed);
        let is_group = access::is_group_file(&parsed);
        if is_access {
            Access::parse(parsed.path(), data).map_err(|e| e.in_op(op))?;
        }
        if is_group {
            // Validates the contents and refreshes any cached copy.
            self.groups.add(parsed.path(), data).map_err(|e| e.in_op(op))?;
        }
        let packing = if is_access || is_group {
            Packing::Plain
        } else {
            self.config.packing
        };

        let packer = self.packers.lookup(packing).map_err(|e| e.in_op(op))?;
        let cx = self.pack_context();
        let entry = DirEntry::new(parsed.path(), packing, &self.config.user_name);
        let mut bp = packer.pack(&cx, entry).map_err(|e| e.in_op(op))?;

        let store = self
            .store_dialer
            .dial_store(&self.config.store_endpoint)
            .await
            .map_err(|e| e.in_op(op))?;
        for chunk in data.chunks(self.block_size) {
            let ciphertext = bp.pack(chunk).map_err(|e| e.in_op(op))?;
            let location = put_block(store.as_ref(), Bytes::from(ciphertext))
                .await
                .map_err(|e| e.in_op(op).path(parsed.path()))?;
            bp.set_location(location);
        }
        let mut entry = bp.close().map_err(|e| e.in_op(op))?;
        entry.sequence = sequence;

        if packing == Packing::Ee {
            entry = self.add_readers(op, entry, packer.as_ref()).await?;
        }

        let (stored, _) = self
            .resolve(op, entry, true, |dir, e| async move { dir.put(&e).await })
            .await?;
        Ok(stored)
    }

    /// Fetches and unpacks the contents of `name`, following links.
    pub async fn get(&self, name: &str) -> Result<Bytes> {
        let op = "client.get";
        let entry = self.lookup(name, true).await.map_err(|e| e.in_op(op))?;
        if entry.is_dir() {
            return Err(Error::new(Kind::IsDir).op(op).path(name));
        }
        let packer = self.packers.lookup(entry.packing).map_err(|e| e.in_op(op))?;
        let mut bu = packer.unpack(&self.pack_context(), &entry).await?;
        let mut out = Vec::with_capacity(entry.size()? as usize);
        while let Some(block) = bu.next_block() {
            let ciphertext = self.fetch_block(&block.location).await.map_err(|e| e.in_op(op))?;
            out.extend_from_slice(&bu.unpack(&ciphertext)?);
        }
        Ok(Bytes::from(out))
    }

    /// Resolves `name` to its entry. With `follow_final` false, a link at
    /// the end of the path is returned itself rather than followed.
    pub async fn lookup(&self, name: &str, follow_final: bool) -> Result<DirEntry> {
        let parsed = Parsed::parse(name)?;
        let probe = DirEntry::new(parsed.path(), self.config.packing, &self.config.user_name);
        let (entry, _) = self
            .resolve("client.lookup", probe, follow_final, |dir, e| async move {
                dir.lookup(&e.name).await
            })
            .await?;
        Ok(entry)
    }

    /// Creates a link at `link_name` pointing to `old_name`. Neither may
    /// be an Access or Group file: links must never introduce rights.
    pub async fn put_link(&self, old_name: &str, link_name: &str) -> Result<DirEntry> {
        let op = "client.put_link";
        let old = Parsed::parse(old_name)?;
        let link = Parsed::parse(link_name)?;
        for p in [&old, &link] {
            if access::is_access_file(p) || access::is_group_file(p) {
                return Err(Error::new(Kind::Invalid)
                    .op(op)
                    .path(p.path())
                    .msg("links cannot name Access or Group files"));
            }
        }
        let mut entry = DirEntry::new(link.path(), Packing::Plain, &self.config.user_name);
        entry.attr = Attribute::Link;
        entry.link = old.path().to_string();
        let (stored, _) = self
            .resolve(op, entry, false, |dir, e| async move { dir.put(&e).await })
            .await?;
        Ok(stored)
    }

    /// Creates `new_name` as a duplicate of `old_name`'s entry: same
    /// blocks, re-signed under the new name. Fails `Exist` if the
    /// destination already resolves.
    pub async fn put_duplicate(&self, old_name: &str, new_name: &str) -> Result<DirEntry> {
        self.duplicate("client.put_duplicate", old_name, new_name)
            .await
    }

    /// As `put_duplicate`, then deletes the old entry. Atomicity is per
    /// directory server; a failure after the duplicate leaves it behind.
    pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<DirEntry> {
        let op = "client.rename";
        let entry = self.duplicate(op, old_name, new_name).await?;
        self.delete(old_name).await.map_err(|e| e.in_op(op))?;
        Ok(entry)
    }

    async fn duplicate(&self, op: &'static str, old_name: &str, new_name: &str) -> Result<DirEntry> {
        let old = Parsed::parse(old_name)?;
        let new = Parsed::parse(new_name)?;
        let old_is_access =
            access::is_access_file(&old) || access::is_group_file(&old);
        let new_is_access =
            access::is_access_file(&new) || access::is_group_file(&new);
        if old_is_access != new_is_access {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .path(new.path())
                .msg("cannot change Access or Group status by duplication"));
        }

        let entry = self.lookup(old.path(), true).await.map_err(|e| e.in_op(op))?;
        if entry.is_link() {
            return Err(Error::new(Kind::Invalid).op(op).path(old.path()).msg("cannot duplicate a link"));
        }
        if entry.is_dir() {
            return Err(Error::new(Kind::IsDir).op(op).path(old.path()));
        }

        let packer = self.packers.lookup(entry.packing).map_err(|e| e.in_op(op))?;
        let cx = self.pack_context();
        let mut entry = entry;
        packer.rename(&cx, &mut entry, new.path()).await.map_err(|e| e.in_op(op))?;
        entry.sequence = SEQ_NOT_EXIST;

        if entry.packing == Packing::Ee && old.dir().path() != new.dir().path() {
            entry = self.add_readers(op, entry, packer.as_ref()).await?;
        }

        let (stored, _) = self
            .resolve(op, entry, true, |dir, e| async move { dir.put(&e).await })
            .await?;
        Ok(stored)
    }

    /// Removes the entry for `name`. A link at the end of the path is
    /// removed, not followed.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let op = "client.delete";
        let parsed = Parsed::parse(name)?;
        let probe = DirEntry::new(parsed.path(), self.config.packing, &self.config.user_name);
        let (_, _) = self
            .resolve::<DirEntry, _, _>(op, probe, false, |dir, e| async move {
                dir.delete(&e.name).await
            })
            .await?;
        Ok(())
    }

    /// Expands a glob pattern against the owning user's directory server.
    /// Results come back sorted by path.
    pub async fn glob(&self, pattern: &str) -> Result<Vec<DirEntry>> {
        let op = "client.glob";
        let parsed = Parsed::parse(pattern)?;
        let dir = self.dir_for(&parsed).await.map_err(|e| e.in_op(op))?;
        let mut entries = dir.glob(parsed.path()).await.map_err(|e| e.in_op(op))?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Creates a directory. Does not follow a link at the end of the path.
    pub async fn make_directory(&self, name: &str) -> Result<DirEntry> {
        let op = "client.make_directory";
        let parsed = Parsed::parse(name)?;
        let mut entry = DirEntry::new(parsed.path(), Packing::Plain, &self.config.user_name);
        entry.attr = Attribute::Directory;
        let (stored, _) = self
            .resolve(op, entry, false, |dir, e| async move { dir.put(&e).await })
            .await?;
        Ok(stored)
    }

    /// A writable handle whose contents are stored at `name` on close.
    pub fn create(&self, name: &str) -> Result<WritableFile> {
        let parsed = Parsed::parse(name)?;
        Ok(WritableFile::new(self.clone(), parsed.path().to_string()))
    }

    /// A readable handle over the current contents of `name`.
    pub async fn open(&self, name: &str) -> Result<ReadableFile> {
        let op = "client.open";
        let entry = self.lookup(name, true).await.map_err(|e| e.in_op(op))?;
        if entry.is_dir() {
            return Err(Error::new(Kind::IsDir).op(op).path(name));
        }
        let packer = self.packers.lookup(entry.packing).map_err(|e| e.in_op(op))?;
        let unpacker = packer.unpack(&self.pack_context(), &entry).await?;
        ReadableFile::new(self.clone(), entry, unpacker)
    }

    /// Fetches one block's ciphertext, following store redirect lists
    /// until a copy is found. The first error seen is the one reported.
    pub(crate) async fn fetch_block(&self, location: &Location) -> Result<Bytes> {
        let mut queue: VecDeque<Location> = VecDeque::from([location.clone()]);
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut first_err: Option<Error> = None;
        while let Some(loc) = queue.pop_front() {
            if !visited.insert((loc.endpoint.net_addr.clone(), loc.reference.clone())) {
                continue;
            }
            let store = match self.store_dialer.dial_store(&loc.endpoint).await {
                Ok(store) => store,
                Err(err) => {
                    first_err.get_or_insert(err);
                    continue;
                }
            };
            match store.get(&loc.reference).await {
                Ok(Fetched::Bytes(data)) => return Ok(data),
                Ok(Fetched::Redirect(locations)) => queue.extend(locations),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| {
            Error::new(Kind::IO).msg(format!(
                "no usable location for block {:?}",
                location.reference
            ))
        }))
    }

    // Wraps the entry's file key for every reader the governing Access
    // file grants read to, the owner first. Readers whose key lookup fails
    // are skipped with a warning rather than blocking the write.
    async fn add_readers(
        &self,
        op: &'static str,
        mut entry: DirEntry,
        packer: &dyn Packer,
    ) -> Result<DirEntry> {
        let probe = DirEntry::new(entry.name.clone(), entry.packing, &self.config.user_name);
        let outcome = self
            .resolve(op, probe, true, |dir, e| async move {
                dir.which_access(&e.name).await
            })
            .await;
        let (access_entry, evaluated) = match outcome {
            Ok(v) => v,
            // Concealing the namespace: the caller may not know whether
            // the path exists, only that it cannot write there.
            Err(err) if err.is(Kind::NotExist) => {
                return Err(Error::new(Kind::Permission)
                    .op(op)
                    .path(entry.name.clone())
                    .cause(err));
            }
            Err(err) => return Err(err),
        };
        entry.name = evaluated.name;

        let mut readers = vec![self.factotum.public_key()];
        if let Some(access_entry) = access_entry {
            let users = self.read_access_users(&access_entry.name).await?;
            for user in users {
                if user == self.config.user_name {
                    continue;
                }
                if user == ALL_USERS {
                    tracing::warn!(
                        path = %entry.name,
                        "cannot wrap keys for \"all\"; skipping"
                    );
                    continue;
                }
                match self.keys.lookup(&user).await {
                    Ok(record) => readers.push(record.public_key),
                    Err(err) => {
                        tracing::warn!(user = %user, error = %err, "skipping reader: key lookup failed");
                    }
                }
            }
        }

        let mut packdata = vec![std::mem::take(&mut entry.packdata)];
        packer.share(&self.pack_context(), &readers, &mut packdata);
        let packdata = packdata.pop().unwrap_or_default();
        if packdata.is_empty() {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .path(entry.name.clone())
                .msg("cannot wrap file key for readers"));
        }
        entry.packdata = packdata;
        Ok(entry)
    }

    // The users granted read by the Access file at `access_name`, with
    // group files fetched on demand. Unreadable groups expand to nothing,
    // with a warning.
    async fn read_access_users(&self, access_name: &str) -> Result<Vec<String>> {
        let data = self.get(access_name).await?;
        let parsed_access = Access::parse(access_name, &data)?;
        loop {
            match parsed_access.users(Right::Read, &self.groups)? {
                UsersResult::Users(users) => return Ok(users),
                UsersResult::NeedGroups(need) => {
                    for group in need {
                        let contents = match self.get(&group).await {
                            Ok(b) => b,
                            Err(err) => {
                                tracing::warn!(group = %group, error = %err, "cannot read group file; treating as empty");
                                Bytes::new()
                            }
                        };
                        self.groups.add(&group, &contents)?;
                    }
                }
            }
        }
    }

    /// The public keys currently wrapped for, resolved from a fresh read
    /// of the governing Access file. Exposed for sharing tools.
    pub async fn readers_for(&self, name: &str) -> Result<Vec<PublicKey>> {
        let parsed = Parsed::parse(name)?;
        let probe = DirEntry::new(parsed.path(), self.config.packing, &self.config.user_name);
        let (access_entry, _) = self
            .resolve("client.readers_for", probe, true, |dir, e| async move {
                dir.which_access(&e.name).await
            })
            .await?;
        let mut readers = vec![self.factotum.public_key()];
        if let Some(access_entry) = access_entry {
            for user in self.read_access_users(&access_entry.name).await? {
                if user == self.config.user_name || user == ALL_USERS {
                    continue;
                }
                if let Ok(record) = self.keys.lookup(&user).await {
                    readers.push(record.public_key);
                }
            }
        }
        Ok(readers)
    }
}
