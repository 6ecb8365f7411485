//! The per-user log handle: exclusive writer, independent readers,
//! checkpoint and root persistence, and user enumeration.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use integer_encoding::VarInt;

use upspin_core::entry::{DirEntry, Time};
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::path::{match_elem, parse_user, UserName};
use upspin_core::store::{Fetched, Store};

use crate::entry::LogEntry;
use crate::files::{list_log_files, mask_sequence, LogFile, LOG_VERSION};
use crate::offseq::OffSeq;

/// Segment size that triggers rotation, unless overridden at open.
pub const MAX_LOG_SIZE_DEFAULT: u64 = 100 * 1024 * 1024;

fn log_dir_name(user: &str) -> String {
    format!("d.tree.log.{user}")
}

fn legacy_log_name(user: &str) -> String {
    format!("tree.log.{user}")
}

// The checkpoint keeps its legacy name: it once was an index file.
fn checkpoint_name(user: &str) -> String {
    format!("tree.index.{user}")
}

fn root_reference(user: &str) -> String {
    format!("tree.root.{user}")
}

// Writer state, guarded by the user-wide mutex.
struct WriterState {
    file: File,
    meta: Arc<LogFile>,
    // Bytes in the current segment; meta.offset + size is the append offset.
    size: u64,
}

struct Shared {
    // The user-wide mutex: serializes appends, truncation, and tail reads.
    writer: Mutex<WriterState>,
    // Segment list, sorted by offset. Never held while acquiring `writer`.
    files: RwLock<Vec<Arc<LogFile>>>,
}

/// The transaction log of one user. One exclusive writer per (user,
/// directory) pair — guaranteed by the caller; readers are independent.
pub struct UserLog {
    name: UserName,
    directory: PathBuf,
    log_dir: PathBuf,
    store: Arc<dyn Store>,
    max_log_size: u64,
    shared: Arc<Shared>,
    offseq: Mutex<OffSeq>,
    saved_root_seq: Mutex<Option<i64>>,
    v1_transition: Time,
}

impl std::fmt::Debug for UserLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserLog")
            .field("user", &self.name)
            .field("dir", &self.log_dir)
            .finish()
    }
}

impl UserLog {
    /// Opens (creating if needed) the log for `user` under `directory`.
    ///
    /// Upgrades legacy layouts: a single-file log becomes segment `0`
    /// (version 0), and a version-0 tail gets a fresh version-1 segment
    /// starting where it ends.
    pub fn open(
        user: &str,
        directory: &Path,
        store: Arc<dyn Store>,
        max_log_size: u64,
    ) -> Result<UserLog> {
        let op = "log.open";
        parse_user(user)?;
        let err = |e: std::io::Error| Error::from(e).in_op(op).user(user.to_string());

        let log_dir = directory.join(log_dir_name(user));
        std::fs::create_dir_all(&log_dir).map_err(err)?;

        // A pre-segment installation keeps its whole history as v0.
        let legacy = directory.join(legacy_log_name(user));
        if legacy.exists() {
            let dest = LogFile::new(&log_dir, 0, 0).path;
            if dest.exists() {
                return Err(Error::new(Kind::Internal)
                    .op(op)
                    .user(user.to_string())
                    .msg("both legacy log and segment 0 exist"));
            }
            std::fs::rename(&legacy, &dest).map_err(err)?;
        }

        let mut files = list_log_files(&log_dir)?;
        if files.is_empty() {
            let first = LogFile::new(&log_dir, 0, LOG_VERSION);
            File::create(&first.path).map_err(err)?;
            files.push(first);
        }
        if let Some(last) = files.last()
            && last.version == 0
        {
            // Transition: freeze the v0 tail and append into v1 from here on.
            let size = std::fs::metadata(&last.path).map_err(err)?.len();
            let next = LogFile::new(&log_dir, last.offset + size as i64, LOG_VERSION);
            File::create(&next.path).map_err(err)?;
            tracing::info!(user, offset = next.offset, "log upgraded to version 1");
            files.push(next);
        }

        let v1_transition = files
            .iter()
            .find(|f| f.version >= 1)
            .and_then(|f| std::fs::metadata(&f.path).ok())
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as Time)
            .unwrap_or(0);

        let offseq = scan_offsets(&files)?;

        let tail = files.last().expect("at least one segment").clone();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&tail.path)
            .map_err(err)?;
        let size = file.seek(SeekFrom::End(0)).map_err(err)?;

        let files: Vec<Arc<LogFile>> = files.into_iter().map(Arc::new).collect();
        let tail = files.last().expect("at least one segment").clone();
        Ok(UserLog {
            name: user.to_string(),
            directory: directory.to_path_buf(),
            log_dir,
            store,
            max_log_size,
            shared: Arc::new(Shared {
                writer: Mutex::new(WriterState {
                    file,
                    meta: tail,
                    size,
                }),
                files: RwLock::new(files),
            }),
            offseq: Mutex::new(offseq),
            saved_root_seq: Mutex::new(None),
            v1_transition,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// When this user's log first gained a version-1 segment.
    pub fn v1_transition(&self) -> Time {
        self.v1_transition
    }

    /// Appends one record, rotating into a new segment when the current
    /// one is full. Returns the record's global offset.
    pub fn append(&self, entry: &LogEntry) -> Result<i64> {
        let op = "log.append";
        let user = || self.name.clone();
        let buf = entry.encode()?;

        let mut w = self.shared.writer.lock().unwrap();
        if w.size >= self.max_log_size {
            let next = Arc::new(LogFile::new(
                &self.log_dir,
                w.meta.offset + w.size as i64,
                LOG_VERSION,
            ));
            // A rotation target that cannot be created is fatal to the
            // append; nothing has been written yet.
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&next.path)
                .map_err(|e| Error::from(e).in_op(op).user(user()))?;
            self.shared.files.write().unwrap().push(next.clone());
            w.file = file;
            w.meta = next;
            w.size = 0;
        }

        let offset = w.meta.offset + w.size as i64;
        let io_err = |e: std::io::Error| Error::from(e).in_op(op).user(user());
        w.file.write_all(&buf).map_err(io_err)?;
        w.file.sync_all().map_err(io_err)?;
        let disk_size = w.file.metadata().map_err(io_err)?.len();
        if disk_size != w.size + buf.len() as u64 {
            return Err(Error::new(Kind::IO).op(op).user(user()).msg(format!(
                "log size {disk_size} does not match expected {}; concurrent writer?",
                w.size + buf.len() as u64
            )));
        }
        w.size = disk_size;
        let sequence = mask_sequence(w.meta.version, entry.entry.sequence);
        drop(w);

        self.offseq.lock().unwrap().insert(offset, sequence);
        Ok(offset)
    }

    /// The offset the next append will be written at.
    pub fn append_offset(&self) -> i64 {
        let w = self.shared.writer.lock().unwrap();
        w.meta.offset + w.size as i64
    }

    /// The global offset of the record carrying `sequence`, or -1.
    /// Sequence 0 always maps to offset 0.
    pub fn offset_of(&self, sequence: i64) -> i64 {
        if sequence == 0 {
            return 0;
        }
        self.offseq.lock().unwrap().offset_of(sequence)
    }

    /// A new independent reader with its own descriptor and cursor.
    pub fn new_reader(&self) -> LogReader {
        LogReader {
            user: self.name.clone(),
            shared: self.shared.clone(),
            state: Mutex::new(None),
        }
    }

    /// Discards everything at and past `offset`: later segments are
    /// deleted and the containing segment is cut at the boundary.
    pub fn truncate(&self, offset: i64) -> Result<()> {
        let op = "log.truncate";
        let err = |e: std::io::Error| Error::from(e).in_op(op).user(self.name.clone());

        if offset < 0 {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .user(self.name.clone())
                .msg("negative truncation offset"));
        }
        let mut w = self.shared.writer.lock().unwrap();
        let mut files = self.shared.files.write().unwrap();
        // Keep only segments that start before the cut; an exact boundary
        // hit drops the whole segment starting there.
        let keep = files.partition_point(|f| f.offset < offset);
        for stale in files.drain(keep..) {
            std::fs::remove_file(&stale.path).map_err(err)?;
        }
        let meta = match files.last() {
            Some(meta) => meta.clone(),
            None => {
                // The cut removed everything; restart at offset zero.
                let first = Arc::new(LogFile::new(&self.log_dir, 0, LOG_VERSION));
                File::create(&first.path).map_err(err)?;
                files.push(first.clone());
                first
            }
        };
        drop(files);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&meta.path)
            .map_err(err)?;
        let size = file.metadata().map_err(err)?.len();
        let local = (offset - meta.offset) as u64;
        let local = local.min(size);
        file.set_len(local).map_err(err)?;
        file.sync_all().map_err(err)?;
        file.seek(SeekFrom::Start(local)).map_err(err)?;
        w.file = file;
        w.meta = meta;
        w.size = local;
        drop(w);

        self.offseq.lock().unwrap().truncate(offset);
        Ok(())
    }

    /// Atomically replaces the checkpoint: the offset of the next record
    /// the server still has to apply.
    pub fn save_offset(&self, offset: i64) -> Result<()> {
        let op = "log.save_offset";
        if offset < 0 {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .user(self.name.clone())
                .msg("negative checkpoint offset"));
        }
        let err = |e: std::io::Error| Error::from(e).in_op(op).user(self.name.clone());
        let path = self.directory.join(checkpoint_name(&self.name));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(err)?;
        file.write_all(&offset.encode_var_vec()).map_err(err)?;
        file.sync_all().map_err(err)?;
        Ok(())
    }

    /// The stored checkpoint; `NotExist` when none was ever saved.
    pub fn read_offset(&self) -> Result<i64> {
        let op = "log.read_offset";
        let path = self.directory.join(checkpoint_name(&self.name));
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::new(Kind::NotExist).op(op).user(self.name.clone()));
            }
            Err(e) => return Err(Error::from(e).in_op(op).user(self.name.clone())),
        };
        let (offset, _) = i64::decode_var(&bytes).ok_or_else(|| {
            Error::new(Kind::IO)
                .op(op)
                .user(self.name.clone())
                .msg("malformed checkpoint")
        })?;
        if offset < 0 {
            return Err(Error::new(Kind::IO)
                .op(op)
                .user(self.name.clone())
                .msg("negative checkpoint offset"));
        }
        Ok(offset)
    }

    /// Stores the user's root entry as a blob, skipping writes whose
    /// sequence matches the last one saved by this handle.
    pub async fn save_root(&self, root: &DirEntry) -> Result<()> {
        if *self.saved_root_seq.lock().unwrap() == Some(root.sequence) {
            return Ok(());
        }
        let bytes = root.to_vec()?;
        self.store
            .put(&root_reference(&self.name), Bytes::from(bytes))
            .await
            .map_err(|e| e.in_op("log.save_root").user(self.name.clone()))?;
        *self.saved_root_seq.lock().unwrap() = Some(root.sequence);
        Ok(())
    }

    /// The stored root entry, falling back to the legacy on-disk file when
    /// the blob store has none.
    pub async fn root(&self) -> Result<DirEntry> {
        let op = "log.root";
        let reference = root_reference(&self.name);
        match self.store.get(&reference).await {
            Ok(Fetched::Bytes(bytes)) => DirEntry::from_bytes(&bytes),
            Ok(Fetched::Redirect(_)) => Err(Error::new(Kind::Internal)
                .op(op)
                .user(self.name.clone())
                .msg("root blob store returned a redirect")),
            Err(e) if e.is(Kind::NotExist) => {
                let path = self.directory.join(&reference);
                match std::fs::read(&path) {
                    Ok(bytes) => DirEntry::from_bytes(&bytes),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(Error::new(Kind::NotExist).op(op).user(self.name.clone()))
                    }
                    Err(e) => Err(Error::from(e).in_op(op).user(self.name.clone())),
                }
            }
            Err(e) => Err(e.in_op(op).user(self.name.clone())),
        }
    }

    /// Removes both representations of the root.
    pub async fn delete_root(&self) -> Result<()> {
        let op = "log.delete_root";
        let reference = root_reference(&self.name);
        match self.store.delete(&reference).await {
            Ok(()) => {}
            Err(e) if e.is(Kind::NotExist) => {}
            Err(e) => return Err(e.in_op(op).user(self.name.clone())),
        }
        match std::fs::remove_file(self.directory.join(&reference)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::from(e).in_op(op).user(self.name.clone())),
        }
        *self.saved_root_seq.lock().unwrap() = None;
        Ok(())
    }

    /// Removes every artifact of this user's log: legacy single-file log,
    /// checkpoint, root, and the segment directory. Missing pieces are
    /// ignored; any other failure propagates.
    pub async fn delete_logs(&self) -> Result<()> {
        let op = "log.delete_logs";
        let ignore_missing = |r: std::io::Result<()>| match r {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).in_op(op).user(self.name.clone())),
        };
        ignore_missing(std::fs::remove_file(
            self.directory.join(legacy_log_name(&self.name)),
        ))?;
        ignore_missing(std::fs::remove_file(
            self.directory.join(checkpoint_name(&self.name)),
        ))?;
        self.delete_root().await?;
        ignore_missing(std::fs::remove_dir_all(&self.log_dir))?;
        Ok(())
    }
}

// Builds the offset index by replaying every segment.
fn scan_offsets(files: &[LogFile]) -> Result<OffSeq> {
    let mut index = OffSeq::default();
    for file in files {
        let len = std::fs::metadata(&file.path)
            .map_err(|e| Error::from(e).in_op("log.open"))?
            .len();
        if len == 0 {
            continue;
        }
        let handle = File::open(&file.path).map_err(|e| Error::from(e).in_op("log.open"))?;
        let mut reader = BufReader::new(handle);
        let mut local: u64 = 0;
        while local < len {
            let (entry, consumed) = LogEntry::decode(&mut reader)
                .map_err(|e| e.in_op("log.open").path(file.path.display().to_string()))?;
            index.insert(
                file.offset + local as i64,
                mask_sequence(file.version, entry.entry.sequence),
            );
            local += consumed as u64;
        }
    }
    Ok(index)
}

/// An independent, seekable reader over one user's log.
///
/// Lock order: the reader's own mutex is taken first, then (only when the
/// read touches the tail segment) the user-wide mutex, so a record being
/// appended is seen entirely or not at all.
pub struct LogReader {
    user: UserName,
    shared: Arc<Shared>,
    state: Mutex<Option<(Arc<LogFile>, File)>>,
}

impl LogReader {
    /// Reads the record at `offset`. Returns the record and the offset of
    /// the next one; at or past the end of the log it returns
    /// `(None, offset)` with no error.
    pub fn read_at(&self, offset: i64) -> Result<(Option<LogEntry>, i64)> {
        let op = "log.read_at";
        if offset < 0 {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .user(self.user.clone())
                .msg("negative offset"));
        }
        let mut state = self.state.lock().unwrap();

        // Pick the segment containing `offset`; drop the list lock before
        // any writer-lock acquisition below.
        let (meta, is_tail) = {
            let files = self.shared.files.read().unwrap();
            let idx = match files.binary_search_by(|f| f.offset.cmp(&offset)) {
                Ok(i) => i,
                Err(0) => {
                    return Err(Error::new(Kind::Invalid)
                        .op(op)
                        .user(self.user.clone())
                        .msg("offset before log start"));
                }
                Err(i) => i - 1,
            };
            (files[idx].clone(), idx == files.len() - 1)
        };

        // Compare segment identity, not path: truncation can recreate a
        // segment at the same name, and the old descriptor would be stale.
        let reopen = match state.as_ref() {
            Some((current, _)) => !Arc::ptr_eq(current, &meta),
            None => true,
        };
        if reopen {
            let file = File::open(&meta.path)
                .map_err(|e| Error::from(e).in_op(op).user(self.user.clone()))?;
            *state = Some((meta.clone(), file));
        }
        let (_, file) = state.as_mut().expect("reader file just opened");

        if is_tail {
            // Reading where the writer appends: hold the user lock so a
            // record mid-append is either fully visible or not at all.
            let w = self.shared.writer.lock().unwrap();
            let end = w.meta.offset + w.size as i64;
            if offset >= end {
                return Ok((None, offset));
            }
            read_record(file, &meta, offset, &self.user)
        } else {
            read_record(file, &meta, offset, &self.user)
        }
    }
}

fn read_record(
    file: &mut File,
    meta: &LogFile,
    offset: i64,
    user: &str,
) -> Result<(Option<LogEntry>, i64)> {
    let op = "log.read_at";
    file.seek(SeekFrom::Start((offset - meta.offset) as u64))
        .map_err(|e| Error::from(e).in_op(op).user(user.to_string()))?;
    let (mut record, consumed) = LogEntry::decode(file)
        .map_err(|e| e.in_op(op).user(user.to_string()))?;
    record.entry.sequence = mask_sequence(meta.version, record.entry.sequence);
    Ok((Some(record), offset + consumed as i64))
}

/// Reports whether `user` has any log state under `directory`.
pub fn has_log(user: &str, directory: &Path) -> bool {
    directory.join(legacy_log_name(user)).exists()
        || directory.join(log_dir_name(user)).exists()
}

/// Users with a checkpoint under `directory` whose name matches the glob
/// `pattern`.
pub fn list_users(pattern: &str, directory: &Path) -> Result<Vec<UserName>> {
    let op = "log.list_users";
    let mut users = Vec::new();
    let entries = std::fs::read_dir(directory).map_err(|e| Error::from(e).in_op(op))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::from(e).in_op(op))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(user) = name.strip_prefix("tree.index.") else {
            continue;
        };
        if match_elem(pattern, user)? {
            users.push(user.to_string());
        }
    }
    users.sort();
    Ok(users)
}

/// Users whose name carries the given `+suffix`; `"*"` matches any
/// non-empty suffix.
pub fn list_users_with_suffix(suffix: &str, directory: &Path) -> Result<Vec<UserName>> {
    let all = list_users("*", directory)?;
    Ok(all
        .into_iter()
        .filter(|user| match parse_user(user) {
            Ok((_, got, _)) if suffix == "*" => !got.is_empty(),
            Ok((_, got, _)) => got == suffix,
            Err(_) => false,
        })
        .collect())
}
