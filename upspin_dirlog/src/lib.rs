//! The append-only transaction log of a directory server, one per user.
//!
//! Every mutation of a user's tree is recorded as a checksummed
//! [`LogEntry`] in a sequence of segment files under
//! `d.tree.log.<user>/`. The log supports one exclusive appender (the
//! caller guarantees a single writer per user and directory), any number of
//! independent seekable readers, size-triggered rotation, truncation, a
//! persisted checkpoint of the next offset to apply, and the user's root
//! entry stored as a blob.
//!
//! ## Layers
//! 1. `entry`  – the wire format: varint framing plus a salted XOR checksum.
//! 2. `files`  – versioned segment files (`<startOffset>.<version>`) and
//!    the v0 sequence mask.
//! 3. `offseq` – the in-memory offset ↔ sequence index.
//! 4. `user`   – the `UserLog` handle: append, readers, truncate,
//!    checkpoint, root, enumeration.
//!
//! ## Locking
//! Two levels: each reader has its own mutex over its descriptor and
//! cursor, and a user-wide mutex serializes the writer state. The fixed
//! order is reader lock first, then the user lock; the segment list is
//! never held across an acquisition of the user lock.

mod entry;
mod files;
mod offseq;
mod user;

pub use entry::{LogEntry, Op, MAX_ENTRY_SIZE};
pub use user::{
    has_log, list_users, list_users_with_suffix, LogReader, UserLog, MAX_LOG_SIZE_DEFAULT,
};
