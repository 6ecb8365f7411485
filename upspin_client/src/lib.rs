//! The upspin-rs client.
//!
//! [`Client`] composes the collaborator services into the user-facing
//! operations: `put`/`get`, links, duplicates and renames, globs, and
//! byte-oriented file handles. Every directory operation runs through the
//! link-following resolver, which consumes `FollowLink` sentinels until the
//! path is fully evaluated.
//!
//! ## Layers
//! 1. `resolver` – the per-operation link-following state machine.
//! 2. `client`  – the facade, including Access/Group validation and
//!    reader key maintenance on `put`.
//! 3. `file`    – readable and writable random-access handles.

mod client;
mod file;
mod resolver;

pub use client::Client;
pub use file::{File, ReadableFile, WritableFile};
