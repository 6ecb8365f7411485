//! Core upspin-rs protocol types and traits.
//!
//! This crate defines the shared vocabulary of the workspace:
//!
//! ## Protocol types (wire-stable)
//!
//! - Path names and their parsed form (`path::Parsed`)
//! - Directory entries and blocks (`entry::DirEntry`, `entry::DirBlock`),
//!   encoded as CBOR for transport and for the directory server log
//! - Endpoints, locations and references (`entry::Endpoint`,
//!   `entry::Location`)
//! - The Access and Group file grammars (`access`)
//!
//! ## Traits and ambient pieces (non-wire)
//!
//! - Collaborator traits: blob stores (`store::Store`), user key lookup
//!   (`keydir::KeyDirectory`) and directory servers (`dir::DirServer`),
//!   together with the dialers that map endpoints to live instances
//! - The private-key holder (`factotum::Factotum`)
//! - The error taxonomy every crate reports through (`errors`)
//! - Client configuration (`config::Config`)
//!
//! The `testutil` feature adds in-process implementations of the
//! collaborator traits for integration tests.

pub mod access;
pub mod config;
pub mod dir;
pub mod entry;
pub mod errors;
pub mod factotum;
pub mod keydir;
pub mod path;
pub mod store;

#[cfg(feature = "testutil")]
pub mod testutil;

pub use dir::{DirDialer, DirServer};
pub use entry::{
    Attribute, DirBlock, DirEntry, Endpoint, Location, Packing, Transport, SEQ_BASE, SEQ_IGNORE,
    SEQ_NOT_EXIST,
};
pub use errors::{Error, Kind, Result};
pub use factotum::{Factotum, PublicKey};
pub use keydir::{KeyDirectory, UserRecord};
pub use path::{Parsed, PathName, UserName};
pub use store::{Fetched, Reference, Store, StoreDialer};

/// Block plaintext per `pack` call never exceeds this.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Link redirections followed before an operation gives up with "link loop".
pub const MAX_LINK_HOPS: usize = 20;
