//! Block packing codecs.
//!
//! A [`Packer`] turns user bytes into per-block ciphertexts and back,
//! identified by the numeric [`Packing`] code stored in each
//! [`DirEntry`]. Four codecs exist:
//!
//! - `plain`: no encryption, no signature; Access and Group files only.
//! - `ee`: end-to-end encryption with a per-file key wrapped once per
//!   reader, plus an ed25519 signature over the signed name and the block
//!   digests.
//! - `eeintegrity`: cleartext blocks, same signature.
//! - `symm`: blocks encrypted with a single owner-held symmetric key, same
//!   signature.
//!
//! Packing is a finite stream: `pack` one block at a time (at most
//! [`MAX_BLOCK_SIZE`] bytes of plaintext each), store the ciphertext,
//! `set_location`, and `close` to receive the finalized entry. Unpacking is
//! a random-access cursor over the entry's blocks; the entry signature is
//! verified eagerly when the unpacker is built.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use upspin_core::entry::{DirBlock, DirEntry, Location, Packing};
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::factotum::{Factotum, PublicKey};
use upspin_core::keydir::KeyDirectory;
use upspin_core::path::UserName;

pub use upspin_core::MAX_BLOCK_SIZE;

mod ee;
mod internal;
mod plain;
mod signed;
mod symm;

pub use ee::EePacker;
pub use plain::PlainPacker;
pub use signed::IntegrityPacker;
pub use symm::SymmPacker;

/// What a packer needs to know about the party running it.
#[derive(Debug, Clone)]
pub struct PackContext {
    pub user_name: UserName,
    pub factotum: Arc<Factotum>,
    pub keys: Arc<dyn KeyDirectory>,
}

impl PackContext {
    pub fn new(
        user_name: impl Into<UserName>,
        factotum: Arc<Factotum>,
        keys: Arc<dyn KeyDirectory>,
    ) -> PackContext {
        PackContext {
            user_name: user_name.into(),
            factotum,
            keys,
        }
    }
}

#[async_trait]
pub trait Packer: Debug + Send + Sync {
    fn packing(&self) -> Packing;

    /// Begins a write stream for `entry`. The packer owns the entry until
    /// [`BlockPacker::close`] hands it back finalized.
    fn pack(&self, cx: &PackContext, entry: DirEntry) -> Result<Box<dyn BlockPacker>>;

    /// Begins a read stream over `entry`, verifying its signature (and, for
    /// ee, unwrapping the file key) before returning.
    async fn unpack(&self, cx: &PackContext, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>>;

    /// Re-signs `entry` under `new_name` without touching block contents.
    async fn rename(&self, cx: &PackContext, entry: &mut DirEntry, new_name: &str) -> Result<()>;

    /// Rewraps each entry's file key so every reader in `readers` can
    /// unwrap it. Packdata that cannot be rewrapped is cleared to flag the
    /// failure; the entry is otherwise untouched.
    fn share(&self, cx: &PackContext, readers: &[PublicKey], packdata: &mut [Vec<u8>]);
}

/// Streaming writer for one file's blocks.
pub trait BlockPacker: Send {
    /// Transforms one block of plaintext; at most [`MAX_BLOCK_SIZE`] bytes.
    /// The caller must store the returned ciphertext and call
    /// `set_location` before packing the next block.
    fn pack(&mut self, cleartext: &[u8]) -> Result<Vec<u8>>;

    /// Records where the most recently packed block was stored.
    fn set_location(&mut self, location: Location);

    /// Finalizes the entry: stamps the signature and (for ee) the key
    /// wraps, and hands the entry back.
    fn close(self: Box<Self>) -> Result<DirEntry>;
}

/// Random-access reader over one file's blocks.
pub trait BlockUnpacker: Send {
    /// The next block's descriptor, advancing the cursor; `None` at EOF.
    fn next_block(&mut self) -> Option<DirBlock>;

    /// Positions the cursor so the next `next_block` returns block `i`.
    fn seek_block(&mut self, i: usize) -> bool;

    /// Decrypts and authenticates the current block's ciphertext.
    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Bytes>;
}

/// Process-wide mapping from packing code to codec, populated at startup
/// and immutable afterwards.
#[derive(Debug, Default)]
pub struct PackerRegistry {
    packers: BTreeMap<u8, Arc<dyn Packer>>,
}

impl PackerRegistry {
    pub fn empty() -> PackerRegistry {
        PackerRegistry::default()
    }

    /// All four standard codecs.
    pub fn with_defaults() -> PackerRegistry {
        let mut r = PackerRegistry::empty();
        r.register(Arc::new(PlainPacker));
        r.register(Arc::new(EePacker));
        r.register(Arc::new(IntegrityPacker));
        r.register(Arc::new(SymmPacker));
        r
    }

    pub fn register(&mut self, packer: Arc<dyn Packer>) {
        self.packers.insert(packer.packing() as u8, packer);
    }

    pub fn lookup(&self, packing: Packing) -> Result<Arc<dyn Packer>> {
        self.packers.get(&(packing as u8)).cloned().ok_or_else(|| {
            Error::new(Kind::Invalid).msg(format!("no registered packer for {packing:?}"))
        })
    }
}
