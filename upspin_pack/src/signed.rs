//! Machinery shared by the signed packings (ee, eeintegrity, symm), and
//! the eeintegrity packer itself.
//!
//! All three record blake3(ciphertext) as each block's packdata and sign
//! the digest of (signed name, packing, block extents and digests). They
//! differ only in how block bytes are transformed: not at all
//! (eeintegrity), with a per-file key (ee), or with the owner's symmetric
//! key (symm).

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use upspin_core::entry::{Attribute, DirBlock, DirEntry, Location, Packing};
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::factotum::Factotum;
use upspin_core::path::{Parsed, PathName};
use upspin_core::MAX_BLOCK_SIZE;

use crate::internal::{
    decrypt_block, encrypt_block, entry_digest, wrap_key, Packdata,
};
use crate::{BlockPacker, BlockUnpacker, PackContext, Packer};

// Verifies `entry`'s signature against its writer's public key and
// returns the decoded packdata.
pub(crate) async fn verify_entry(cx: &PackContext, entry: &DirEntry) -> Result<Packdata> {
    let pd = Packdata::decode(&entry.name, &entry.packdata)?;
    let writer_key = if entry.writer == cx.user_name {
        cx.factotum.public_key()
    } else {
        cx.keys.lookup(&entry.writer).await?.public_key
    };
    let digest = entry_digest(&entry.signed_name, entry.packing, &entry.blocks);
    writer_key
        .verify(&digest, &pd.signature)
        .map_err(|e| Error::new(Kind::Invalid).path(entry.name.clone()).cause(e))?;
    Ok(pd)
}

// Re-signs `entry` under `new_name` with the caller's key, keeping blocks
// and wraps intact. The old signature is verified first.
pub(crate) async fn resign(cx: &PackContext, entry: &mut DirEntry, new_name: &str) -> Result<()> {
    let parsed = Parsed::parse(new_name)?;
    let mut pd = verify_entry(cx, entry).await?;
    entry.signed_name = parsed.path().to_string();
    entry.name = parsed.path().to_string();
    entry.writer = cx.user_name.clone();
    let digest = entry_digest(&entry.signed_name, entry.packing, &entry.blocks);
    pd.signature = cx.factotum.sign(&digest).to_vec();
    entry.packdata = pd.encode()?;
    Ok(())
}

// How close() finalizes the packdata.
pub(crate) enum Finish {
    /// Signature only.
    Sign,
    /// Signature plus the file key wrapped for the owner; readers are
    /// added later via share.
    SignAndWrapOwner { file_key: [u8; 32] },
}

/// The write half shared by the signed packings.
pub(crate) struct SignedBlockPacker {
    factotum: Arc<Factotum>,
    entry: DirEntry,
    // None: blocks pass through in the clear.
    key: Option<[u8; 32]>,
    finish: Finish,
    offset: u64,
    need_location: bool,
}

impl SignedBlockPacker {
    pub(crate) fn new(
        cx: &PackContext,
        mut entry: DirEntry,
        key: Option<[u8; 32]>,
        finish: Finish,
    ) -> Result<SignedBlockPacker> {
        if entry.attr != Attribute::None {
            return Err(Error::new(Kind::Invalid)
                .path(entry.name.clone())
                .msg("cannot pack a directory or link"));
        }
        entry.writer = cx.user_name.clone();
        entry.signed_name = entry.name.clone();
        entry.blocks.clear();
        entry.packdata.clear();
        Ok(SignedBlockPacker {
            factotum: cx.factotum.clone(),
            entry,
            key,
            finish,
            offset: 0,
            need_location: false,
        })
    }
}

impl BlockPacker for SignedBlockPacker {
    fn pack(&mut self, cleartext: &[u8]) -> Result<Vec<u8>> {
        let path = || self.entry.name.clone();
        if self.need_location {
            return Err(Error::new(Kind::Internal)
                .path(path())
                .msg("pack called before set_location"));
        }
        if cleartext.len() > MAX_BLOCK_SIZE {
            return Err(Error::new(Kind::Invalid)
                .path(path())
                .msg("block too large"));
        }
        let index = self.entry.blocks.len() as u64;
        let ciphertext = match &self.key {
            Some(key) => encrypt_block(key, index, cleartext)
                .map_err(|e| Error::new(Kind::Invalid).path(path()).cause(e))?,
            None => cleartext.to_vec(),
        };
        self.entry.blocks.push(DirBlock {
            location: Location {
                endpoint: upspin_core::entry::Endpoint::unassigned(),
                reference: String::new(),
            },
            offset: self.offset,
            size: cleartext.len() as u64,
            packdata: blake3::hash(&ciphertext).as_bytes().to_vec(),
        });
        self.offset += cleartext.len() as u64;
        self.need_location = true;
        Ok(ciphertext)
    }

    fn set_location(&mut self, location: Location) {
        if let Some(block) = self.entry.blocks.last_mut() {
            block.location = location;
            self.need_location = false;
        }
    }

    fn close(self: Box<Self>) -> Result<DirEntry> {
        let mut entry = self.entry;
        if self.need_location {
            return Err(Error::new(Kind::Internal)
                .path(entry.name)
                .msg("close called before set_location"));
        }
        let digest = entry_digest(&entry.signed_name, entry.packing, &entry.blocks);
        let mut pd = Packdata {
            signature: self.factotum.sign(&digest).to_vec(),
            wraps: Vec::new(),
        };
        if let Finish::SignAndWrapOwner { file_key } = &self.finish {
            pd.wraps.push(wrap_key(file_key, &self.factotum.public_key())?);
        }
        entry.packdata = pd.encode()?;
        Ok(entry)
    }
}

/// The read half shared by the signed packings: a forward cursor with
/// random access via `seek_block`.
pub(crate) struct SignedBlockUnpacker {
    path: PathName,
    blocks: Vec<DirBlock>,
    key: Option<[u8; 32]>,
    next: usize,
    current: Option<usize>,
}

impl SignedBlockUnpacker {
    pub(crate) fn new(entry: &DirEntry, key: Option<[u8; 32]>) -> SignedBlockUnpacker {
        SignedBlockUnpacker {
            path: entry.name.clone(),
            blocks: entry.blocks.clone(),
            key,
            next: 0,
            current: None,
        }
    }
}

impl BlockUnpacker for SignedBlockUnpacker {
    fn next_block(&mut self) -> Option<DirBlock> {
        let block = self.blocks.get(self.next)?.clone();
        self.current = Some(self.next);
        self.next += 1;
        Some(block)
    }

    fn seek_block(&mut self, i: usize) -> bool {
        if i >= self.blocks.len() {
            return false;
        }
        self.next = i;
        self.current = None;
        true
    }

    fn unpack(&mut self, ciphertext: &[u8]) -> Result<Bytes> {
        let invalid = |why: &str| Error::new(Kind::Invalid).path(self.path.clone()).msg(why.to_string());
        let index = self.current.ok_or_else(|| {
            Error::new(Kind::Internal)
                .path(self.path.clone())
                .msg("unpack called before next_block")
        })?;
        let block = &self.blocks[index];
        if blake3::hash(ciphertext).as_bytes()[..] != block.packdata[..] {
            return Err(invalid("block digest mismatch"));
        }
        let cleartext = match &self.key {
            Some(key) => decrypt_block(key, index as u64, ciphertext)
                .map_err(|e| Error::new(Kind::Invalid).path(self.path.clone()).cause(e))?,
            None => ciphertext.to_vec(),
        };
        if cleartext.len() as u64 != block.size {
            return Err(invalid("wrong block length"));
        }
        Ok(Bytes::from(cleartext))
    }
}

/// The eeintegrity packing: cleartext blocks, signed digests. Used for
/// values that must be public but tamper-evident.
#[derive(Debug)]
pub struct IntegrityPacker;

#[async_trait]
impl Packer for IntegrityPacker {
    fn packing(&self) -> Packing {
        Packing::EeIntegrity
    }

    fn pack(&self, cx: &PackContext, mut entry: DirEntry) -> Result<Box<dyn BlockPacker>> {
        entry.packing = Packing::EeIntegrity;
        Ok(Box::new(SignedBlockPacker::new(cx, entry, None, Finish::Sign)?))
    }

    async fn unpack(&self, cx: &PackContext, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        verify_entry(cx, entry).await?;
        Ok(Box::new(SignedBlockUnpacker::new(entry, None)))
    }

    async fn rename(&self, cx: &PackContext, entry: &mut DirEntry, new_name: &str) -> Result<()> {
        resign(cx, entry, new_name).await
    }

    fn share(
        &self,
        _cx: &PackContext,
        _readers: &[upspin_core::factotum::PublicKey],
        _packdata: &mut [Vec<u8>],
    ) {
        // Nothing is encrypted; there are no keys to rewrap.
    }
}
