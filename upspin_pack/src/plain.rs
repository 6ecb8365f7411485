//! The plain packing: no encryption, no signature.
//!
//! Used exclusively for Access and Group files, which must be readable by
//! any party whose policy decisions depend on them, and for link entries,
//! which carry no blocks at all.

use async_trait::async_trait;
use bytes::Bytes;

use upspin_core::entry::{Attribute, DirBlock, DirEntry, Endpoint, Location, Packing};
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::factotum::PublicKey;
use upspin_core::path::{Parsed, PathName};
use upspin_core::MAX_BLOCK_SIZE;

use crate::{BlockPacker, BlockUnpacker, PackContext, Packer};

#[derive(Debug)]
pub struct PlainPacker;

#[async_trait]
impl Packer for PlainPacker {
    fn packing(&self) -> Packing {
        Packing::Plain
    }

    fn pack(&self, cx: &PackContext, mut entry: DirEntry) -> Result<Box<dyn BlockPacker>> {
        if entry.attr == Attribute::Directory {
            return Err(Error::new(Kind::Invalid)
                .path(entry.name.clone())
                .msg("cannot pack a directory"));
        }
        entry.packing = Packing::Plain;
        entry.writer = cx.user_name.clone();
        entry.signed_name = entry.name.clone();
        entry.blocks.clear();
        entry.packdata.clear();
        Ok(Box::new(PlainBlockPacker {
            entry,
            offset: 0,
            need_location: false,
        }))
    }

    async fn unpack(&self, _cx: &PackContext, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        Ok(Box::new(PlainBlockUnpacker {
            path: entry.name.clone(),
            blocks: entry.blocks.clone(),
            next: 0,
            current: None,
        }))
    }

    async fn rename(&self, _cx: &PackContext, entry: &mut DirEntry, new_name: &str) -> Result<()> {
        let parsed = Parsed::parse(new_name)?;
        entry.name = parsed.path().to_string();
        entry.signed_name = entry.name.clone();
        Ok(())
    }

    fn share(&self, _cx: &PackContext, _readers: &[PublicKey], _packdata: &mut [Vec<u8>]) {
        // Plain data is already readable by everyone.
    }
}

struct PlainBlockPacker {
    entry: DirEntry,
    offset: u64,
    need_location: bool,
}

impl BlockPacker for PlainBlockPacker {
    fn pack(&mut self, cleartext: &[u8]) -> Result<Vec<u8>> {
        if self.need_location {
            return Err(Error::new(Kind::Internal)
                .path(self.entry.name.clone())
                .msg("pack called before set_location"));
        }
        if cleartext.len() > MAX_BLOCK_SIZE {
            return Err(Error::new(Kind::Invalid)
                .path(self.entry.name.clone())
                .msg("block too large"));
        }
        self.entry.blocks.push(DirBlock {
            location: Location {
                endpoint: Endpoint::unassigned(),
                reference: String::new(),
            },
            offset: self.offset,
            size: cleartext.len() as u64,
            packdata: Vec::new(),
        });
        self.offset += cleartext.len() as u64;
        self.need_location = true;
        Ok(cleartext.to_vec())
    }

    fn set_location(&mut self, location: Location) {
        if let Some(block) = self.entry.blocks.last_mut() {
            block.location = location;
            self.need_location = false;
        }
    }

    fn close(self: Box<Self>) -> Result<DirEntry> {
        if self.need_location {
            return Err(Error::new(Kind::Internal)
                .path(self.entry.name.clone())
                .msg("close called before set_location"));
        }
        Ok(self.entry)
    }
}

struct PlainBlockUnpacker {
    path: PathName,
    blocks: Vec<DirBlock>,
    next: usize,
    current: Option<usize>,
}

impl BlockUnpacker for PlainBlockUnpacker {
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
        let index = self.current.ok_or_else(|| {
            Error::new(Kind::Internal)
                .path(self.path.clone())
                .msg("unpack called before next_block")
        })?;
        if ciphertext.len() as u64 != self.blocks[index].size {
            return Err(Error::new(Kind::Invalid)
                .path(self.path.clone())
                .msg("wrong block length"));
        }
        Ok(Bytes::copy_from_slice(ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use upspin_core::factotum::Factotum;
    use upspin_core::testutil::InProcessKeyDir;

    use super::*;

    fn context() -> PackContext {
        let keys: Arc<dyn upspin_core::KeyDirectory> = Arc::new(InProcessKeyDir::new());
        PackContext::new(
            "ann@example.com",
            Arc::new(Factotum::from_root_secret(&[1; 32])),
            keys,
        )
    }

    #[tokio::test]
    async fn passthrough_round_trip() {
        let cx = context();
        let entry = DirEntry::new("ann@example.com/Access", Packing::Plain, "ann@example.com");
        let mut bp = PlainPacker.pack(&cx, entry).unwrap();
        let stored = bp.pack(b"r: all\n").unwrap();
        assert_eq!(stored, b"r: all\n");
        bp.set_location(Location {
            endpoint: Endpoint::in_process("store"),
            reference: "r".to_string(),
        });
        let entry = bp.close().unwrap();
        assert!(entry.packdata.is_empty());

        let mut bu = PlainPacker.unpack(&cx, &entry).await.unwrap();
        bu.next_block().unwrap();
        assert_eq!(&bu.unpack(&stored).unwrap()[..], b"r: all\n");
        // Plain carries no authentication, but lengths are still checked.
        assert!(bu.seek_block(0));
        bu.next_block().unwrap();
        assert!(bu.unpack(b"short").is_err());
    }

    #[test]
    fn directories_cannot_be_packed() {
        let cx = context();
        let mut entry = DirEntry::new("ann@example.com/d", Packing::Plain, "ann@example.com");
        entry.attr = Attribute::Directory;
        assert!(PlainPacker.pack(&cx, entry).is_err());
    }
}
