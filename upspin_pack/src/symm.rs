//! The symm packing: encryption with a single owner-held symmetric key.
//!
//! The key comes from the factotum's local secret file, never from the
//! entry itself, so only the machine holding that file can read the data.
//! Blocks and signatures work exactly as in ee; there are no key wraps.

use async_trait::async_trait;

use upspin_core::entry::{DirEntry, Packing};
use upspin_core::errors::Result;
use upspin_core::factotum::PublicKey;

use crate::signed::{resign, verify_entry, Finish, SignedBlockPacker, SignedBlockUnpacker};
use crate::{BlockPacker, BlockUnpacker, PackContext, Packer};

#[derive(Debug)]
pub struct SymmPacker;

#[async_trait]
impl Packer for SymmPacker {
    fn packing(&self) -> Packing {
        Packing::Symm
    }

    fn pack(&self, cx: &PackContext, mut entry: DirEntry) -> Result<Box<dyn BlockPacker>> {
        entry.packing = Packing::Symm;
        let key = *cx
            .factotum
            .symmetric_key()
            .map_err(|e| e.path(entry.name.clone()))?;
        Ok(Box::new(SignedBlockPacker::new(
            cx,
            entry,
            Some(key),
            Finish::Sign,
        )?))
    }

    async fn unpack(&self, cx: &PackContext, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        verify_entry(cx, entry).await?;
        let key = *cx
            .factotum
            .symmetric_key()
            .map_err(|e| e.path(entry.name.clone()))?;
        Ok(Box::new(SignedBlockUnpacker::new(entry, Some(key))))
    }

    async fn rename(&self, cx: &PackContext, entry: &mut DirEntry, new_name: &str) -> Result<()> {
        resign(cx, entry, new_name).await
    }

    fn share(&self, _cx: &PackContext, _readers: &[PublicKey], _packdata: &mut [Vec<u8>]) {
        // The key never leaves the owner's secret file; sharing is not a
        // symm operation.
    }
}
