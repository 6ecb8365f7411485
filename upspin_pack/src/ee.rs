//! The ee packing: end-to-end encryption.
//!
//! Each file gets a fresh random key; blocks are sealed with
//! XChaCha20-Poly1305 under a nonce derived from the block index. The file
//! key is wrapped once per reader via x25519; the writer's signature covers
//! the signed name and the block digests, so neither rename nor share needs
//! to touch block contents.

use async_trait::async_trait;

use upspin_core::entry::{DirEntry, Packing};
use upspin_core::errors::Result;
use upspin_core::factotum::PublicKey;

use crate::internal::{random_bytes, unwrap_key, wrap_key, Packdata};
use crate::signed::{resign, verify_entry, Finish, SignedBlockPacker, SignedBlockUnpacker};
use crate::{BlockPacker, BlockUnpacker, PackContext, Packer};

#[derive(Debug)]
pub struct EePacker;

#[async_trait]
impl Packer for EePacker {
    fn packing(&self) -> Packing {
        Packing::Ee
    }

    fn pack(&self, cx: &PackContext, mut entry: DirEntry) -> Result<Box<dyn BlockPacker>> {
        entry.packing = Packing::Ee;
        let file_key = random_bytes::<32>()?;
        Ok(Box::new(SignedBlockPacker::new(
            cx,
            entry,
            Some(file_key),
            Finish::SignAndWrapOwner { file_key },
        )?))
    }

    async fn unpack(&self, cx: &PackContext, entry: &DirEntry) -> Result<Box<dyn BlockUnpacker>> {
        let pd = verify_entry(cx, entry).await?;
        let file_key = unwrap_key(&cx.factotum, &pd.wraps)
            .map_err(|e| e.path(entry.name.clone()))?;
        Ok(Box::new(SignedBlockUnpacker::new(entry, Some(file_key))))
    }

    async fn rename(&self, cx: &PackContext, entry: &mut DirEntry, new_name: &str) -> Result<()> {
        resign(cx, entry, new_name).await
    }

    /// Rewraps each entry's file key for `readers`. The sharer must hold a
    /// wrap already (normally the owner). Packdata that cannot be rewrapped
    /// is cleared so callers can tell which entries were left behind.
    fn share(&self, cx: &PackContext, readers: &[PublicKey], packdata: &mut [Vec<u8>]) {
        for pd_bytes in packdata.iter_mut() {
            let rewrapped = rewrap(cx, readers, pd_bytes);
            match rewrapped {
                Ok(bytes) => *pd_bytes = bytes,
                Err(err) => {
                    tracing::warn!(error = %err, "share: cannot rewrap file key");
                    pd_bytes.clear();
                }
            }
        }
    }
}

fn rewrap(cx: &PackContext, readers: &[PublicKey], pd_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut pd = Packdata::decode("", pd_bytes)?;
    let file_key = unwrap_key(&cx.factotum, &pd.wraps)?;
    let mut wraps = Vec::with_capacity(readers.len());
    let mut seen: Vec<&PublicKey> = Vec::new();
    for reader in readers {
        if seen.contains(&reader) {
            continue;
        }
        seen.push(reader);
        wraps.push(wrap_key(&file_key, reader)?);
    }
    pd.wraps = wraps;
    pd.encode()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use upspin_core::entry::{Endpoint, Location};
    use upspin_core::errors::Kind;
    use upspin_core::factotum::Factotum;
    use upspin_core::keydir::UserRecord;
    use upspin_core::testutil::InProcessKeyDir;

    use super::*;
    use crate::PackerRegistry;

    const OWNER: &str = "ann@example.com";
    const READER: &str = "bob@example.com";

    fn context_for(user: &str, secret: u8, keydir: &Arc<InProcessKeyDir>) -> PackContext {
        let factotum = Arc::new(Factotum::from_root_secret(&[secret; 32]));
        keydir.add(UserRecord {
            name: user.to_string(),
            public_key: factotum.public_key(),
            dirs: vec![],
            stores: vec![],
        });
        let keys: Arc<dyn upspin_core::KeyDirectory> = keydir.clone();
        PackContext::new(user, factotum, keys)
    }

    fn fake_location(i: u64) -> Location {
        Location {
            endpoint: Endpoint::in_process("store"),
            reference: format!("ref{i}"),
        }
    }

    // Packs `data` in `chunk`-sized blocks, returning the finalized entry
    // and the ciphertexts the caller would have stored.
    fn pack_all(
        cx: &PackContext,
        name: &str,
        data: &[u8],
        chunk: usize,
    ) -> (DirEntry, Vec<Vec<u8>>) {
        let entry = DirEntry::new(name, Packing::Ee, cx.user_name.clone());
        let mut bp = EePacker.pack(cx, entry).unwrap();
        let mut ciphertexts = Vec::new();
        for (i, block) in data.chunks(chunk.max(1)).enumerate() {
            ciphertexts.push(bp.pack(block).unwrap());
            bp.set_location(fake_location(i as u64));
        }
        (bp.close().unwrap(), ciphertexts)
    }

    async fn unpack_all(
        cx: &PackContext,
        entry: &DirEntry,
        ciphertexts: &[Vec<u8>],
    ) -> upspin_core::Result<Vec<u8>> {
        let mut bu = EePacker.unpack(cx, entry).await?;
        let mut out = Vec::new();
        let mut i = 0;
        while bu.next_block().is_some() {
            out.extend_from_slice(&bu.unpack(&ciphertexts[i])?);
            i += 1;
        }
        Ok(out)
    }

    #[tokio::test]
    async fn round_trip_multi_block() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let cx = context_for(OWNER, 1, &keydir);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (entry, ciphertexts) = pack_all(&cx, "ann@example.com/f", &data, 1024);

        assert_eq!(entry.blocks.len(), 10);
        assert_eq!(entry.size().unwrap(), data.len() as u64);
        assert_eq!(entry.signed_name, "ann@example.com/f");
        for (block, ciphertext) in entry.blocks.iter().zip(&ciphertexts) {
            assert_eq!(ciphertext.len() as u64, block.size + 16);
        }
        assert_eq!(unpack_all(&cx, &entry, &ciphertexts).await.unwrap(), data);
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_rejected() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let cx = context_for(OWNER, 1, &keydir);
        let (entry, mut ciphertexts) = pack_all(&cx, "ann@example.com/f", b"hello sailor", 1024);
        ciphertexts[0][0] ^= 1;
        let err = unpack_all(&cx, &entry, &ciphertexts).await.unwrap_err();
        assert!(err.is(Kind::Invalid));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let cx = context_for(OWNER, 1, &keydir);
        let (mut entry, ciphertexts) = pack_all(&cx, "ann@example.com/f", b"data", 1024);
        let mut pd = Packdata::decode("", &entry.packdata).unwrap();
        pd.signature[5] ^= 0xff;
        entry.packdata = pd.encode().unwrap();
        assert!(unpack_all(&cx, &entry, &ciphertexts).await.is_err());
    }

    #[tokio::test]
    async fn stranger_gets_private() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let owner_cx = context_for(OWNER, 1, &keydir);
        let stranger_cx = context_for(READER, 2, &keydir);
        let (entry, ciphertexts) = pack_all(&owner_cx, "ann@example.com/f", b"secret", 1024);
        let err = unpack_all(&stranger_cx, &entry, &ciphertexts)
            .await
            .unwrap_err();
        assert!(err.is(Kind::Private));
    }

    #[tokio::test]
    async fn share_admits_new_reader() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let owner_cx = context_for(OWNER, 1, &keydir);
        let reader_cx = context_for(READER, 2, &keydir);
        let (mut entry, ciphertexts) = pack_all(&owner_cx, "ann@example.com/f", b"secret", 1024);

        let readers = vec![
            owner_cx.factotum.public_key(),
            reader_cx.factotum.public_key(),
        ];
        let mut packdata = vec![std::mem::take(&mut entry.packdata)];
        EePacker.share(&owner_cx, &readers, &mut packdata);
        entry.packdata = packdata.pop().unwrap();
        assert!(!entry.packdata.is_empty());

        assert_eq!(
            unpack_all(&reader_cx, &entry, &ciphertexts).await.unwrap(),
            b"secret"
        );
        // The owner still reads it too.
        assert_eq!(
            unpack_all(&owner_cx, &entry, &ciphertexts).await.unwrap(),
            b"secret"
        );
    }

    #[tokio::test]
    async fn share_by_non_holder_flags_packdata() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let owner_cx = context_for(OWNER, 1, &keydir);
        let stranger_cx = context_for(READER, 2, &keydir);
        let (mut entry, _) = pack_all(&owner_cx, "ann@example.com/f", b"secret", 1024);

        let mut packdata = vec![std::mem::take(&mut entry.packdata)];
        EePacker.share(
            &stranger_cx,
            &[stranger_cx.factotum.public_key()],
            &mut packdata,
        );
        assert!(packdata[0].is_empty());
    }

    #[tokio::test]
    async fn rename_round_trip() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let cx = context_for(OWNER, 1, &keydir);
        let (mut entry, ciphertexts) = pack_all(&cx, "ann@example.com/old", b"contents", 4);

        EePacker
            .rename(&cx, &mut entry, "ann@example.com/new")
            .await
            .unwrap();
        assert_eq!(entry.signed_name, "ann@example.com/new");
        assert_eq!(
            unpack_all(&cx, &entry, &ciphertexts).await.unwrap(),
            b"contents"
        );
    }

    #[tokio::test]
    async fn random_access_by_block() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let cx = context_for(OWNER, 1, &keydir);
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let (entry, ciphertexts) = pack_all(&cx, "ann@example.com/f", &data, 100);

        let mut bu = EePacker.unpack(&cx, &entry).await.unwrap();
        assert!(bu.seek_block(2));
        let block = bu.next_block().unwrap();
        assert_eq!(block.offset, 200);
        assert_eq!(&bu.unpack(&ciphertexts[2]).unwrap()[..], &data[200..300]);
        assert!(!bu.seek_block(3));
    }

    #[tokio::test]
    async fn empty_file_round_trips() {
        let keydir = Arc::new(InProcessKeyDir::new());
        let cx = context_for(OWNER, 1, &keydir);
        let (entry, ciphertexts) = pack_all(&cx, "ann@example.com/empty", b"", 1024);
        assert!(entry.blocks.is_empty());
        assert!(unpack_all(&cx, &entry, &ciphertexts)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn registry_dispatches() {
        let registry = PackerRegistry::with_defaults();
        assert_eq!(registry.lookup(Packing::Ee).unwrap().packing(), Packing::Ee);
        assert_eq!(
            registry.lookup(Packing::Plain).unwrap().packing(),
            Packing::Plain
        );
        let empty = PackerRegistry::empty();
        assert!(empty.lookup(Packing::Ee).is_err());
    }
}
