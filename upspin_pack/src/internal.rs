//! Crypto primitives and packdata wire formats shared by the signed
//! packings.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use minicbor::{CborLen, Decode, Encode};
use thiserror::Error;
use zeroize::Zeroize;

use upspin_core::entry::{DirBlock, Packing};
use upspin_core::errors::{Error as UpspinError, Kind, Result};
use upspin_core::factotum::{Factotum, PublicKey};

/// Poly1305 tag appended to every ciphertext.
pub const CIPHER_OVERHEAD: usize = 16;

const WRAP_CONTEXT: &str = "upspin/pack/ee/wrap";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: wrong key, block index, or tampered data")]
    DecryptionFailed,
    #[error("random number generation failed")]
    RngFailed,
    #[error("malformed packdata")]
    MalformedPackdata,
    #[error("no wrapped key for this user")]
    NoWrappedKey,
}

/// Signature plus per-reader key wraps; the packdata of every signed
/// packing. The wraps list is empty for eeintegrity and symm.
#[derive(Encode, Decode, CborLen, Clone, Debug, Default)]
#[cbor(map)]
pub struct Packdata {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub signature: Vec<u8>,
    #[n(1)]
    pub wraps: Vec<WrappedKey>,
}

/// The file key sealed for one reader: a fresh x25519 ephemeral key, the
/// blake3-derived wrapping key, and an XChaCha20-Poly1305 box.
#[derive(Encode, Decode, CborLen, Clone, Debug)]
#[cbor(map)]
pub struct WrappedKey {
    /// First 16 bytes of blake3(reader's wrapping public key).
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub key_hash: Vec<u8>,
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub ephemeral: Vec<u8>,
    #[n(2)]
    #[cbor(with = "minicbor::bytes")]
    pub nonce: Vec<u8>,
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub sealed: Vec<u8>,
}

impl Packdata {
    pub fn decode(path: &str, bytes: &[u8]) -> Result<Packdata> {
        minicbor::decode(bytes).map_err(|_| {
            UpspinError::new(Kind::Invalid)
                .path(path)
                .with(CryptoError::MalformedPackdata)
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        minicbor::to_vec(self).map_err(|e| UpspinError::new(Kind::Internal).msg(e.to_string()))
    }
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|_| UpspinError::new(Kind::Internal).with(CryptoError::RngFailed))?;
    Ok(buf)
}

/// The deterministic AEAD nonce for block `index`: the little-endian index
/// padded into 24 bytes. A block therefore never decrypts under a
/// different index.
pub fn block_nonce(index: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..8].copy_from_slice(&index.to_le_bytes());
    nonce
}

pub fn encrypt_block(key: &[u8; 32], index: u64, cleartext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(&block_nonce(index).into(), cleartext)
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::EncryptionFailed))
}

pub fn decrypt_block(key: &[u8; 32], index: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(&block_nonce(index).into(), ciphertext)
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::DecryptionFailed))
}

/// The digest the entry signature covers: the signed name, the packing,
/// and every block's extent and ciphertext digest. Locations and key wraps
/// are excluded so rename and share never re-encrypt or re-sign blocks.
pub fn entry_digest(signed_name: &str, packing: Packing, blocks: &[DirBlock]) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    h.update(signed_name.as_bytes());
    h.update(&[0, packing as u8]);
    for b in blocks {
        h.update(&b.offset.to_le_bytes());
        h.update(&b.size.to_le_bytes());
        h.update(&b.packdata);
    }
    *h.finalize().as_bytes()
}

fn key_hash(reader: &PublicKey) -> Vec<u8> {
    blake3::hash(&reader.wrapping).as_bytes()[..16].to_vec()
}

fn wrapping_key(shared: &[u8; 32]) -> [u8; 32] {
    blake3::derive_key(WRAP_CONTEXT, shared)
}

/// Seals `file_key` for `reader` with a fresh ephemeral x25519 key.
pub fn wrap_key(file_key: &[u8; 32], reader: &PublicKey) -> Result<WrappedKey> {
    let ephemeral = x25519_dalek::StaticSecret::from(random_bytes::<32>()?);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
    let mut shared = ephemeral
        .diffie_hellman(&x25519_dalek::PublicKey::from(reader.wrapping))
        .to_bytes();
    let mut wk = wrapping_key(&shared);
    shared.zeroize();
    let nonce = random_bytes::<24>()?;
    let cipher = XChaCha20Poly1305::new((&wk).into());
    let sealed = cipher
        .encrypt(&nonce.into(), file_key.as_slice())
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::EncryptionFailed))?;
    wk.zeroize();
    Ok(WrappedKey {
        key_hash: key_hash(reader),
        ephemeral: ephemeral_public.to_bytes().to_vec(),
        nonce: nonce.to_vec(),
        sealed,
    })
}

/// Finds and opens the wrap addressed to `factotum`'s wrapping key.
/// `Private` when no wrap names this user.
pub fn unwrap_key(factotum: &Factotum, wraps: &[WrappedKey]) -> Result<[u8; 32]> {
    let own_hash = key_hash(&factotum.public_key());
    let wrap = wraps
        .iter()
        .find(|w| w.key_hash == own_hash)
        .ok_or_else(|| UpspinError::new(Kind::Private).with(CryptoError::NoWrappedKey))?;
    let ephemeral: [u8; 32] = wrap
        .ephemeral
        .as_slice()
        .try_into()
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::MalformedPackdata))?;
    let nonce: [u8; 24] = wrap
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::MalformedPackdata))?;
    let mut shared = factotum.shared_secret(&ephemeral);
    let mut wk = wrapping_key(&shared);
    shared.zeroize();
    let cipher = XChaCha20Poly1305::new((&wk).into());
    let opened = cipher
        .decrypt(&nonce.into(), wrap.sealed.as_slice())
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::DecryptionFailed));
    wk.zeroize();
    let opened = opened?;
    opened
        .try_into()
        .map_err(|_| UpspinError::new(Kind::Invalid).with(CryptoError::MalformedPackdata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_cipher_is_index_bound() {
        let key = [42u8; 32];
        let ciphertext = encrypt_block(&key, 0, b"hello").unwrap();
        assert_eq!(ciphertext.len(), 5 + CIPHER_OVERHEAD);
        assert_eq!(decrypt_block(&key, 0, &ciphertext).unwrap(), b"hello");
        // The same ciphertext must not decrypt under a different index.
        assert!(decrypt_block(&key, 1, &ciphertext).is_err());
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let owner = Factotum::from_root_secret(&[1; 32]);
        let reader = Factotum::from_root_secret(&[2; 32]);
        let file_key = [9u8; 32];
        let wraps = vec![
            wrap_key(&file_key, &owner.public_key()).unwrap(),
            wrap_key(&file_key, &reader.public_key()).unwrap(),
        ];
        assert_eq!(unwrap_key(&owner, &wraps).unwrap(), file_key);
        assert_eq!(unwrap_key(&reader, &wraps).unwrap(), file_key);

        let stranger = Factotum::from_root_secret(&[3; 32]);
        let err = unwrap_key(&stranger, &wraps).unwrap_err();
        assert!(err.is(Kind::Private));
    }

    #[test]
    fn packdata_round_trip() {
        let pd = Packdata {
            signature: vec![7; 64],
            wraps: vec![WrappedKey {
                key_hash: vec![1; 16],
                ephemeral: vec![2; 32],
                nonce: vec![3; 24],
                sealed: vec![4; 48],
            }],
        };
        let bytes = pd.encode().unwrap();
        let got = Packdata::decode("u@example.com/f", &bytes).unwrap();
        assert_eq!(got.signature, pd.signature);
        assert_eq!(got.wraps.len(), 1);
        assert_eq!(got.wraps[0].sealed, pd.wraps[0].sealed);
    }
}
