//! The Factotum holds the user's private key material.
//!
//! All keys are derived from a single 32-byte root secret with blake3
//! domain separation:
//!
//! ```text
//! root_secret [32 bytes]
//!     +-- derive_key("upspin/factotum/sign/ed25519", ...) -> signing key
//!     +-- derive_key("upspin/factotum/wrap/x25519",  ...) -> wrapping key
//! ```
//!
//! The optional symmetric key for the symm packing is read from its own
//! secret file and is not derived. A Factotum is immutable once constructed
//! and safe to share across threads via `Arc`; key bytes are scrubbed on
//! drop.

use std::fmt;
use std::path::Path;

use blake3::derive_key;
use ed25519_dalek::{Signature, Signer, Verifier};
use thiserror::Error;
use zeroize::Zeroize;

use crate::errors::{Error as UpspinError, Kind, Result};

/// Name of the root secret file inside a secrets directory, hex encoded.
pub const SECRET_FILE: &str = "secret.upspinkey";
/// Name of the optional symmetric key file, hex encoded.
pub const SYMM_SECRET_FILE: &str = "symmsecret.upspinkey";

/// Errors from key parsing and crypto primitives, wrapped into the
/// taxonomy as causes.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key length: expected 32 bytes")]
    InvalidKeyLength,
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerificationFailed,
}

/// A user's public key material: the ed25519 verifying key and the x25519
/// key blocks are wrapped against.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub signing: [u8; 32],
    pub wrapping: [u8; 32],
}

impl PublicKey {
    /// Parses the printable form produced by [`PublicKey::to_hex`].
    pub fn from_hex(s: &str) -> Result<PublicKey> {
        let bytes = hex::decode(s.trim())
            .map_err(|_| UpspinError::new(Kind::Invalid).with(KeyError::InvalidHex))?;
        if bytes.len() != 64 {
            return Err(UpspinError::new(Kind::Invalid).with(KeyError::InvalidKeyLength));
        }
        let mut pk = PublicKey {
            signing: [0; 32],
            wrapping: [0; 32],
        };
        pk.signing.copy_from_slice(&bytes[..32]);
        pk.wrapping.copy_from_slice(&bytes[32..]);
        Ok(pk)
    }

    pub fn to_hex(&self) -> String {
        let mut s = hex::encode(self.signing);
        s.push_str(&hex::encode(self.wrapping));
        s
    }

    /// Verifies an ed25519 signature over `msg`.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(&self.signing)
            .map_err(|_| UpspinError::new(Kind::Invalid).with(KeyError::InvalidKeyLength))?;
        let sig = Signature::from_slice(sig)
            .map_err(|_| UpspinError::new(Kind::Invalid).with(KeyError::InvalidSignature))?;
        vk.verify(msg, &sig)
            .map_err(|_| UpspinError::new(Kind::Invalid).with(KeyError::VerificationFailed))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&hex::encode(&self.signing[..5]))
            .finish()
    }
}

struct SymmKey([u8; 32]);

impl Drop for SymmKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub struct Factotum {
    signing: ed25519_dalek::SigningKey,
    wrapping: x25519_dalek::StaticSecret,
    symm: Option<SymmKey>,
}

impl fmt::Debug for Factotum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factotum").finish()
    }
}

impl Factotum {
    /// Derives signing and wrapping keys from a 32-byte root secret.
    pub fn from_root_secret(secret: &[u8; 32]) -> Factotum {
        let mut signing_bytes = derive_key("upspin/factotum/sign/ed25519", secret);
        let wrapping_bytes = derive_key("upspin/factotum/wrap/x25519", secret);
        let f = Factotum {
            signing: ed25519_dalek::SigningKey::from_bytes(&signing_bytes),
            wrapping: x25519_dalek::StaticSecret::from(wrapping_bytes),
            symm: None,
        };
        signing_bytes.zeroize();
        f
    }

    /// A factotum with a fresh random root secret. Test and bootstrap use.
    pub fn random() -> Result<Factotum> {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret)
            .map_err(|e| UpspinError::new(Kind::Internal).msg(e.to_string()))?;
        let f = Factotum::from_root_secret(&secret);
        secret.zeroize();
        Ok(f)
    }

    /// Loads key material from a secrets directory: the hex root secret
    /// from `secret.upspinkey`, and the symm packing key from
    /// `symmsecret.upspinkey` when present.
    pub fn load(dir: &Path) -> Result<Factotum> {
        let secret_path = dir.join(SECRET_FILE);
        let text = std::fs::read_to_string(&secret_path)
            .map_err(|e| UpspinError::from(e).op("factotum.load"))?;
        let mut secret = parse_key_hex(&text)?;
        let mut f = Factotum::from_root_secret(&secret);
        secret.zeroize();

        let symm_path = dir.join(SYMM_SECRET_FILE);
        match std::fs::read_to_string(&symm_path) {
            Ok(text) => f.symm = Some(SymmKey(parse_key_hex(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(f)
    }

    /// Attaches a symm packing key directly. Test use.
    pub fn with_symm_key(mut self, key: [u8; 32]) -> Factotum {
        self.symm = Some(SymmKey(key));
        self
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            signing: self.signing.verifying_key().to_bytes(),
            wrapping: x25519_dalek::PublicKey::from(&self.wrapping).to_bytes(),
        }
    }

    /// Signs `msg` with the user's ed25519 key.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.signing.sign(msg).to_bytes()
    }

    /// The x25519 shared secret with `peer`'s public wrapping key.
    pub fn shared_secret(&self, peer: &[u8; 32]) -> [u8; 32] {
        self.wrapping
            .diffie_hellman(&x25519_dalek::PublicKey::from(*peer))
            .to_bytes()
    }

    /// The symm packing key; `NotExist` when no secret file was present.
    pub fn symmetric_key(&self) -> Result<&[u8; 32]> {
        self.symm
            .as_ref()
            .map(|k| &k.0)
            .ok_or_else(|| UpspinError::new(Kind::NotExist).msg("no symmetric key configured"))
    }
}

fn parse_key_hex(text: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(text.trim())
        .map_err(|_| UpspinError::new(Kind::Invalid).with(KeyError::InvalidHex))?;
    bytes
        .try_into()
        .map_err(|_| UpspinError::new(Kind::Invalid).with(KeyError::InvalidKeyLength))
}
