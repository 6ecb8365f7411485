//! Directory entries and the wire-stable types they are built from.
//!
//! A [`DirEntry`] is the metadata record describing one name in the
//! namespace. Entries travel between clients and directory servers and are
//! persisted verbatim in the directory server's transaction log, so their
//! CBOR encoding is part of the protocol.

use minicbor::{CborLen, Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Kind, Result};
use crate::path::{PathName, UserName};

/// An opaque name for one ciphertext blob in a blob store.
pub type Reference = String;

/// Seconds since the Unix epoch.
pub type Time = i64;

/// The current time as a [`Time`].
pub fn time_now() -> Time {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as Time)
        .unwrap_or(0)
}

/// The caller does not care what sequence the entry gets.
pub const SEQ_IGNORE: i64 = 0;
/// The entry must not already exist.
pub const SEQ_NOT_EXIST: i64 = -1;
/// First sequence number assigned by a directory server.
pub const SEQ_BASE: i64 = 1;

/// How to reach a service.
#[repr(u8)]
#[derive(
    Encode, Decode, CborLen, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[cbor(index_only)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[n(0)]
    Unassigned = 0,
    #[n(1)]
    InProcess = 1,
    #[n(2)]
    Remote = 2,
}

#[derive(
    Encode, Decode, CborLen, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    PartialOrd, Ord,
)]
#[cbor(map)]
pub struct Endpoint {
    #[n(0)]
    pub transport: Transport,
    #[n(1)]
    pub net_addr: String,
}

impl PartialOrd for Transport {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Transport {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl Endpoint {
    pub fn unassigned() -> Self {
        Endpoint {
            transport: Transport::Unassigned,
            net_addr: String::new(),
        }
    }

    pub fn in_process(addr: impl Into<String>) -> Self {
        Endpoint {
            transport: Transport::InProcess,
            net_addr: addr.into(),
        }
    }
}

/// A coordinate to fetch one block: which store, which blob.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct Location {
    #[n(0)]
    pub endpoint: Endpoint,
    #[n(1)]
    pub reference: Reference,
}

/// The codec that produced an entry's packdata and block format.
#[repr(u8)]
#[derive(
    Encode, Decode, CborLen, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum Packing {
    /// No encryption, no signature. Access and Group files only.
    #[n(1)]
    Plain = 1,
    /// End-to-end encrypted and signed, with per-reader key wraps.
    #[n(2)]
    Ee = 2,
    /// Cleartext blocks, but signed block digests.
    #[n(3)]
    EeIntegrity = 3,
    /// Encrypted with a single owner-held symmetric key; signed.
    #[n(4)]
    Symm = 4,
}

/// What sort of thing a [`DirEntry`] names.
#[repr(u8)]
#[derive(Encode, Decode, CborLen, Clone, Copy, Debug, PartialEq, Eq)]
#[cbor(index_only)]
pub enum Attribute {
    #[n(0)]
    None = 0,
    #[n(1)]
    Directory = 1,
    #[n(2)]
    Link = 2,
    #[n(3)]
    Incomplete = 3,
}

/// One stored ciphertext block of a file.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct DirBlock {
    #[n(0)]
    pub location: Location,
    /// Plaintext offset of this block within the file.
    #[n(1)]
    pub offset: u64,
    /// Plaintext length of this block.
    #[n(2)]
    pub size: u64,
    /// Packing-specific authenticated material for this block.
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub packdata: Vec<u8>,
}

/// The metadata record describing one name in the namespace.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(map)]
pub struct DirEntry {
    /// The evaluated name; rewritten as links are followed.
    #[n(0)]
    pub name: PathName,
    /// The name at packing time, covered by the signature.
    #[n(1)]
    pub signed_name: PathName,
    /// The user whose key produced the signature.
    #[n(2)]
    pub writer: UserName,
    #[n(3)]
    pub packing: Packing,
    #[n(4)]
    pub attr: Attribute,
    /// `SEQ_IGNORE`, `SEQ_NOT_EXIST`, or a positive counter assigned by the
    /// directory server.
    #[n(5)]
    pub sequence: i64,
    #[n(6)]
    pub time: Time,
    #[n(7)]
    pub blocks: Vec<DirBlock>,
    /// Packing-specific authenticated material for the whole entry.
    #[n(8)]
    #[cbor(with = "minicbor::bytes")]
    pub packdata: Vec<u8>,
    /// The link target; non-empty iff `attr == Link`.
    #[n(9)]
    pub link: PathName,
}

impl DirEntry {
    /// A skeleton entry for `name`, to be filled in by a packer.
    pub fn new(name: impl Into<PathName>, packing: Packing, writer: impl Into<UserName>) -> Self {
        let name = name.into();
        DirEntry {
            signed_name: name.clone(),
            name,
            writer: writer.into(),
            packing,
            attr: Attribute::None,
            sequence: SEQ_IGNORE,
            time: time_now(),
            blocks: Vec::new(),
            packdata: Vec::new(),
            link: String::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr == Attribute::Directory
    }

    pub fn is_link(&self) -> bool {
        self.attr == Attribute::Link
    }

    pub fn is_incomplete(&self) -> bool {
        self.attr == Attribute::Incomplete
    }

    /// Total plaintext length, checking that blocks are contiguous.
    pub fn size(&self) -> Result<u64> {
        let mut total = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.offset != total {
                return Err(Error::new(Kind::Invalid)
                    .path(self.name.clone())
                    .msg(format!("block {i} is not contiguous")));
            }
            total += block.size;
        }
        Ok(total)
    }

    /// Decodes an entry from its CBOR wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<DirEntry> {
        minicbor::decode(bytes).map_err(|e| Error::new(Kind::Invalid).with(e))
    }

    /// As [`DirEntry::from_bytes`], but rejects trailing bytes. Storage
    /// formats that length-prefix entries use this to catch corruption the
    /// CBOR decoder would silently ignore.
    pub fn from_bytes_exact(bytes: &[u8]) -> Result<DirEntry> {
        let mut dec = minicbor::Decoder::new(bytes);
        let entry: DirEntry = dec
            .decode()
            .map_err(|e| Error::new(Kind::Invalid).with(e))?;
        if dec.position() != bytes.len() {
            return Err(Error::new(Kind::Invalid).msg("trailing bytes after entry"));
        }
        Ok(entry)
    }

    /// Encodes this entry to its CBOR wire form.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        minicbor::to_vec(self).map_err(|e| Error::new(Kind::Internal).msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DirEntry {
        let mut e = DirEntry::new("ann@example.com/f", Packing::Ee, "ann@example.com");
        e.sequence = 7;
        e.blocks.push(DirBlock {
            location: Location {
                endpoint: Endpoint::in_process("store"),
                reference: "abc".to_string(),
            },
            offset: 0,
            size: 12,
            packdata: vec![1, 2, 3],
        });
        e.packdata = vec![9, 9];
        e
    }

    #[test]
    fn wire_round_trip() {
        let e = sample();
        let bytes = e.to_vec().unwrap();
        let got = DirEntry::from_bytes(&bytes).unwrap();
        assert_eq!(got, e);
    }

    #[test]
    fn size_checks_contiguity() {
        let mut e = sample();
        e.blocks.push(DirBlock {
            location: e.blocks[0].location.clone(),
            offset: 100,
            size: 1,
            packdata: vec![],
        });
        assert!(e.size().is_err());
        e.blocks[1].offset = 12;
        assert_eq!(e.size().unwrap(), 13);
    }
}
