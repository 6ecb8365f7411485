//! The log record wire format.
//!
//! One record is `varint(op) || varint(len) || entry bytes || checksum`,
//! where the checksum is four bytes seeded with `de ad be ef` and every
//! input byte at stream position `i` is XORed into checksum byte `i mod 4`.
//! The DirEntry bytes are opaque to the log apart from the sequence number.

use std::io::Read;

use integer_encoding::{VarInt, VarIntReader};

use upspin_core::entry::DirEntry;
use upspin_core::errors::{Error, Kind, Result};

/// Largest accepted encoding of a single entry.
pub const MAX_ENTRY_SIZE: u64 = 64 * 1024 * 1024;

const CHECKSUM_SALT: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// The mutation a record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Put = 0,
    Delete = 2,
}

impl Op {
    fn from_wire(value: i64) -> Result<Op> {
        match value {
            0 => Ok(Op::Put),
            2 => Ok(Op::Delete),
            _ => Err(Error::new(Kind::IO).msg(format!("unknown log operation {value}"))),
        }
    }
}

/// One record in a user's transaction log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub op: Op,
    pub entry: DirEntry,
}

impl LogEntry {
    pub fn new(op: Op, entry: DirEntry) -> LogEntry {
        LogEntry { op, entry }
    }

    /// The full on-disk encoding, checksum included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.entry.to_vec()?;
        let mut buf = Vec::with_capacity(body.len() + 16);
        buf.extend_from_slice(&(self.op as i64).encode_var_vec());
        buf.extend_from_slice(&(body.len() as i64).encode_var_vec());
        buf.extend_from_slice(&body);
        let sum = checksum(&buf);
        buf.extend_from_slice(&sum);
        Ok(buf)
    }

    /// Decodes one record from `r`, returning it and the number of bytes
    /// consumed. Corruption in any form surfaces as `IO`.
    pub fn decode<R: Read>(r: &mut R) -> Result<(LogEntry, usize)> {
        let mut cr = ChecksumReader::new(r);
        let io = |why: String| Error::new(Kind::IO).msg(why);

        let op = Op::from_wire(
            cr.read_varint::<i64>()
                .map_err(|e| Error::new(Kind::IO).with(e))?,
        )?;
        let len: i64 = cr
            .read_varint()
            .map_err(|e| Error::new(Kind::IO).with(e))?;
        if len <= 0 {
            return Err(io(format!("invalid entry length {len}")));
        }
        if len as u64 > MAX_ENTRY_SIZE {
            return Err(io(format!("entry too large: {len} bytes")));
        }
        let mut body = vec![0u8; len as usize];
        cr.read_exact(&mut body)
            .map_err(|e| Error::new(Kind::IO).with(e))?;
        let entry = DirEntry::from_bytes_exact(&body)
            .map_err(|e| Error::new(Kind::IO).cause(e))?;

        let consumed = cr.count;
        let want = cr.sum;
        let mut got = [0u8; 4];
        cr.into_inner()
            .read_exact(&mut got)
            .map_err(|e| Error::new(Kind::IO).with(e))?;
        if got != want {
            return Err(io("checksum mismatch reading log entry".to_string()));
        }
        Ok((LogEntry { op, entry }, consumed + 4))
    }
}

pub(crate) fn checksum(data: &[u8]) -> [u8; 4] {
    let mut sum = CHECKSUM_SALT;
    for (i, b) in data.iter().enumerate() {
        sum[i % 4] ^= b;
    }
    sum
}

// Tracks the running checksum and byte count of everything read through it.
struct ChecksumReader<R> {
    inner: R,
    sum: [u8; 4],
    count: usize,
}

impl<R: Read> ChecksumReader<R> {
    fn new(inner: R) -> ChecksumReader<R> {
        ChecksumReader {
            inner,
            sum: CHECKSUM_SALT,
            count: 0,
        }
    }

    fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        for b in &buf[..n] {
            self.sum[self.count % 4] ^= b;
            self.count += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upspin_core::entry::Packing;

    fn sample(seq: i64) -> LogEntry {
        let mut entry = DirEntry::new("ann@example.com/f", Packing::Plain, "ann@example.com");
        entry.sequence = seq;
        LogEntry::new(Op::Put, entry)
    }

    #[test]
    fn encode_decode_round_trip() {
        let le = sample(42);
        let buf = le.encode().unwrap();
        let (got, consumed) = LogEntry::decode(&mut &buf[..]).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(got, le);

        let del = LogEntry::new(Op::Delete, le.entry.clone());
        let buf = del.encode().unwrap();
        let (got, _) = LogEntry::decode(&mut &buf[..]).unwrap();
        assert_eq!(got.op, Op::Delete);
    }

    #[test]
    fn every_flipped_byte_fails_the_checksum() {
        let buf = sample(7).encode().unwrap();
        for i in 0..buf.len() - 4 {
            let mut bad = buf.clone();
            bad[i] ^= 0x01;
            let err = match LogEntry::decode(&mut &bad[..]) {
                Err(err) => err,
                // A flipped length byte may instead leave the reader
                // starved for input, which is still an IO failure.
                Ok(_) => panic!("corruption at byte {i} went undetected"),
            };
            assert!(err.is(Kind::IO), "byte {i}: {err}");
        }
    }

    #[test]
    fn checksum_salt_and_parity() {
        assert_eq!(checksum(&[]), [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(checksum(&[0xde]), [0x00, 0xad, 0xbe, 0xef]);
        assert_eq!(checksum(&[1, 1, 1, 1, 1]), [0xde ^ 1 ^ 1, 0xad ^ 1, 0xbe ^ 1, 0xef ^ 1]);
    }

    #[test]
    fn rejects_bad_framing() {
        // Zero length.
        let mut buf = (Op::Put as i64).encode_var_vec();
        buf.extend((0i64).encode_var_vec());
        let sum = checksum(&buf);
        buf.extend(sum);
        assert!(LogEntry::decode(&mut &buf[..]).is_err());

        // Oversized length.
        let mut buf = (Op::Put as i64).encode_var_vec();
        buf.extend((MAX_ENTRY_SIZE as i64 + 1).encode_var_vec());
        assert!(LogEntry::decode(&mut &buf[..]).is_err());

        // Unknown op.
        let mut buf = (9i64).encode_var_vec();
        buf.extend((1i64).encode_var_vec());
        buf.push(0);
        assert!(LogEntry::decode(&mut &buf[..]).is_err());

        // Truncated body.
        let good = sample(1).encode().unwrap();
        assert!(LogEntry::decode(&mut &good[..good.len() - 6]).is_err());
    }
}
