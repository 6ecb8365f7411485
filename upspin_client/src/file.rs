//! Byte-oriented random-access file handles.
//!
//! Two concrete types share the [`File`] trait: [`WritableFile`] buffers
//! plaintext in memory and submits it to `Client::put` on close;
//! [`ReadableFile`] serves reads out of a packed entry, one unpacked block
//! cached at a time. Every operation on a closed handle fails `Invalid`.

use std::io::SeekFrom;

use async_trait::async_trait;
use bytes::Bytes;

use upspin_core::entry::DirEntry;
use upspin_core::errors::{Error, Kind, Result};
use upspin_core::path::PathName;
use upspin_pack::BlockUnpacker;

use crate::client::Client;

/// Largest representable file: offsets must stay addressable as i64 and
/// indexable in memory.
const MAX_FILE_SIZE: u64 = i64::MAX as u64;

#[async_trait]
pub trait File: Send {
    fn name(&self) -> &str;

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Reads at the current offset, advancing it. Returns 0 at EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reads at `offset` without moving the current offset.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes at the current offset, advancing it.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Writes at `offset` without moving the current offset.
    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize>;

    async fn close(&mut self) -> Result<()>;
}

/// A growable in-memory buffer stored to the namespace on close.
pub struct WritableFile {
    client: Client,
    name: PathName,
    buf: Vec<u8>,
    offset: u64,
    closed: bool,
}

impl WritableFile {
    pub(crate) fn new(client: Client, name: PathName) -> WritableFile {
        WritableFile {
            client,
            name,
            buf: Vec::new(),
            offset: 0,
            closed: false,
        }
    }

    fn check_open(&self, op: &'static str) -> Result<()> {
        if self.closed {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .path(self.name.clone())
                .msg("file is closed"));
        }
        Ok(())
    }

    // Grows the buffer to hold `need` bytes, zero-filling any gap.
    // Growth is 1.5x amortized so long runs of small writes stay cheap.
    fn ensure_len(&mut self, need: u64) -> Result<()> {
        if need > MAX_FILE_SIZE || usize::try_from(need).is_err() {
            return Err(Error::new(Kind::Invalid)
                .path(self.name.clone())
                .msg("file too long"));
        }
        let need = need as usize;
        if need <= self.buf.len() {
            return Ok(());
        }
        if need > self.buf.capacity() {
            let grown = self.buf.capacity() + self.buf.capacity() / 2;
            self.buf.reserve_exact(need.max(grown) - self.buf.len());
        }
        self.buf.resize(need, 0);
        Ok(())
    }

    fn write_buf(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| {
                Error::new(Kind::Invalid)
                    .path(self.name.clone())
                    .msg("offset overflow")
            })?;
        self.ensure_len(end)?;
        self.buf[offset as usize..end as usize].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_buf(&self, buf: &mut [u8], offset: u64) -> usize {
        if offset >= self.buf.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(self.buf.len() - start);
        buf[..n].copy_from_slice(&self.buf[start..start + n]);
        n
    }
}

#[async_trait]
impl File for WritableFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open("file.seek")?;
        self.offset = seek_to(self.offset, self.buf.len() as u64, pos)
            .map_err(|e| e.path(self.name.clone()))?;
        Ok(self.offset)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open("file.read")?;
        let n = self.read_buf(buf, self.offset);
        self.offset += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open("file.read_at")?;
        Ok(self.read_buf(buf, offset))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open("file.write")?;
        let n = self.write_buf(data, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        self.check_open("file.write_at")?;
        self.write_buf(data, offset)
    }

    async fn close(&mut self) -> Result<()> {
        self.check_open("file.close")?;
        self.closed = true;
        let buf = std::mem::take(&mut self.buf);
        self.client.put(&self.name, &buf).await?;
        Ok(())
    }
}

/// A read-only view over a packed entry.
pub struct ReadableFile {
    client: Client,
    entry: DirEntry,
    unpacker: Box<dyn BlockUnpacker>,
    size: u64,
    offset: u64,
    // The most recently unpacked block; repeated reads inside one block
    // skip the store and the crypto entirely.
    cached: Option<(usize, Bytes)>,
    closed: bool,
}

impl ReadableFile {
    pub(crate) fn new(
        client: Client,
        entry: DirEntry,
        unpacker: Box<dyn BlockUnpacker>,
    ) -> Result<ReadableFile> {
        let size = entry.size()?;
        Ok(ReadableFile {
            client,
            entry,
            unpacker,
            size,
            offset: 0,
            cached: None,
            closed: false,
        })
    }

    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }

    fn check_open(&self, op: &'static str) -> Result<()> {
        if self.closed {
            return Err(Error::new(Kind::Invalid)
                .op(op)
                .path(self.entry.name.clone())
                .msg("file is closed"));
        }
        Ok(())
    }

    // Index of the block containing byte `offset`.
    fn block_index(&self, offset: u64) -> Result<usize> {
        let i = match self
            .entry
            .blocks
            .binary_search_by(|b| b.offset.cmp(&offset))
        {
            Ok(i) => i,
            Err(0) => {
                return Err(Error::new(Kind::Internal)
                    .path(self.entry.name.clone())
                    .msg("no block at offset 0"));
            }
            Err(i) => i - 1,
        };
        Ok(i)
    }

    async fn block_data(&mut self, index: usize) -> Result<Bytes> {
        if let Some((cached_index, data)) = &self.cached
            && *cached_index == index
        {
            return Ok(data.clone());
        }
        if !self.unpacker.seek_block(index) {
            return Err(Error::new(Kind::Internal)
                .path(self.entry.name.clone())
                .msg("block index out of range"));
        }
        let block = self.unpacker.next_block().ok_or_else(|| {
            Error::new(Kind::Internal)
                .path(self.entry.name.clone())
                .msg("block cursor exhausted")
        })?;
        let ciphertext = self.client.fetch_block(&block.location).await?;
        let data = self.unpacker.unpack(&ciphertext)?;
        self.cached = Some((index, data.clone()));
        Ok(data)
    }

    async fn read_range(&mut self, buf: &mut [u8], mut offset: u64) -> Result<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() && offset < self.size {
            let index = self.block_index(offset)?;
            let block_offset = self.entry.blocks[index].offset;
            let data = self.block_data(index).await?;
            let start = (offset - block_offset) as usize;
            let take = (buf.len() - n).min(data.len() - start);
            buf[n..n + take].copy_from_slice(&data[start..start + take]);
            n += take;
            offset += take as u64;
        }
        Ok(n)
    }
}

#[async_trait]
impl File for ReadableFile {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open("file.seek")?;
        self.offset =
            seek_to(self.offset, self.size, pos).map_err(|e| e.path(self.entry.name.clone()))?;
        Ok(self.offset)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open("file.read")?;
        let n = self.read_range(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open("file.read_at")?;
        self.read_range(buf, offset).await
    }

    async fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::new(Kind::Invalid)
            .op("file.write")
            .path(self.entry.name.clone())
            .msg("file is read-only"))
    }

    async fn write_at(&mut self, _data: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::new(Kind::Invalid)
            .op("file.write_at")
            .path(self.entry.name.clone())
            .msg("file is read-only"))
    }

    async fn close(&mut self) -> Result<()> {
        self.check_open("file.close")?;
        self.closed = true;
        self.cached = None;
        Ok(())
    }
}

// Shared seek arithmetic; `end` is the current size of the underlying data.
fn seek_to(current: u64, end: u64, pos: SeekFrom) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => i128::from(n),
        SeekFrom::Current(d) => i128::from(current) + i128::from(d),
        SeekFrom::End(d) => i128::from(end) + i128::from(d),
    };
    if target < 0 || target > i128::from(MAX_FILE_SIZE) {
        return Err(Error::new(Kind::Invalid).msg("invalid seek offset"));
    }
    Ok(target as u64)
}
