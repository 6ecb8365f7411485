//! Segment files: `<startOffset>` (version 0) or
//! `<startOffset>.<version>` (version 1 and up).
//!
//! Version 0 files predate the full-width sequence numbers: their records
//! carry random bits above the low 23, so every parse of a v0 sequence
//! goes through [`mask_sequence`]. New segments are always written at
//! [`LOG_VERSION`].

use std::path::{Path, PathBuf};

use upspin_core::errors::{Error, Kind, Result};

/// Version of every newly created segment.
pub(crate) const LOG_VERSION: u32 = 1;

// Low 23 bits held the real counter in version-0 logs.
const V0_SEQ_MASK: i64 = (1 << 23) - 1;

/// Applies the version-0 sequence mask where required. This is the only
/// place the mask lives; every v0 parse site calls it.
pub(crate) fn mask_sequence(version: u32, sequence: i64) -> i64 {
    if version == 0 {
        sequence & V0_SEQ_MASK
    } else {
        sequence
    }
}

/// Metadata of one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogFile {
    pub path: PathBuf,
    pub version: u32,
    /// Global byte offset of the first record in this file.
    pub offset: i64,
}

impl LogFile {
    pub(crate) fn new(dir: &Path, offset: i64, version: u32) -> LogFile {
        let name = if version == 0 {
            format!("{offset}")
        } else {
            format!("{offset}.{version}")
        };
        LogFile {
            path: dir.join(name),
            version,
            offset,
        }
    }

    // Parses a directory entry name; non-segment files yield None.
    fn parse(dir: &Path, name: &str) -> Option<LogFile> {
        let (offset_part, version) = match name.split_once('.') {
            Some((off, ver)) => (off, ver.parse::<u32>().ok()?),
            None => (name, 0),
        };
        let offset = offset_part.parse::<i64>().ok()?;
        if offset < 0 {
            return None;
        }
        Some(LogFile {
            path: dir.join(name),
            version,
            offset,
        })
    }
}

/// All segment files in `dir`, sorted by start offset.
pub(crate) fn list_log_files(dir: &Path) -> Result<Vec<LogFile>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::from(e).in_op("log.list_files"))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::from(e).in_op("log.list_files"))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(file) = LogFile::parse(dir, name) {
            files.push(file);
        }
    }
    files.sort_by_key(|f| f.offset);
    for pair in files.windows(2) {
        if pair[0].offset == pair[1].offset {
            return Err(Error::new(Kind::Internal).msg(format!(
                "duplicate log segments at offset {}",
                pair[0].offset
            )));
        }
    }
    Ok(files)
}
