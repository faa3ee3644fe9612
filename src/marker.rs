//! Marker files: tiny durable counters (`next_id`, `horizon`).
//!
//! Each marker is a 4-byte magic followed by a sequence of 5-byte
//! big-endian records; the last complete record is authoritative.
//! Appending one record at a time is cheap, but an unbounded append
//! log eventually outgrows a disk block, so every
//! [`MARKER_APPEND_THRESHOLD`] appends the file is rewritten from
//! scratch instead.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::common::MARKER_APPEND_THRESHOLD;
use crate::error::Result;

const RECORD_LEN: u64 = 5;

pub struct MarkerFile {
    path: PathBuf,
    magic: [u8; 4],
    value: u64,
    appends_since_rewrite: u32,
}

impl MarkerFile {
    /// Opens `path`, reading the last complete 5-byte record as the
    /// current value, or `default` if the file doesn't exist yet.
    pub fn open(path: impl AsRef<Path>, magic: [u8; 4], default: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let value = match Self::read_last_record(&path, &magic)? {
            Some(v) => v,
            None => default,
        };
        Ok(Self { path, magic, value, appends_since_rewrite: 0 })
    }

    fn read_last_record(path: &Path, magic: &[u8; 4]) -> Result<Option<u64>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < 4 {
            return Ok(None);
        }
        let mut header = [0u8; 4];
        file.read_exact(&mut header)?;
        if &header != magic {
            return Ok(None);
        }
        let records = (len - 4) / RECORD_LEN;
        if records == 0 {
            return Ok(None);
        }
        let last_offset = 4 + (records - 1) * RECORD_LEN;
        file.seek(SeekFrom::Start(last_offset))?;
        let mut buf = [0u8; 5];
        file.read_exact(&mut buf)?;
        Ok(Some(decode5(&buf)))
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Durably advances the marker to `new_value`: append a record
    /// (cheap, the common case), or rewrite the whole file from
    /// scratch every [`MARKER_APPEND_THRESHOLD`] appends to keep it
    /// from growing without bound.
    pub fn set(&mut self, new_value: u64) -> Result<()> {
        if self.appends_since_rewrite >= MARKER_APPEND_THRESHOLD {
            self.rewrite(new_value)?;
        } else {
            self.append(new_value)?;
        }
        self.value = new_value;
        Ok(())
    }

    fn append(&mut self, value: u64) -> Result<()> {
        let fresh = !self.path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if fresh {
            file.write_all(&self.magic)?;
        }
        file.write_all(&encode5(value))?;
        file.sync_all()?;
        self.appends_since_rewrite += 1;
        trace!(path = %self.path.display(), value, "marker appended");
        Ok(())
    }

    fn rewrite(&mut self, value: u64) -> Result<()> {
        let tmp_path = self.path.with_extension("TMP");
        {
            let mut tmp = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
            tmp.write_all(&self.magic)?;
            tmp.write_all(&encode5(value))?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.appends_since_rewrite = 0;
        trace!(path = %self.path.display(), value, "marker rewritten");
        Ok(())
    }
}

fn encode5(value: u64) -> [u8; 5] {
    let b = value.to_be_bytes();
    [b[3], b[4], b[5], b[6], b[7]]
}

fn decode5(buf: &[u8; 5]) -> u64 {
    let mut b = [0u8; 8];
    b[3..8].copy_from_slice(buf);
    u64::from_be_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("next");
        {
            let mut m = MarkerFile::open(&path, *b"ai1i", 0).unwrap();
            m.set(42).unwrap();
        }
        let m = MarkerFile::open(&path, *b"ai1i", 0).unwrap();
        assert_eq!(m.value(), 42);
    }

    #[test]
    fn missing_file_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let m = MarkerFile::open(dir.path().join("horizon"), *b"ai1h", 7).unwrap();
        assert_eq!(m.value(), 7);
    }

    #[test]
    fn rewrites_after_threshold_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("next");
        let mut m = MarkerFile::open(&path, *b"ai1i", 0).unwrap();
        for i in 1..=(MARKER_APPEND_THRESHOLD + 5) {
            m.set(i as u64).unwrap();
        }
        assert_eq!(m.value(), (MARKER_APPEND_THRESHOLD + 5) as u64);
        assert!(m.appends_since_rewrite < MARKER_APPEND_THRESHOLD);

        let reopened = MarkerFile::open(&path, *b"ai1i", 0).unwrap();
        assert_eq!(reopened.value(), (MARKER_APPEND_THRESHOLD + 5) as u64);
    }
}
