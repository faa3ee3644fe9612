//! Write-ahead backup log: an append-only undo journal of pre-images,
//! double-buffered across two rotating files so one is always either
//! fully replayable or safely ignorable.
//!
//! Layout per record: `offset: u64 | length: u32 | bytes`. The header
//! stamps a horizon value; [`HORIZON_PLACEHOLDER`] means "this log
//! hasn't finished being written and must not be replayed".

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{HORIZON_PLACEHOLDER, MAGIC_BACKUP_LOG};
use crate::error::{Result, StoreError};
use crate::sabotage::Sabotage;

const HEADER_LEN: u64 = 4 + 8; // magic + horizon

/// One rotating slot of the backup log (`.clx` or `.cln`).
struct Slot {
    path: PathBuf,
    file: Option<File>,
}

impl Slot {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)?;
            self.file = Some(f);
        }
        Ok(self.file.as_mut().unwrap())
    }

    fn close(&mut self) {
        self.file = None;
    }
}

pub struct BackupLog {
    clx: Slot,
    cln: Slot,
    /// `false` selects `clx` as the active slot, `true` selects `cln`.
    active_is_cln: bool,
    active_len: u64,
    sabotage: Arc<Sabotage>,
}

impl BackupLog {
    pub fn new(dir: impl AsRef<Path>, stem: &str) -> Self {
        Self::with_sabotage(dir, stem, Arc::new(Sabotage::disarmed()))
    }

    /// Same as [`BackupLog::new`], but with an explicit fault-injection
    /// handle ticked on every [`BackupLog::write`] call — the hook
    /// `flush_pending_backup_writes` retries after (see
    /// `tile/file.rs::cow_dirty`'s deferred-write path).
    pub fn with_sabotage(dir: impl AsRef<Path>, stem: &str, sabotage: Arc<Sabotage>) -> Self {
        let dir = dir.as_ref();
        Self {
            clx: Slot::new(dir.join(format!("{stem}.clx"))),
            cln: Slot::new(dir.join(format!("{stem}.cln"))),
            active_is_cln: false,
            active_len: 0,
            sabotage,
        }
    }

    fn active(&mut self) -> &mut Slot {
        if self.active_is_cln { &mut self.cln } else { &mut self.clx }
    }

    /// Starts (or continues) writing records for the current
    /// checkpoint cycle, stamping the placeholder horizon if this is
    /// a fresh slot.
    pub fn begin(&mut self) -> Result<()> {
        let fresh = self.active_len == 0;
        let active = self.active();
        let file = active.ensure_open()?;
        if fresh {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(MAGIC_BACKUP_LOG)?;
            file.write_all(&HORIZON_PLACEHOLDER.to_be_bytes())?;
            file.sync_all()?;
            self.active_len = HEADER_LEN;
        }
        Ok(())
    }

    /// Appends one `(offset, bytes)` undo record to the active slot.
    /// The record header and payload are issued to the kernel as a
    /// single vectored `pwritev`, per spec §4.2, so a crash mid-write
    /// can never leave a header with no payload or vice versa.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.sabotage.tick()?;
        self.begin()?;
        let pos = self.active_len;
        let mut header = [0u8; 12];
        header[0..8].copy_from_slice(&offset.to_be_bytes());
        header[8..12].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        let active = self.active();
        let file = active.ensure_open()?;
        Self::pwritev_at(file, pos, &header, bytes)?;
        self.active_len += header.len() as u64 + bytes.len() as u64;
        Ok(())
    }

    /// Writes `header` immediately followed by `payload` at `offset`
    /// with one `pwritev(2)` call, positional so no separate `seek` is
    /// needed and atomic at the syscall boundary between the two
    /// buffers.
    fn pwritev_at(file: &File, offset: u64, header: &[u8], payload: &[u8]) -> Result<()> {
        let iov = [
            libc::iovec { iov_base: header.as_ptr() as *mut libc::c_void, iov_len: header.len() },
            libc::iovec { iov_base: payload.as_ptr() as *mut libc::c_void, iov_len: payload.len() },
        ];
        let total = header.len() + payload.len();
        // SAFETY: both iovec entries point at slices that outlive this
        // call; pwritev does not retain the pointers past the syscall.
        let rc = unsafe { libc::pwritev(file.as_raw_fd(), iov.as_ptr(), iov.len() as i32, offset as libc::off_t) };
        if rc < 0 {
            return Err(StoreError::Io(std::io::Error::last_os_error()));
        }
        if rc as usize != total {
            return Err(StoreError::database(format!(
                "short vectored write to backup log: wrote {rc} of {total} bytes"
            )));
        }
        Ok(())
    }

    /// Fsyncs the active slot's data, then stamps the real horizon,
    /// then fsyncs again so the stamp itself is durable. Until this
    /// returns, the slot still carries the placeholder and a crash
    /// leaves it correctly un-replayable.
    pub fn sync_and_stamp(&mut self, horizon: u64) -> Result<()> {
        if self.active_len == 0 {
            return Ok(());
        }
        {
            let active = self.active();
            let file = active.ensure_open()?;
            file.sync_data()?;
        }
        {
            let active = self.active();
            let file = active.ensure_open()?;
            file.seek(SeekFrom::Start(4))?;
            file.write_all(&horizon.to_be_bytes())?;
            file.sync_all()?;
        }
        debug!(horizon, "backup log stamped durable");
        Ok(())
    }

    /// Once the data file's writes have been applied and fsynced,
    /// the just-published slot can be forgotten and rotated away so
    /// the next checkpoint starts from the other slot.
    pub fn retire(&mut self) -> Result<()> {
        if self.active_len == 0 {
            return Ok(());
        }
        self.active().close();
        self.active_is_cln = !self.active_is_cln;
        self.active_len = 0;
        Ok(())
    }

    /// Reads whichever slot carries a committed (non-placeholder)
    /// horizon and returns its records for replay. If both slots are
    /// committed, the one with the larger horizon wins (the other is
    /// stale, left over from a crash between publish and retire).
    pub fn recoverable_records(dir: impl AsRef<Path>, stem: &str) -> Result<Option<(u64, Vec<(u64, Vec<u8>)>)>> {
        let dir = dir.as_ref();
        let mut best: Option<(u64, Vec<(u64, Vec<u8>)>)> = None;
        for ext in ["clx", "cln"] {
            let path = dir.join(format!("{stem}.{ext}"));
            if !path.exists() {
                continue;
            }
            match Self::read_slot(&path)? {
                Some((horizon, records)) => {
                    let better = match &best {
                        None => true,
                        Some((h, _)) => horizon > *h,
                    };
                    if better {
                        best = Some((horizon, records));
                    }
                }
                None => continue,
            }
        }
        Ok(best)
    }

    fn read_slot(path: &Path) -> Result<Option<(u64, Vec<(u64, Vec<u8>)>)>> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Ok(None);
        }
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC_BACKUP_LOG {
            warn!(path = %path.display(), "backup log bad magic, ignoring");
            return Ok(None);
        }
        let mut horizon_bytes = [0u8; 8];
        file.read_exact(&mut horizon_bytes)?;
        let horizon = u64::from_be_bytes(horizon_bytes);
        if horizon == HORIZON_PLACEHOLDER {
            return Ok(None); // unfinished log: must not be replayed
        }

        let mut records = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < len {
            let mut off_buf = [0u8; 8];
            let mut len_buf = [0u8; 4];
            if file.read_exact(&mut off_buf).is_err() {
                break; // truncated tail record, ignore
            }
            if file.read_exact(&mut len_buf).is_err() {
                break;
            }
            let record_len = u32::from_be_bytes(len_buf) as usize;
            let mut bytes = vec![0u8; record_len];
            if file.read_exact(&mut bytes).is_err() {
                break;
            }
            records.push((u64::from_be_bytes(off_buf), bytes));
            pos += 8 + 4 + record_len as u64;
        }
        Ok(Some((horizon, records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfinished_log_is_not_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BackupLog::new(dir.path(), "test");
        log.write(0, b"hello").unwrap();
        // never synced/stamped: horizon stays the placeholder
        let recovered = BackupLog::recoverable_records(dir.path(), "test").unwrap();
        assert!(recovered.is_none());
    }

    #[test]
    fn stamped_log_replays_its_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BackupLog::new(dir.path(), "test");
        log.write(16, b"abc").unwrap();
        log.write(32, b"defg").unwrap();
        log.sync_and_stamp(7).unwrap();

        let (horizon, records) = BackupLog::recoverable_records(dir.path(), "test").unwrap().unwrap();
        assert_eq!(horizon, 7);
        assert_eq!(records, vec![(16, b"abc".to_vec()), (32, b"defg".to_vec())]);
    }

    #[test]
    fn retire_rotates_to_the_other_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BackupLog::new(dir.path(), "test");
        log.write(0, b"a").unwrap();
        log.sync_and_stamp(1).unwrap();
        log.retire().unwrap();
        assert!(log.active_is_cln, "retire should flip the active slot");
        log.write(0, b"b").unwrap();
        log.sync_and_stamp(2).unwrap();

        // both slots are now committed; the higher horizon must win
        let (horizon, _) = BackupLog::recoverable_records(dir.path(), "test").unwrap().unwrap();
        assert_eq!(horizon, 2);
    }
}
