//! Tiled file handle: the paged view of one backing file.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backup::BackupLog;
use crate::checkpoint::CheckpointPhase;
use crate::common::round_up;
use crate::error::{Result, StoreError};
use crate::sabotage::Sabotage;

use super::pool::TilePool;
use super::refs::{AccessMode, TileRef};
use super::tile::{MappedView, Tile, TileMemory};

/// Headroom multiplier applied when a read-only consumer rebuilds its
/// initial mapping after the writer grows the file (`stretch`).
const STRETCH_HEADROOM_PCT: u64 = 10;

struct InitialMapping {
    view: MappedView,
    /// Number of bytes actually covered (may be less than the mapping
    /// length if headroom was added speculatively).
    covered: u64,
}

pub struct TiledFileState {
    pub file: File,
    pub path: PathBuf,
    pub tile_size: usize,
    pub physical_size: u64,
    /// Bytes covered by the lead single large mmap, or `None` if this
    /// file doesn't keep one (e.g. too small to bother).
    initial: Option<InitialMapping>,
    pub tiles: Vec<Option<Tile>>,
    pub dirty: Vec<u32>,
    pub scheduled: Vec<u32>,
    pub backup: Option<BackupLog>,
    pub phase: CheckpointPhase,
    pub transactional: bool,
    pub lock_pages: bool,
}

/// A tiled file is shared between the owning consumer and the pool's
/// eviction list, hence `Arc`. All mutable state lives behind one
/// mutex; the single-writer model means this lock is never contended.
/// `Clone` hands out another handle onto the same underlying state
/// (the `Drop` impl only finalizes bookkeeping once the last clone
/// goes away) so the database layer can gather every open file into
/// one slice for the checkpoint engine without fighting ownership.
#[derive(Clone)]
pub struct TiledFile {
    pub(crate) inner: Arc<Mutex<TiledFileState>>,
    pub(crate) pool: Arc<TilePool>,
}

impl TiledFile {
    /// Opens (creating if necessary) a tiled file, verifying `magic`
    /// if the file already has content.
    pub fn open(
        pool: Arc<TilePool>,
        path: impl AsRef<Path>,
        magic: &[u8; 4],
        tile_size: usize,
        transactional: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let physical_size = file.metadata()?.len();

        if existed && physical_size >= 4 {
            let mut header = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            std::io::Read::read_exact(&mut file, &mut header)?;
            if &header != magic {
                return Err(StoreError::database(format!(
                    "bad magic in {}: expected {:?}, found {:?}",
                    path.display(),
                    magic,
                    header
                )));
            }
        } else {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(magic)?;
            file.sync_all()?;
        }

        let initial = if physical_size >= tile_size as u64 {
            let covered = physical_size - (physical_size % tile_size as u64);
            Some(InitialMapping {
                view: MappedView::map(file.as_raw_fd(), 0, covered as usize)?,
                covered,
            })
        } else {
            None
        };

        let state = TiledFileState {
            file,
            path,
            tile_size,
            physical_size,
            initial,
            tiles: Vec::new(),
            dirty: Vec::new(),
            scheduled: Vec::new(),
            backup: None,
            phase: CheckpointPhase::Idle,
            transactional,
            lock_pages: false,
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
            pool,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    pub fn physical_size(&self) -> u64 {
        self.inner.lock().physical_size
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.lock().dirty.is_empty()
    }

    pub fn set_lock_pages(&self, on: bool) {
        self.inner.lock().lock_pages = on;
    }

    pub fn enable_backup(&self, on: bool, log_dir: impl AsRef<Path>, stem: &str) -> Result<()> {
        self.enable_backup_with_sabotage(on, log_dir, stem, None)
    }

    /// Same as [`TiledFile::enable_backup`], but threading an explicit
    /// fault-injection handle (parsed once from the environment at
    /// `Database::open`, spec.md §6) into the backup log's `write`
    /// path instead of leaving it permanently disarmed.
    pub fn enable_backup_with_sabotage(
        &self,
        on: bool,
        log_dir: impl AsRef<Path>,
        stem: &str,
        sabotage: Option<Arc<Sabotage>>,
    ) -> Result<()> {
        let mut state = self.inner.lock();
        if on {
            let sabotage = sabotage.unwrap_or_else(|| Arc::new(Sabotage::disarmed()));
            state.backup = Some(BackupLog::with_sabotage(log_dir, stem, sabotage));
        } else {
            state.backup = None;
        }
        Ok(())
    }

    /// Replays a published backup log found at `log_dir/{stem}.cln`
    /// (or `.clx`, if a crash landed between publish and remove), per
    /// the open-time recovery contract in spec §4.2: a log whose
    /// horizon is below `caller_horizon` is stale and is discarded
    /// without touching the file; an unfinished log (placeholder
    /// horizon) is likewise discarded. Otherwise every record is
    /// written back through the tile manager in `BackupApply` mode
    /// (dirties the tile, does not re-enter the backup log). Those
    /// writes only land in each tile's heap-backed COW buffer, so
    /// before fsyncing the mapping they're pushed through the same
    /// dirty-to-scheduled-to-mapping flush the checkpoint engine uses
    /// (`snapshot_dirty_into_scheduled`/`remove_backup_log`, with no
    /// backup log of its own yet to retire at this point) and only
    /// then is the mapping fsynced and the log unlinked. Returns
    /// whether a replay actually happened.
    pub fn replay_backup_log(&self, log_dir: impl AsRef<Path>, stem: &str, caller_horizon: u64) -> Result<bool> {
        let log_dir = log_dir.as_ref();
        let Some((log_horizon, records)) = BackupLog::recoverable_records(log_dir, stem)? else {
            return Ok(false);
        };
        if log_horizon < caller_horizon {
            debug!(stem, log_horizon, caller_horizon, "stale backup log, discarding without replay");
        } else {
            for (offset, bytes) in &records {
                let (_, r) = self.get(*offset, *offset + bytes.len() as u64, AccessMode::BackupApply)?;
                self.put(*offset, &r, bytes)?;
                self.free(r);
            }
            self.snapshot_dirty_into_scheduled()?;
            self.remove_backup_log()?;
            self.fsync_mapping()?;
            debug!(stem, records = records.len(), "replayed backup log");
        }
        for ext in ["clx", "cln"] {
            let path = log_dir.join(format!("{stem}.{ext}"));
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(log_horizon >= caller_horizon)
    }

    fn tile_index_for(tile_size: usize, offset: u64) -> u32 {
        (offset / tile_size as u64) as u32
    }

    /// Reads `[s, e)`. `mode` selects the COW write path when
    /// transactional. Returns a pointer-free byte vector copy for
    /// reads and, for writes, leaves the caller to mutate via
    /// `write_at` with the returned reference.
    pub fn get(&self, s: u64, e: u64, mode: AccessMode) -> Result<(Vec<u8>, TileRef)> {
        debug_assert!(e > s, "empty or inverted range");
        let len = (e - s) as usize;
        {
            let state = self.inner.lock();
            debug_assert!(
                len as u64 <= state.tile_size as u64,
                "access must fit within a single tile"
            );
            let tile_idx = Self::tile_index_for(state.tile_size, s);
            let tile_start = tile_idx as u64 * state.tile_size as u64;
            let tile_end = tile_start + state.tile_size as u64;
            debug_assert!(e <= tile_end, "access must not cross a tile boundary");

            if mode == AccessMode::Read {
                if let Some(initial) = &state.initial {
                    if e <= initial.covered && !Self::has_tile(&state, tile_idx) {
                        let off = s as usize;
                        let bytes = initial.view.as_slice()[off..off + len].to_vec();
                        self.pool.account_initmap_borrow(len);
                        return Ok((bytes, TileRef::InitMap { size: len }));
                    }
                }
            }
        }

        self.materialize_and_access(s, e, mode)
    }

    fn has_tile(state: &TiledFileState, idx: u32) -> bool {
        state.tiles.get(idx as usize).map(|t| t.is_some()).unwrap_or(false)
    }

    fn materialize_and_access(&self, s: u64, e: u64, mode: AccessMode) -> Result<(Vec<u8>, TileRef)> {
        let (tile_idx, tile_offset, len, tile_size) = {
            let state = self.inner.lock();
            let tile_idx = Self::tile_index_for(state.tile_size, s);
            (tile_idx, (s % state.tile_size as u64) as usize, (e - s) as usize, state.tile_size)
        };

        self.pool.ensure_capacity(tile_size);
        self.materialize_tile(tile_idx)?;

        let mut state = self.inner.lock();
        let want_write = mode != AccessMode::Read;
        if want_write && state.transactional {
            self.cow_dirty(&mut state, tile_idx, tile_offset, tile_offset + len, mode)?;
        }

        let tile = state.tiles[tile_idx as usize].as_mut().expect("just materialized");
        tile.refcount += 1;
        let linked_size = tile_size.min(len.max(1));
        self.pool.account_link(linked_size);
        let bytes = tile.read_slice()[tile_offset..tile_offset + len].to_vec();
        Ok((bytes, TileRef::Tile { index: tile_idx, size: linked_size }))
    }

    /// Writes `data` into the tile referenced by `r`, which must have
    /// been obtained from `get`/`alloc` with a write mode. This is
    /// split from `get` because tile storage here returns owned
    /// copies rather than live pointers (see tile-references design
    /// note): callers read via `get`, then write back via `put`.
    pub fn put(&self, s: u64, r: &TileRef, data: &[u8]) -> Result<()> {
        let TileRef::Tile { index, .. } = r else {
            return Err(StoreError::database("cannot write through an init-map reference"));
        };
        let mut state = self.inner.lock();
        let tile_size = state.tile_size;
        let tile_offset = (s % tile_size as u64) as usize;
        let tile = state
            .tiles
            .get_mut(*index as usize)
            .and_then(|t| t.as_mut())
            .ok_or_else(|| StoreError::database("write to unmapped tile"))?;
        tile.write_slice()[tile_offset..tile_offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn materialize_tile(&self, idx: u32) -> Result<()> {
        let mut state = self.inner.lock();
        if (idx as usize) >= state.tiles.len() {
            state.tiles.resize_with(idx as usize + 1, || None);
        }
        if state.tiles[idx as usize].is_none() {
            let tile_size = state.tile_size;
            let offset = idx as u64 * tile_size as u64;
            if offset + tile_size as u64 > state.physical_size {
                self.grow_locked(&mut state, offset + tile_size as u64)?;
            }
            let fd = state.file.as_raw_fd();
            let view = MappedView::map(fd, offset as i64, tile_size)?;
            if state.lock_pages {
                if let Err(e) = view.lock_in_memory() {
                    warn!(path = %state.path.display(), error = %e, "mlock failed, continuing without it");
                }
            }
            let mut tile = Tile::new(idx, offset);
            tile.mapped = Some(view);
            state.tiles[idx as usize] = Some(tile);
            trace!(path = %state.path.display(), tile = idx, "materialized tile");
        }
        Ok(())
    }

    fn cow_dirty(
        &self,
        state: &mut TiledFileState,
        tile_idx: u32,
        start: usize,
        end: usize,
        mode: AccessMode,
    ) -> Result<()> {
        let page_size = crate::common::os_page_size();
        let backup_enabled = state.backup.is_some();
        let path = state.path.clone();
        let tile = state.tiles[tile_idx as usize].as_mut().unwrap();

        let was_clean = !tile.memory.is_dirty();
        if was_clean {
            let disk_bytes = tile.mapped.as_ref().unwrap().as_slice().to_vec().into_boxed_slice();
            tile.memory = match std::mem::replace(&mut tile.memory, TileMemory::Clean) {
                TileMemory::ScheduledClean(scheduled) => {
                    TileMemory::ScheduledDirty { memory: disk_bytes, scheduled }
                }
                _ => TileMemory::Dirty(disk_bytes),
            };
            state.dirty.push(tile_idx);
        }

        let first_dirty_in_tile = tile.dirty_bits == 0;
        tile.mark_dirty_range(page_size, start, end);

        if first_dirty_in_tile && backup_enabled && mode != AccessMode::BackupApply {
            let page_off = tile.file_offset + (start - (start % page_size)) as u64;
            let page = tile.mapped.as_ref().unwrap().as_slice()
                [start - (start % page_size)..start - (start % page_size) + page_size]
                .to_vec();
            let backup = state.backup.as_mut().unwrap();
            if backup.write(page_off, &page).is_err() {
                tile.advance_backup = false;
                debug!(path = %path.display(), tile = tile_idx, "deferred backup write, will retry at checkpoint");
            }
        }

        Ok(())
    }

    fn grow_locked(&self, state: &mut TiledFileState, min_size: u64) -> Result<()> {
        let new_size = round_up(min_size, state.tile_size as u64);
        if new_size <= state.physical_size {
            return Ok(());
        }
        // Sparse extension: write one byte at the new last offset.
        state.file.seek(SeekFrom::Start(new_size - 1))?;
        state.file.write_all(&[0u8])?;
        state.physical_size = new_size;

        if let Some(initial) = &state.initial {
            if new_size > initial.covered {
                let fd = state.file.as_raw_fd();
                let covered = new_size - (new_size % state.tile_size as u64);
                state.initial = Some(InitialMapping {
                    view: MappedView::map(fd, 0, covered as usize)?,
                    covered,
                });
            }
        }
        Ok(())
    }

    /// `alloc` extends the file to cover `e` before delegating to the
    /// same materialize-and-COW path as `get(..., WRITE)`.
    pub fn alloc(&self, s: u64, e: u64) -> Result<(Vec<u8>, TileRef)> {
        {
            let mut state = self.inner.lock();
            self.grow_locked(&mut state, e)?;
        }
        self.get(s, e, AccessMode::Write)
    }

    pub fn free(&self, r: TileRef) {
        match r {
            TileRef::InitMap { size } => self.pool.account_initmap_release(size),
            TileRef::Tile { index, size } => {
                let mut state = self.inner.lock();
                if let Some(tile) = state.tiles.get_mut(index as usize).and_then(|t| t.as_mut()) {
                    debug_assert!(tile.refcount > 0, "unbalanced free");
                    tile.refcount = tile.refcount.saturating_sub(1);
                    let evictable = tile.is_evictable();
                    self.pool.account_unlink(size);
                    if evictable {
                        self.pool.offer(self.inner.clone(), index);
                    }
                }
            }
        }
    }

    /// Duplicates a reference: bumps the tile's refcount (or, for an
    /// init-map borrow, just the pool's linked total) so the tile
    /// can't be evicted or the borrow double-released until both the
    /// original and the duplicate have been freed independently.
    pub fn link(&self, r: TileRef) -> TileRef {
        match r {
            TileRef::Tile { index, size } => {
                {
                    let mut state = self.inner.lock();
                    if let Some(tile) = state.tiles.get_mut(index as usize).and_then(|t| t.as_mut()) {
                        tile.refcount += 1;
                    }
                }
                self.pool.account_link(size);
            }
            TileRef::InitMap { size } => {
                self.pool.account_initmap_borrow(size);
            }
        }
        r
    }

    /// Borrow directly into the initial mapping, bypassing any tile
    /// table entry, iff that's safe (see module docs on `peek`).
    pub fn peek(&self, offset: u64, n: usize) -> Option<Vec<u8>> {
        let state = self.inner.lock();
        let initial = state.initial.as_ref()?;
        if offset + n as u64 > initial.covered {
            return None;
        }
        let tile_idx = Self::tile_index_for(state.tile_size, offset);
        let tile_end = (tile_idx as u64 + 1) * state.tile_size as u64;
        if offset + n as u64 > tile_end {
            return None; // crosses a tile boundary
        }
        if Self::has_tile(&state, tile_idx) {
            return None; // a materialized (possibly dirty) tile shadows this
        }
        Some(initial.view.as_slice()[offset as usize..offset as usize + n].to_vec())
    }

    /// Longest prefix of `[s, e)` that can be read without
    /// materializing a tile, for append-only sweeps.
    pub fn read_array(&self, s: u64, e: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cur = s;
        while cur < e {
            let want = ((e - cur) as usize).min(4096);
            match self.peek(cur, want) {
                Some(bytes) => {
                    out.extend_from_slice(&bytes);
                    cur += want as u64;
                }
                None => break,
            }
        }
        out
    }

    /// Refreshes the recorded physical size after an external writer
    /// grew or shrank the file, rebuilding the initial mapping with
    /// headroom if needed.
    pub fn stretch(&self) -> Result<()> {
        let mut state = self.inner.lock();
        let real_size = state.file.metadata()?.len();
        state.physical_size = real_size;
        let needs_rebuild = match &state.initial {
            None => real_size >= state.tile_size as u64,
            Some(initial) => real_size > initial.covered,
        };
        if needs_rebuild {
            let headroom = real_size + real_size * STRETCH_HEADROOM_PCT / 100;
            let covered = headroom - (headroom % state.tile_size as u64);
            let fd = state.file.as_raw_fd();
            if covered > 0 {
                state.initial = Some(InitialMapping {
                    view: MappedView::map(fd, 0, covered as usize)?,
                    covered,
                });
            }
        }
        Ok(())
    }

    pub fn dirty_tile_indices(&self) -> Vec<u32> {
        self.inner.lock().dirty.clone()
    }

    /// Fsyncs the backing file descriptor, durably persisting every
    /// mapping write made so far. Called from the fsync worker pool
    /// during checkpoint phase FINISH_WRITES, never on the calling
    /// thread directly.
    pub fn fsync_mapping(&self) -> Result<()> {
        let state = self.inner.lock();
        state.file.sync_all()?;
        Ok(())
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.inner.lock().phase
    }

    pub fn set_phase(&self, phase: CheckpointPhase) {
        self.inner.lock().phase = phase;
    }

    /// Checkpoint phase FINISH_BACKUP: any tile whose pre-image write
    /// was deferred (the backup log rejected it, e.g. under sabotage)
    /// gets retried synchronously. The pre-image is still available
    /// from the mapped view because `StartWrites` hasn't run yet.
    pub fn flush_pending_backup_writes(&self) -> Result<()> {
        let mut state = self.inner.lock();
        let page_size = crate::common::os_page_size();
        let TiledFileState { tiles, backup, dirty, .. } = &mut *state;
        let Some(backup) = backup.as_mut() else { return Ok(()) };
        for &idx in dirty.iter() {
            let tile = tiles[idx as usize].as_mut().expect("dirty tile must be materialized");
            if tile.advance_backup {
                continue;
            }
            let mut bits = tile.dirty_bits;
            let mut bit = 0u32;
            while bits != 0 {
                if bits & 1 != 0 {
                    let start = bit as usize * page_size;
                    let disk = tile.mapped.as_ref().unwrap().as_slice();
                    let end = (start + page_size).min(disk.len());
                    backup.write(tile.file_offset + start as u64, &disk[start..end])?;
                }
                bits >>= 1;
                bit += 1;
            }
            tile.advance_backup = true;
        }
        Ok(())
    }

    /// Checkpoint phase SYNC_BACKUP: fsync the backup log's data,
    /// stamp it with the new horizon, fsync again.
    pub fn sync_backup_and_stamp(&self, horizon: u64) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(backup) = state.backup.as_mut() {
            backup.sync_and_stamp(horizon)?;
        }
        Ok(())
    }

    /// Checkpoint phase START_WRITES: copies each dirty tile's heap
    /// buffer into its mapping and freezes a `scheduled` snapshot so
    /// concurrent writers (there are none in this engine's model, but
    /// the state machine supports it) can keep mutating `memory`.
    pub fn snapshot_dirty_into_scheduled(&self) -> Result<()> {
        let mut state = self.inner.lock();
        let dirty = std::mem::take(&mut state.dirty);
        for idx in dirty {
            let tile = state.tiles[idx as usize].as_mut().expect("dirty tile must be materialized");
            let buf = match std::mem::replace(&mut tile.memory, TileMemory::Clean) {
                TileMemory::Dirty(buf) => buf,
                TileMemory::ScheduledDirty { memory, .. } => memory,
                other => {
                    tile.memory = other;
                    continue;
                }
            };
            if let Some(mapped) = tile.mapped.as_mut() {
                mapped.as_mut_slice().copy_from_slice(&buf);
            }
            tile.scheduled_bits |= tile.dirty_bits;
            tile.dirty_bits = 0;
            tile.memory = TileMemory::ScheduledClean(buf);
            state.scheduled.push(idx);
        }
        Ok(())
    }

    /// Checkpoint phase REMOVE_BACKUP: once the mapping fsync from
    /// FINISH_WRITES is durable, the scheduled snapshots can be
    /// dropped and the backup log retired. Returns whether there was
    /// anything to remove (mirrors the ALREADY/Done outcome).
    pub fn remove_backup_log(&self) -> Result<bool> {
        let mut state = self.inner.lock();
        let had_scheduled = !state.scheduled.is_empty();
        let scheduled = std::mem::take(&mut state.scheduled);
        for idx in scheduled {
            if let Some(tile) = state.tiles[idx as usize].as_mut() {
                tile.scheduled_bits = 0;
                tile.memory = match std::mem::replace(&mut tile.memory, TileMemory::Clean) {
                    TileMemory::ScheduledClean(_) => TileMemory::Clean,
                    TileMemory::ScheduledDirty { memory, .. } => TileMemory::Dirty(memory),
                    other => other,
                };
            }
        }
        if let Some(backup) = state.backup.as_mut() {
            backup.retire()?;
        }
        Ok(had_scheduled)
    }
}

impl Drop for TiledFile {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.pool.forget_file(&self.inner);
            let state = self.inner.lock();
            if !state.dirty.is_empty() {
                warn!(path = %state.path.display(), "tiled file dropped with dirty tiles outstanding");
            }
            for tile in state.tiles.iter().flatten() {
                debug_assert_eq!(tile.refcount, 0, "tiled file destroyed with live tile references");
            }
        }
    }
}
