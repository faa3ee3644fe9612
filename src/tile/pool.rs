//! Process-wide tile pool: a soft byte cap shared by every open tiled
//! file, with LRU eviction of unreferenced tiles when the cap is hit.
//!
//! `linked` (bytes currently referenced by a live `TileRef`, including
//! init-map borrows) must never exceed `total` (bytes currently
//! mapped), and `total` is kept at or under `max` on a best-effort
//! basis: a single tile larger than `max` is still allowed to map (the
//! cap is soft, matching the original engine's behaviour of favouring
//! forward progress over strict enforcement).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::file::TiledFileState;

struct PoolState {
    total: u64,
    linked: u64,
    max: u64,
    free: VecDeque<(Arc<Mutex<TiledFileState>>, u32)>,
}

pub struct TilePool {
    state: Mutex<PoolState>,
}

impl TilePool {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            state: Mutex::new(PoolState {
                total: 0,
                linked: 0,
                max: max_bytes,
                free: VecDeque::new(),
            }),
        }
    }

    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    pub fn linked(&self) -> u64 {
        self.state.lock().linked
    }

    pub fn max(&self) -> u64 {
        self.state.lock().max
    }

    /// Called before materializing a new tile of `tile_size` bytes;
    /// evicts from the free list until there's room under `max`, or
    /// the free list runs dry (soft cap: mapping proceeds regardless).
    pub fn ensure_capacity(&self, tile_size: usize) {
        let tile_size = tile_size as u64;
        loop {
            let should_evict = {
                let state = self.state.lock();
                state.total + tile_size > state.max && !state.free.is_empty()
            };
            if !should_evict {
                break;
            }
            if !self.evict_one() {
                break;
            }
        }
        self.state.lock().total += tile_size;
    }

    fn evict_one(&self) -> bool {
        let entry = self.state.lock().free.pop_front();
        let Some((file_inner, idx)) = entry else { return false };
        let mut file_state = file_inner.lock();
        let tile_size = file_state.tile_size as u64;
        if let Some(tile) = file_state.tiles.get_mut(idx as usize).and_then(|t| t.take()) {
            if !tile.is_evictable() {
                // Re-referenced since it was offered; put the slot back
                // and keep whatever materialized it in place.
                file_state.tiles[idx as usize] = Some(tile);
                return true;
            }
            drop(tile); // unmaps on Drop
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(tile_size);
            drop(state);
            debug!(tile = idx, "evicted tile from pool");
            true
        } else {
            true
        }
    }

    /// Records that `bytes` worth of tile content now has a live
    /// reference (via `get`/`alloc`).
    pub fn account_link(&self, bytes: usize) {
        self.state.lock().linked += bytes as u64;
    }

    pub fn account_unlink(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.linked = state.linked.saturating_sub(bytes as u64);
    }

    /// Init-map borrows count toward `linked` without ever occupying
    /// a tile slot or `total`.
    pub fn account_initmap_borrow(&self, bytes: usize) {
        self.state.lock().linked += bytes as u64;
    }

    pub fn account_initmap_release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.linked = state.linked.saturating_sub(bytes as u64);
    }

    /// Offers a now-unreferenced tile to the free list for future
    /// eviction. Called by `TiledFile::free` once a tile's refcount
    /// drops to zero and it carries no dirty or scheduled pages.
    pub fn offer(&self, file_inner: Arc<Mutex<TiledFileState>>, idx: u32) {
        self.state.lock().free.push_back((file_inner, idx));
    }

    /// Drops every free-list entry belonging to `file_inner`, called
    /// when a tiled file is closing so the pool never holds a dangling
    /// reference into a file whose descriptor is about to close.
    pub fn forget_file(&self, file_inner: &Arc<Mutex<TiledFileState>>) {
        let mut state = self.state.lock();
        state.free.retain(|(f, _)| !Arc::ptr_eq(f, file_inner));
    }

    /// Raises the mlock ceiling check: if the kernel refuses to lock
    /// more pages, the pool permanently stops asking (matching the
    /// original's "disable after first failure" behaviour rather than
    /// retrying every call and spamming the log).
    pub fn report_mlock_failure(&self) {
        warn!("mlock ceiling reached, tile page locking disabled for this process");
    }
}
