//! A single tile: its mapped view, its copy-on-write state, and the
//! per-page dirty/scheduled bitmaps.

use std::ptr::NonNull;

/// A page-granularity bitset sized for one tile. 64 bits covers tiles
/// up to 64 OS pages, comfortably more than the default 16-page tile.
pub type PageBits = u64;

/// A raw `mmap`'d view of one tile's worth of a file, unmapped on drop.
pub struct MappedView {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by the `Tile` that holds
// it; the underlying memory is only ever touched by the single writer
// thread (reader processes map their own independent view).
unsafe impl Send for MappedView {}

impl MappedView {
    /// Maps `len` bytes of `fd` starting at `offset`, which must be
    /// page-aligned.
    pub fn map(fd: i32, offset: i64, len: usize) -> std::io::Result<Self> {
        // SAFETY: fd is a valid, open file descriptor for the
        // lifetime of this mapping; offset/len are caller-checked to
        // be page-aligned and within the file (the tile manager
        // extends the file before mapping new tiles).
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null without MAP_FAILED"),
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a valid mapping for the lifetime
        // of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; exclusive borrow guarantees no alias.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn lock_in_memory(&self) -> std::io::Result<()> {
        // SAFETY: ptr/len describe a valid mapping.
        let rc = unsafe { libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.len) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap of this exact size.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// The copy-on-write state of one tile's memory.
///
/// `disk` is always the memory-mapped view of the file. `memory` is
/// what reads/writes actually touch: for a clean tile it *is* `disk`;
/// once dirtied it is a heap clone that gets copied back into `disk`
/// at checkpoint phase 3. `scheduled` is a second, frozen clone taken
/// at phase 1 so that writes arriving during phases 2-4 can keep
/// mutating `memory` without disturbing the snapshot being flushed.
pub enum TileMemory {
    /// `memory == disk`; no heap buffer.
    Clean,
    /// `memory` is a heap clone of `disk`, mutated in place.
    Dirty(Box<[u8]>),
    /// A checkpoint has snapshotted this tile's dirty pages into
    /// `scheduled` and cleared `dirty_bits`; `memory` still equals
    /// `disk` because nothing has re-dirtied the tile since.
    ScheduledClean(Box<[u8]>),
    /// A checkpoint snapshot is in flight (`scheduled`) *and* new
    /// writes have re-dirtied the tile into a fresh `memory` buffer.
    ScheduledDirty { memory: Box<[u8]>, scheduled: Box<[u8]> },
}

impl TileMemory {
    pub fn is_dirty(&self) -> bool {
        matches!(self, TileMemory::Dirty(_) | TileMemory::ScheduledDirty { .. })
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, TileMemory::ScheduledClean(_) | TileMemory::ScheduledDirty { .. })
    }
}

pub struct Tile {
    pub index: u32,
    /// Byte offset of this tile within the backing file.
    pub file_offset: u64,
    /// The mapped view of `disk`; `None` until first accessed.
    pub mapped: Option<MappedView>,
    pub memory: TileMemory,
    pub dirty_bits: PageBits,
    pub scheduled_bits: PageBits,
    pub refcount: u32,
    /// Set the first time a page in this tile is dirtied since the
    /// last checkpoint finished; cleared once the backup log has a
    /// durable copy of the pre-image. See `TiledFile::get` write path.
    pub advance_backup: bool,
}

impl Tile {
    pub fn new(index: u32, file_offset: u64) -> Self {
        Self {
            index,
            file_offset,
            mapped: None,
            memory: TileMemory::Clean,
            dirty_bits: 0,
            scheduled_bits: 0,
            refcount: 0,
            advance_backup: true,
        }
    }

    pub fn is_evictable(&self) -> bool {
        self.refcount == 0 && self.dirty_bits == 0 && self.scheduled_bits == 0
    }

    /// Bit index for the page containing byte `offset_in_tile`.
    pub fn page_bit(page_size: usize, offset_in_tile: usize) -> u32 {
        (offset_in_tile / page_size) as u32
    }

    /// Sets the dirty bits for every page overlapping `[start, end)`
    /// (offsets relative to the tile start).
    pub fn mark_dirty_range(&mut self, page_size: usize, start: usize, end: usize) {
        let first = Self::page_bit(page_size, start);
        let last = Self::page_bit(page_size, end.saturating_sub(1).max(start));
        for bit in first..=last {
            self.dirty_bits |= 1u64 << bit;
        }
    }

    /// Returns a readable view into `memory` (whichever buffer is
    /// currently live), falling back to `disk` when clean.
    pub fn read_slice(&self) -> &[u8] {
        match &self.memory {
            TileMemory::Clean | TileMemory::ScheduledClean(_) => {
                self.mapped.as_ref().expect("tile materialized before read").as_slice()
            }
            TileMemory::Dirty(buf) => buf,
            TileMemory::ScheduledDirty { memory, .. } => memory,
        }
    }

    pub fn write_slice(&mut self) -> &mut [u8] {
        match &mut self.memory {
            TileMemory::Dirty(buf) => buf,
            TileMemory::ScheduledDirty { memory, .. } => memory,
            TileMemory::Clean | TileMemory::ScheduledClean(_) => {
                panic!("write_slice called on a tile without a dirty buffer")
            }
        }
    }
}
