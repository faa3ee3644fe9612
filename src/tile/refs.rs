//! Opaque tile references.
//!
//! A reference is either a real tile (reference-counted in the tile
//! table) or a direct borrow into a tiled file's initial mapping. The
//! two cases used to be folded into a single signed integer in the
//! original engine (negative meant "initial-map slice, payload is the
//! size"); here they're a proper sum type per the tile-references
//! design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRef {
    /// A live reference into tile `index` of the owning file. `size`
    /// is the number of bytes this particular reference accounted to
    /// the pool's `linked` total, so `free`/`link` can keep the
    /// counter exact regardless of how many bytes a given `get` call
    /// actually touched within the tile.
    Tile { index: u32, size: usize },
    /// A borrow directly into the initial mapping, not tracked in any
    /// tile's refcount. `size` lets `free` deduct the right number of
    /// bytes from the pool's `linked` counter.
    InitMap { size: usize },
}

impl TileRef {
    pub fn tile_index(&self) -> Option<u32> {
        match self {
            TileRef::Tile { index, .. } => Some(*index),
            TileRef::InitMap { .. } => None,
        }
    }
}

/// Access mode for a `get`/`alloc` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    /// Backup-log replay: dirties the tile but must not itself be
    /// logged to the backup log (would recurse).
    BackupApply,
}
