//! Shared constants and id/horizon vocabulary.
//!
//! Every identifier in the engine lives in `[0, 2^34)`; every
//! checkpoint horizon in `[0, 2^40)`. Keeping both as plain `u64`
//! (masked at the boundary) avoids a bespoke integer type while still
//! making the valid range explicit at each call site.

/// Number of bits in an identifier.
pub const ID_BITS: u32 = 34;
/// Largest valid identifier, inclusive.
pub const MAX_ID: u64 = (1u64 << ID_BITS) - 1;
/// Mask isolating the low 34 bits of a tagged slot value.
pub const ID_MASK: u64 = MAX_ID;

/// Number of bits in a checkpoint horizon.
pub const HORIZON_BITS: u32 = 40;
/// Horizon value reserved to mean "log not yet finished".
pub const HORIZON_PLACEHOLDER: u64 = (1u64 << HORIZON_BITS) - 1;

/// Bits of identifier space covered by one partition (2^24).
pub const PARTITION_ID_BITS: u32 = 24;
/// Number of identifiers in one partition.
pub const SLOTS_PER_PARTITION: u64 = 1u64 << PARTITION_ID_BITS;
/// Maximum number of partitions a database may hold.
pub const MAX_PARTITIONS: usize = 1024;

/// Size classes for multi-arrays: 2, 4, 8, ..., 2^34 entries.
pub const MAX_MULTI_EXP: u32 = ID_BITS;
/// Bytes per overflow-arena entry (one tagged 40-bit target id).
pub const ARENA_ENTRY_BYTES: u64 = 5;
/// Arena offsets are stored as multiples of this many bytes.
pub const ARENA_OFFSET_UNIT: u64 = 10;

/// Default soft limit on concurrently open large-array files.
pub const DEFAULT_LARGE_FILE_SOFT_LIMIT: usize = 5000;

/// Marker-file policy: prefer a full rewrite over an append every this
/// many appended records.
pub const MARKER_APPEND_THRESHOLD: u32 = 800;

pub const MAGIC_INDEX_PARTITION: &[u8; 4] = b"ag4p";
pub const MAGIC_PRIMITIVE_PARTITION: &[u8; 4] = b"ap1d";
pub const MAGIC_PRIMITIVE_MARKER_NEXT: &[u8; 4] = b"ai1i";
pub const MAGIC_PRIMITIVE_MARKER_HORIZON: &[u8; 4] = b"ai1h";
pub const MAGIC_INDEX_MARKER_HORIZON: &[u8; 4] = b"ag4h";
pub const MAGIC_BACKUP_LOG: &[u8; 4] = b"ab1t";
pub const MAGIC_LARGE_ARRAY: &[u8; 4] = b"lfv2";
pub const MAGIC_BITMAP: &[u8; 4] = b"bgm1";

/// Returns the OS page size in bytes.
pub fn os_page_size() -> usize {
    // SAFETY: sysconf with a valid name is always safe to call.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

/// Default tile size: 16 OS pages, a multiple of the page size as
/// required by the tile contract.
pub fn default_tile_size() -> usize {
    os_page_size() * 16
}

/// Checks that `id` is within the valid 34-bit identifier space.
#[inline]
pub fn is_valid_id(id: u64) -> bool {
    id <= MAX_ID
}

/// Rounds `value` up to the next multiple of `granularity`.
#[inline]
pub fn round_up(value: u64, granularity: u64) -> u64 {
    debug_assert!(granularity > 0);
    let rem = value % granularity;
    if rem == 0 {
        value
    } else {
        value + (granularity - rem)
    }
}
