//! Tagged 40-bit values: slot tags and the multi-array fill-counter
//! sentinel, both packed as a 6-bit tag over a 34-bit payload.

use crate::common::MAX_ID;
use crate::error::{Result, StoreError};

use super::partition::IndexPartition;

pub const SLOT_EMPTY: u8 = 0;
pub const SLOT_SINGLETON: u8 = 1;
pub const SLOT_MULTI: u8 = 2;
pub const SLOT_BITMAP: u8 = 3;
pub const SLOT_LARGE: u8 = 4;

/// The multi-array's last entry doubles as a fill counter. `0x20`
/// (not full: payload is the element count); `0x00` (full: payload is
/// the last data element itself).
pub const SENTINEL_FULL: u8 = 0x00;
pub const SENTINEL_NOT_FULL: u8 = 0x20;

pub fn pack_tagged(tag: u8, payload: u64) -> u64 {
    debug_assert!(payload <= MAX_ID, "tagged payload must fit in 34 bits");
    ((tag as u64) << 34) | payload
}

pub fn unpack_tagged(word: u64) -> (u8, u64) {
    ((word >> 34) as u8, word & MAX_ID)
}

/// A `SLOT_MULTI` payload packs the array's size-class exponent into
/// its top 6 bits and the arena offset (in `ARENA_OFFSET_UNIT` units)
/// into the low 28, rather than recovering the exponent by probing
/// the arena at open time.
const MULTI_EXP_SHIFT: u32 = 28;
const MULTI_UNITS_MASK: u64 = (1u64 << MULTI_EXP_SHIFT) - 1;

pub fn pack_multi_slot(exp: u32, units: u64) -> u64 {
    debug_assert!(units <= MULTI_UNITS_MASK, "arena offset overflowed the multi-slot payload");
    ((exp as u64) << MULTI_EXP_SHIFT) | units
}

pub fn unpack_multi_slot(payload: u64) -> (u32, u64) {
    ((payload >> MULTI_EXP_SHIFT) as u32, payload & MULTI_UNITS_MASK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Done,
    /// The array was already at `2^exp` elements; the caller must
    /// grow to the next size class and retry.
    Full,
}

pub fn capacity(exp: u32) -> u64 {
    1u64 << exp
}

fn read_sentinel(partition: &IndexPartition, units: u64, exp: u32) -> Result<(u8, u64)> {
    let idx = capacity(exp) - 1;
    let word = partition.read_arena_entry(units, idx)?;
    Ok(unpack_tagged(word))
}

fn write_sentinel(partition: &IndexPartition, units: u64, exp: u32, tag: u8, payload: u64) -> Result<()> {
    let idx = capacity(exp) - 1;
    partition.write_arena_entry(units, idx, pack_tagged(tag, payload))
}

/// Number of live elements currently stored in the array.
pub fn count(partition: &IndexPartition, units: u64, exp: u32) -> Result<u64> {
    let (tag, payload) = read_sentinel(partition, units, exp)?;
    Ok(if tag == SENTINEL_NOT_FULL { payload } else { capacity(exp) })
}

/// The largest element currently stored, or `None` if the array is
/// empty (a fresh not-full array with count 0).
pub fn last_element(partition: &IndexPartition, units: u64, exp: u32) -> Result<Option<u64>> {
    let (tag, payload) = read_sentinel(partition, units, exp)?;
    if tag == SENTINEL_FULL {
        return Ok(Some(payload));
    }
    if payload == 0 {
        return Ok(None);
    }
    let word = partition.read_arena_entry(units, payload - 1)?;
    Ok(Some(word))
}

/// Reads every live element in ascending order.
pub fn read_all(partition: &IndexPartition, units: u64, exp: u32) -> Result<Vec<u64>> {
    let (tag, payload) = read_sentinel(partition, units, exp)?;
    let n = if tag == SENTINEL_NOT_FULL { payload } else { capacity(exp) - 1 };
    let mut out = if n > 0 { partition.read_arena(units, n)? } else { Vec::new() };
    if tag == SENTINEL_FULL {
        out.push(payload);
    }
    Ok(out)
}

/// Appends `target`, which the caller has already verified is
/// strictly greater than the current last element. Returns
/// [`AppendOutcome::Full`] without writing anything if the array has
/// no room left; the caller is responsible for growing to the next
/// size class (see `grow`) and retrying.
pub fn append(partition: &IndexPartition, units: u64, exp: u32, target: u64) -> Result<AppendOutcome> {
    let (tag, payload) = read_sentinel(partition, units, exp)?;
    if tag == SENTINEL_FULL {
        return Ok(AppendOutcome::Full);
    }
    let count = payload;
    let cap = capacity(exp);
    if count == cap - 1 {
        // Writing at index `count` would land on the sentinel's own
        // slot: this element becomes the sentinel itself, in its
        // tag-zero ("full") form.
        write_sentinel(partition, units, exp, SENTINEL_FULL, target)?;
    } else {
        partition.write_arena_entry(units, count, pack_tagged(0, target))?;
        write_sentinel(partition, units, exp, SENTINEL_NOT_FULL, count + 1)?;
    }
    Ok(AppendOutcome::Done)
}

/// Initializes a freshly allocated block of `2^exp` slots with a
/// single element, used when a singleton promotes to a 2-element
/// multi array.
pub fn init_with_first_element(partition: &IndexPartition, units: u64, exp: u32, first: u64) -> Result<()> {
    partition.write_arena(units, &[pack_tagged(0, first)])?;
    write_sentinel(partition, units, exp, SENTINEL_NOT_FULL, 1)
}

/// Allocates a block for the next size class, copies every element of
/// the full array at `(units, exp)` into its first half, and releases
/// the old block back to its free list. Returns the new block's units
/// and exponent; the caller still owes the actual new element.
pub fn grow(partition: &IndexPartition, units: u64, exp: u32) -> Result<(u64, u32)> {
    let elements = read_all(partition, units, exp)?;
    if elements.len() as u64 != capacity(exp) {
        return Err(StoreError::database("grow called on a non-full multi array"));
    }
    let new_exp = exp + 1;
    let new_units = partition.alloc_block(new_exp)?;
    let tagged: Vec<u64> = elements.iter().map(|e| pack_tagged(0, *e)).collect();
    partition.write_arena(new_units, &tagged)?;
    write_sentinel(partition, new_units, new_exp, SENTINEL_NOT_FULL, elements.len() as u64)?;
    partition.free_block(exp, units)?;
    Ok((new_units, new_exp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let w = pack_tagged(SLOT_SINGLETON, 12345);
        assert_eq!(unpack_tagged(w), (SLOT_SINGLETON, 12345));
    }

    #[test]
    fn sentinel_tags_match_spec_literal_values() {
        assert_eq!(SENTINEL_FULL, 0x00);
        assert_eq!(SENTINEL_NOT_FULL, 0x20);
    }
}
