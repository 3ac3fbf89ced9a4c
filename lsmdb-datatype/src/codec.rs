//! Comparison and hashing helpers on serialized keys.

use crate::error::Result;
use crate::serde::Serde;
use crate::value::Val;
use std::cmp::Ordering;

/// Compare a serialized string at given position with the probe string,
/// without materializing the serialized one.
///
/// Returns index after the serialized string and the ordering of
/// serialized string relative to probe.
#[inline]
pub fn compare_str_lazy(probe: &str, input: &[u8], start_idx: usize) -> Result<(usize, Ordering)> {
    let (idx, len) = input.deser_u32(start_idx)?;
    let (end_idx, stored) = input.deser_byte_slice(idx, len as usize)?;
    Ok((end_idx, stored.cmp(probe.as_bytes())))
}

/// Compare two key tuples column by column.
/// Only the common prefix of both tuples takes part in comparison,
/// so a partial key equals every full key starting with it.
#[inline]
pub fn compare_key_prefix(keys: &[Val], other: &[Val]) -> Result<Ordering> {
    for (k, o) in keys.iter().zip(other) {
        match k.compare(o)? {
            Ordering::Equal => (),
            ord => return Ok(ord),
        }
    }
    Ok(Ordering::Equal)
}

/// Compare two key tuples, shorter tuple is less if it is
/// a prefix of the longer one.
#[inline]
pub fn compare_keys(keys: &[Val], other: &[Val]) -> Result<Ordering> {
    match compare_key_prefix(keys, other)? {
        Ordering::Equal => Ok(keys.len().cmp(&other.len())),
        ord => Ok(ord),
    }
}

/// Hash of the leading `depth` key columns.
///
/// Keys must already be converted to column types, so that the same
/// logical key always produces the same encoded bytes.
#[inline]
pub fn hash_key_prefix(keys: &[Val], depth: usize) -> u32 {
    debug_assert!(depth <= keys.len());
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = Vec::new();
    for key in keys.iter().take(depth) {
        buf.clear();
        buf.resize(key.ser_len(), 0);
        key.ser(&mut buf, 0);
        hasher.update(&buf);
    }
    hasher.finalize()
}
