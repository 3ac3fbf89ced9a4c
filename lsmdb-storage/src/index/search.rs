//! Boundary expansion around a matching slot.
//!
//! A binary search stops at an arbitrary slot of a run of equal entries.
//! The helpers below widen that slot to the boundary of the run, given a
//! predicate that tells whether a slot still belongs to the run.
//! Slots of the run must be contiguous.

use crate::error::Result;

/// Find the leftmost matching slot, starting from a matching slot `pos`.
///
/// The step doubles after every match and halves after every mismatch,
/// so a run of length `n` costs `O(log n)` probes.
#[inline]
pub fn expand_left<F>(pos: usize, mut matches: F) -> Result<usize>
where
    F: FnMut(usize) -> Result<bool>,
{
    let mut low = pos;
    let mut step = 1usize;
    while step > 0 {
        if step <= low && matches(low - step)? {
            low -= step;
            step = step.saturating_mul(2);
        } else {
            step /= 2;
        }
    }
    Ok(low)
}

/// Find the rightmost matching slot below `count`, starting from a
/// matching slot `pos`. Walks one slot at a time.
#[inline]
pub fn expand_right<F>(pos: usize, count: usize, mut matches: F) -> Result<usize>
where
    F: FnMut(usize) -> Result<bool>,
{
    let mut high = pos;
    while high + 1 < count && matches(high + 1)? {
        high += 1;
    }
    Ok(high)
}
