use crate::error::Result;
use crate::index::page_iter::{IndexEntry, PageIterator};
use lsmdb_datatype::{Val, compare_key_prefix, compare_keys};
use std::cmp::Ordering;
use std::ops::Bound;

/// K-way merge over page iterators.
///
/// Every page is sorted on its own but pages are not sorted against each
/// other, so each step picks the smallest (or largest for descending
/// order) current key among all open iterators. Iterators are kept in page
/// order and equal keys are taken from the lower page first.
/// Removed entries are already gone from the pointer arrays, but stale
/// duplicates across pages are returned as they are.
pub struct MergeCursor {
    iters: Vec<PageIterator>,
    ascending: bool,
    to: Bound<Vec<Val>>,
}

impl MergeCursor {
    /// Create a cursor over already positioned iterators.
    /// Iterators which are exhausted or beyond `to` are closed immediately.
    #[inline]
    pub fn new(iters: Vec<PageIterator>, ascending: bool, to: Bound<Vec<Val>>) -> Result<Self> {
        let mut open = Vec::with_capacity(iters.len());
        for iter in iters {
            if Self::within_bound(&iter, ascending, &to)? {
                open.push(iter);
            }
        }
        Ok(MergeCursor {
            iters: open,
            ascending,
            to,
        })
    }

    #[inline]
    fn within_bound(iter: &PageIterator, ascending: bool, to: &Bound<Vec<Val>>) -> Result<bool> {
        let Some(keys) = iter.keys() else {
            return Ok(false);
        };
        let res = match to {
            Bound::Unbounded => true,
            Bound::Included(bound) => {
                let ord = compare_key_prefix(keys, bound)?;
                if ascending {
                    ord != Ordering::Greater
                } else {
                    ord != Ordering::Less
                }
            }
            Bound::Excluded(bound) => {
                let ord = compare_key_prefix(keys, bound)?;
                if ascending {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                }
            }
        };
        Ok(res)
    }

    /// Number of iterators still open.
    #[inline]
    pub fn open_iterators(&self) -> usize {
        self.iters.len()
    }

    #[inline]
    fn select(&self) -> Result<Option<usize>> {
        let mut best: Option<(usize, &[Val])> = None;
        for (idx, iter) in self.iters.iter().enumerate() {
            let Some(keys) = iter.keys() else {
                continue;
            };
            match best {
                None => best = Some((idx, keys)),
                Some((_, best_keys)) => {
                    let ord = compare_keys(keys, best_keys)?;
                    if (self.ascending && ord == Ordering::Less)
                        || (!self.ascending && ord == Ordering::Greater)
                    {
                        best = Some((idx, keys));
                    }
                }
            }
        }
        Ok(best.map(|(idx, _)| idx))
    }

    #[inline]
    fn step(&mut self) -> Result<Option<IndexEntry>> {
        let Some(idx) = self.select()? else {
            self.iters.clear();
            return Ok(None);
        };
        let entry = self.iters[idx].take_entry()?;
        if !Self::within_bound(&self.iters[idx], self.ascending, &self.to)? {
            self.iters.remove(idx);
        }
        Ok(entry)
    }

    /// Returns next entry in global order.
    #[inline]
    pub fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        let res = self.step();
        if res.is_err() {
            // no further entries after a failure.
            self.iters.clear();
        }
        res
    }
}

impl Iterator for MergeCursor {
    type Item = Result<IndexEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
