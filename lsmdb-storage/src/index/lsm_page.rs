//! Layout of LSM index pages.
//!
//! Every page starts with a header:
//!
//! ```text
//! [entry count: i32][free offset: i32][bloom seed: i32][bloom bitmap: bf_size bytes]
//! ```
//!
//! The first page of an index file additionally persists the index layout:
//!
//! ```text
//! [key count: u8][key type: u8 x n][value type: u8][bloom key depth: u8]
//! ```
//!
//! After the header comes the pointer array, one i32 offset per entry,
//! sorted by key. Entries are stored from the end of the page backward,
//! each one being the serialized key columns followed by the serialized
//! value. Removal only drops the pointer, entry bytes stay until the
//! page is rewritten by compaction.

use crate::error::{Error, Result};
use crate::file::PageNo;
use crate::index::bloom::BloomFilter;
use crate::index::search::{expand_left, expand_right};
use lsmdb_datatype::serde::Serde;
use lsmdb_datatype::{Val, ValKind, compare_str_lazy};
use std::cmp::Ordering;
use std::mem;

const OFFSET_ENTRY_COUNT: usize = 0;
const OFFSET_FREE: usize = 4;
const OFFSET_BLOOM_SEED: usize = 8;
const OFFSET_BLOOM: usize = 12;

pub const POINTER_SIZE: usize = mem::size_of::<i32>();
pub const MIN_PAGE_SIZE: usize = 64;
pub const MAX_KEY_COLUMNS: usize = u8::MAX as usize;

/// Column types and sizes shared by all pages of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLayout {
    page_size: usize,
    bf_size: usize,
    key_types: Vec<ValKind>,
    value_type: ValKind,
    bloom_key_depth: usize,
}

impl PageLayout {
    #[inline]
    pub fn new(
        page_size: usize,
        key_types: Vec<ValKind>,
        value_type: ValKind,
        bloom_key_depth: usize,
    ) -> Result<Self> {
        if key_types.is_empty() {
            return Err(Error::EmptyKey);
        }
        if key_types.len() > MAX_KEY_COLUMNS {
            return Err(Error::InvalidArgument);
        }
        if bloom_key_depth > key_types.len() {
            return Err(Error::InvalidBloomKeyDepth {
                depth: bloom_key_depth,
                arity: key_types.len(),
            });
        }
        if !(MIN_PAGE_SIZE..=i32::MAX as usize).contains(&page_size) {
            return Err(Error::InvalidPageSize(page_size));
        }
        let layout = PageLayout {
            page_size,
            bf_size: page_size / 15 / 8 * 8,
            key_types,
            value_type,
            bloom_key_depth,
        };
        if layout.header_size(0) + POINTER_SIZE >= page_size {
            return Err(Error::InvalidPageSize(page_size));
        }
        Ok(layout)
    }

    /// Load layout persisted in the first page.
    #[inline]
    pub fn read(page_size: usize, page0: &[u8]) -> Result<Self> {
        if page0.len() != page_size || page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidFormat);
        }
        let bf_size = page_size / 15 / 8 * 8;
        let (mut idx, key_count) = page0.deser_u8(OFFSET_BLOOM + bf_size)?;
        let mut key_types = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            let (next, tag) = page0.deser_u8(idx)?;
            idx = next;
            key_types.push(ValKind::try_from(tag)?);
        }
        let (idx, value_tag) = page0.deser_u8(idx)?;
        let (_, depth) = page0.deser_u8(idx)?;
        PageLayout::new(
            page_size,
            key_types,
            ValKind::try_from(value_tag)?,
            depth as usize,
        )
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn bf_size(&self) -> usize {
        self.bf_size
    }

    #[inline]
    pub fn key_types(&self) -> &[ValKind] {
        &self.key_types
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.key_types.len()
    }

    #[inline]
    pub fn value_type(&self) -> ValKind {
        self.value_type
    }

    #[inline]
    pub fn bloom_key_depth(&self) -> usize {
        self.bloom_key_depth
    }

    #[inline]
    pub fn header_size(&self, page_no: PageNo) -> usize {
        let base = OFFSET_BLOOM + self.bf_size;
        if page_no == 0 {
            base + 1 + self.key_types.len() + 1 + 1
        } else {
            base
        }
    }

    #[inline]
    pub fn entry_len(&self, keys: &[Val], value: &Val) -> usize {
        keys.iter().map(Val::ser_len).sum::<usize>() + value.ser_len()
    }

    /// Largest entry an empty page can hold.
    #[inline]
    pub fn max_entry_len(&self) -> usize {
        self.page_size - self.header_size(1) - POINTER_SIZE
    }

    /// Initialize header of a new page.
    #[inline]
    pub fn init_page(&self, page_no: PageNo, data: &mut [u8], seed: u32) {
        debug_assert_eq!(data.len(), self.page_size);
        data[..self.header_size(page_no)].fill(0);
        data.ser_i32(OFFSET_ENTRY_COUNT, 0);
        data.ser_i32(OFFSET_FREE, self.page_size as i32);
        data.ser_u32(OFFSET_BLOOM_SEED, seed);
        if page_no == 0 {
            let mut idx = data.ser_u8(OFFSET_BLOOM + self.bf_size, self.key_types.len() as u8);
            for kind in &self.key_types {
                idx = data.ser_u8(idx, *kind as u8);
            }
            idx = data.ser_u8(idx, self.value_type as u8);
            data.ser_u8(idx, self.bloom_key_depth as u8);
        }
    }
}

/// Result of binary search inside one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// Boundary slot of the matching run and offset of its value.
    Found { slot: usize, value_offset: usize },
    /// Slot where the probe would be inserted.
    NotFound { slot: usize },
}

/// View of one index page over its bytes.
pub struct LsmPage<'a, B> {
    layout: &'a PageLayout,
    page_no: PageNo,
    data: B,
}

impl<'a, B: AsRef<[u8]>> LsmPage<'a, B> {
    /// Create a view after checking header consistency.
    #[inline]
    pub fn new(layout: &'a PageLayout, page_no: PageNo, data: B) -> Result<Self> {
        let page = LsmPage {
            layout,
            page_no,
            data,
        };
        page.validate()?;
        Ok(page)
    }

    /// Create a view over bytes already validated.
    #[inline]
    pub(crate) fn new_unchecked(layout: &'a PageLayout, page_no: PageNo, data: B) -> Self {
        LsmPage {
            layout,
            page_no,
            data,
        }
    }

    fn validate(&self) -> Result<()> {
        let bytes = self.data.as_ref();
        if bytes.len() != self.layout.page_size {
            return Err(Error::InvalidFormat);
        }
        let (_, count) = bytes.deser_i32(OFFSET_ENTRY_COUNT)?;
        let (_, free) = bytes.deser_i32(OFFSET_FREE)?;
        if count < 0 || free < 0 {
            return Err(Error::InvalidFormat);
        }
        let pointer_end = self.pointer_base() + count as usize * POINTER_SIZE;
        if pointer_end > free as usize || free as usize > self.layout.page_size {
            return Err(Error::InvalidFormat);
        }
        Ok(())
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    #[inline]
    fn read_i32(&self, idx: usize) -> i32 {
        let b = self.bytes();
        i32::from_le_bytes([b[idx], b[idx + 1], b[idx + 2], b[idx + 3]])
    }

    #[inline]
    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.read_i32(OFFSET_ENTRY_COUNT) as usize
    }

    #[inline]
    pub fn free_offset(&self) -> usize {
        self.read_i32(OFFSET_FREE) as usize
    }

    #[inline]
    pub fn seed(&self) -> u32 {
        self.read_i32(OFFSET_BLOOM_SEED) as u32
    }

    #[inline]
    fn pointer_base(&self) -> usize {
        self.layout.header_size(self.page_no)
    }

    #[inline]
    fn pointers(&self) -> &[[u8; POINTER_SIZE]] {
        let base = self.pointer_base();
        bytemuck::cast_slice(&self.bytes()[base..base + self.count() * POINTER_SIZE])
    }

    /// Offset of the entry referenced by given slot.
    #[inline]
    pub fn entry_offset(&self, slot: usize) -> Result<usize> {
        let offset = i32::from_le_bytes(self.pointers()[slot]);
        if offset < 0
            || (offset as usize) < self.free_offset()
            || offset as usize >= self.layout.page_size
        {
            return Err(Error::InvalidFormat);
        }
        Ok(offset as usize)
    }

    #[inline]
    pub fn bloom(&self) -> BloomFilter<&[u8]> {
        let bits = if self.layout.bloom_key_depth == 0 {
            &[][..]
        } else {
            &self.bytes()[OFFSET_BLOOM..OFFSET_BLOOM + self.layout.bf_size]
        };
        BloomFilter::new(bits, self.seed())
    }

    /// Compare stored keys at given offset with the probe.
    /// Only columns present in the probe are compared.
    /// Probe values must have the column types.
    #[inline]
    pub fn compare_entry(&self, offset: usize, probe: &[Val]) -> Result<Ordering> {
        let bytes = self.bytes();
        let mut idx = offset;
        for (kind, key) in self.layout.key_types.iter().zip(probe) {
            let ord = match (kind, key) {
                (ValKind::Str, Val::Str(s)) => {
                    let (next, ord) = compare_str_lazy(s, bytes, idx)?;
                    idx = next;
                    ord
                }
                _ => {
                    let (next, stored) = Val::deser(*kind, bytes, idx)?;
                    idx = next;
                    stored.compare(key)?
                }
            };
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }

    #[inline]
    pub fn matches(&self, slot: usize, probe: &[Val]) -> Result<bool> {
        let ord = self.compare_entry(self.entry_offset(slot)?, probe)?;
        Ok(ord == Ordering::Equal)
    }

    /// Read all key columns of the entry, returns keys and value offset.
    #[inline]
    pub fn read_keys(&self, offset: usize) -> Result<(Vec<Val>, usize)> {
        let bytes = self.bytes();
        let mut idx = offset;
        let mut keys = Vec::with_capacity(self.layout.key_types.len());
        for kind in &self.layout.key_types {
            let (next, key) = Val::deser(*kind, bytes, idx)?;
            idx = next;
            keys.push(key);
        }
        Ok((keys, idx))
    }

    #[inline]
    pub fn value_offset(&self, offset: usize) -> Result<usize> {
        let mut idx = offset;
        for kind in &self.layout.key_types {
            idx = Val::skip(*kind, self.bytes(), idx)?;
        }
        Ok(idx)
    }

    #[inline]
    pub fn read_value(&self, value_offset: usize) -> Result<Val> {
        let (_, value) = Val::deser(self.layout.value_type, self.bytes(), value_offset)?;
        Ok(value)
    }

    #[inline]
    pub fn value_len(&self, value_offset: usize) -> Result<usize> {
        Ok(Val::skip(self.layout.value_type, self.bytes(), value_offset)? - value_offset)
    }

    /// Binary search for the probe.
    ///
    /// The probe may have fewer columns than the index. When it matches,
    /// the result is widened to the boundary of the matching run: the
    /// leftmost slot for ascending order, the rightmost for descending.
    #[inline]
    pub fn lookup(&self, probe: &[Val], ascending: bool) -> Result<LookupResult> {
        let count = self.count();
        let (mut low, mut high) = (0, count);
        while low < high {
            let mid = low + (high - low) / 2;
            match self.compare_entry(self.entry_offset(mid)?, probe)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => {
                    let slot = if ascending {
                        expand_left(mid, |i| self.matches(i, probe))?
                    } else {
                        expand_right(mid, count, |i| self.matches(i, probe))?
                    };
                    let value_offset = self.value_offset(self.entry_offset(slot)?)?;
                    return Ok(LookupResult::Found { slot, value_offset });
                }
            }
        }
        Ok(LookupResult::NotFound { slot: low })
    }

    /// Returns true if an entry of given length fits into the free gap.
    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        let free = self.free_offset();
        let pointer_end = self.pointer_base() + (self.count() + 1) * POINTER_SIZE;
        free >= len && free - len >= pointer_end
    }
}

impl<'a, B: AsRef<[u8]> + AsMut<[u8]>> LsmPage<'a, B> {
    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    #[inline]
    fn set_count(&mut self, count: usize) {
        self.bytes_mut().ser_i32(OFFSET_ENTRY_COUNT, count as i32);
    }

    #[inline]
    fn set_free_offset(&mut self, offset: usize) {
        self.bytes_mut().ser_i32(OFFSET_FREE, offset as i32);
    }

    /// Insert entry so that its pointer lands at given slot.
    /// Returns false if page has no room for it.
    #[inline]
    pub fn insert_at(&mut self, slot: usize, keys: &[Val], value: &Val) -> bool {
        let len = self.layout.entry_len(keys, value);
        if !self.fits(len) {
            return false;
        }
        let count = self.count();
        debug_assert!(slot <= count);
        let free = self.free_offset();
        let new_free = free - len;
        let base = self.pointer_base();
        let bytes = self.bytes_mut();
        let mut idx = new_free;
        for key in keys {
            idx = key.ser(bytes, idx);
        }
        idx = value.ser(bytes, idx);
        debug_assert_eq!(idx, free);
        let pos = base + slot * POINTER_SIZE;
        let end = base + count * POINTER_SIZE;
        bytes.copy_within(pos..end, pos + POINTER_SIZE);
        bytes.ser_i32(pos, new_free as i32);
        self.set_count(count + 1);
        self.set_free_offset(new_free);
        true
    }

    /// Append entry after the last slot, input must arrive sorted.
    #[inline]
    pub fn append(&mut self, keys: &[Val], value: &Val) -> bool {
        let count = self.count();
        self.insert_at(count, keys, value)
    }

    /// Remove slots in range `start..end`, entry bytes are kept.
    #[inline]
    pub fn remove_range(&mut self, start: usize, end: usize) {
        let count = self.count();
        debug_assert!(start <= end && end <= count);
        let base = self.pointer_base();
        self.bytes_mut().copy_within(
            base + end * POINTER_SIZE..base + count * POINTER_SIZE,
            base + start * POINTER_SIZE,
        );
        self.set_count(count - (end - start));
    }

    /// Overwrite value in place, caller guarantees same encoded length.
    #[inline]
    pub fn overwrite_value(&mut self, value_offset: usize, value: &Val) {
        value.ser(self.bytes_mut(), value_offset);
    }

    #[inline]
    pub fn add_to_bloom(&mut self, hash: u32) {
        if self.layout.bloom_key_depth == 0 {
            return;
        }
        let seed = self.seed();
        let bf_size = self.layout.bf_size;
        let bits = &mut self.bytes_mut()[OFFSET_BLOOM..OFFSET_BLOOM + bf_size];
        BloomFilter::new(bits, seed).add(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsmdb_datatype::{RecordID, hash_key_prefix};

    fn rid(n: i64) -> Val {
        Val::Rid(RecordID::new(1, n))
    }

    fn insert<B: AsRef<[u8]> + AsMut<[u8]>>(page: &mut LsmPage<B>, keys: Vec<Val>, value: Val) {
        match page.lookup(&keys, true).unwrap() {
            LookupResult::NotFound { slot } => assert!(page.insert_at(slot, &keys, &value)),
            LookupResult::Found { .. } => panic!("key already exists"),
        }
    }

    fn page_keys<B: AsRef<[u8]>>(page: &LsmPage<B>) -> Vec<Vec<Val>> {
        (0..page.count())
            .map(|i| page.read_keys(page.entry_offset(i).unwrap()).unwrap().0)
            .collect()
    }

    #[test]
    fn test_layout_header() {
        let layout =
            PageLayout::new(4096, vec![ValKind::I64, ValKind::Str], ValKind::Rid, 1).unwrap();
        assert_eq!(layout.bf_size(), 4096 / 15 / 8 * 8);
        assert_eq!(layout.header_size(1), 12 + layout.bf_size());
        assert_eq!(layout.header_size(0), 12 + layout.bf_size() + 5);

        let mut data = vec![0u8; 4096];
        layout.init_page(0, &mut data, 99);
        let loaded = PageLayout::read(4096, &data).unwrap();
        assert_eq!(loaded, layout);
        let page = LsmPage::new(&layout, 0, &data[..]).unwrap();
        assert_eq!(page.count(), 0);
        assert_eq!(page.free_offset(), 4096);
        assert_eq!(page.seed(), 99);
    }

    #[test]
    fn test_layout_validation() {
        assert!(matches!(
            PageLayout::new(4096, vec![], ValKind::Rid, 0),
            Err(Error::EmptyKey)
        ));
        assert!(matches!(
            PageLayout::new(4096, vec![ValKind::I32], ValKind::Rid, 2),
            Err(Error::InvalidBloomKeyDepth { depth: 2, arity: 1 })
        ));
        assert!(matches!(
            PageLayout::new(32, vec![ValKind::I32], ValKind::Rid, 1),
            Err(Error::InvalidPageSize(32))
        ));
        let mut data = vec![0u8; 128];
        data[12 + 8] = 1;
        data[12 + 8 + 1] = 42;
        assert!(PageLayout::read(128, &data).is_err());
    }

    #[test]
    fn test_corrupted_header() {
        let layout = PageLayout::new(128, vec![ValKind::I32], ValKind::Rid, 1).unwrap();
        let mut data = vec![0u8; 128];
        layout.init_page(1, &mut data, 0);
        data.ser_i32(OFFSET_ENTRY_COUNT, 100);
        assert!(LsmPage::new(&layout, 1, &data[..]).is_err());
        data.ser_i32(OFFSET_ENTRY_COUNT, -1);
        assert!(LsmPage::new(&layout, 1, &data[..]).is_err());
    }

    #[test]
    fn test_insert_keeps_order() {
        let layout = PageLayout::new(256, vec![ValKind::I32], ValKind::Rid, 1).unwrap();
        let mut data = vec![0u8; 256];
        layout.init_page(0, &mut data, 1);
        let mut page = LsmPage::new(&layout, 0, &mut data[..]).unwrap();
        for k in [5, 1, 9, 3] {
            insert(&mut page, vec![Val::I32(k)], rid(k as i64));
        }
        let keys: Vec<_> = page_keys(&page).into_iter().map(|k| k[0].clone()).collect();
        assert_eq!(keys, vec![Val::I32(1), Val::I32(3), Val::I32(5), Val::I32(9)]);
        match page.lookup(&[Val::I32(3)], true).unwrap() {
            LookupResult::Found { slot, value_offset } => {
                assert_eq!(slot, 1);
                assert_eq!(page.read_value(value_offset).unwrap(), rid(3));
            }
            res => panic!("unexpected {:?}", res),
        }
        assert_eq!(
            page.lookup(&[Val::I32(4)], true).unwrap(),
            LookupResult::NotFound { slot: 2 }
        );
        assert_eq!(
            page.lookup(&[Val::I32(10)], false).unwrap(),
            LookupResult::NotFound { slot: 4 }
        );
    }

    #[test]
    fn test_page_capacity() {
        // header of page 1 is 12 + 8 bytes, entry is 4 + 12 + pointer 4.
        let layout = PageLayout::new(128, vec![ValKind::I32], ValKind::Rid, 1).unwrap();
        let mut data = vec![0u8; 128];
        layout.init_page(1, &mut data, 1);
        let mut page = LsmPage::new(&layout, 1, &mut data[..]).unwrap();
        let mut n = 0;
        while page.append(&[Val::I32(n)], &rid(n as i64)) {
            n += 1;
        }
        assert_eq!(n as usize, (128 - 20) / 20);
        assert!(!page.fits(16));
        assert!(LsmPage::new(&layout, 1, &data[..]).is_ok());
    }

    #[test]
    fn test_partial_key_run() {
        let layout =
            PageLayout::new(1024, vec![ValKind::Str, ValKind::I32], ValKind::Rid, 1).unwrap();
        let mut data = vec![0u8; 1024];
        layout.init_page(0, &mut data, 1);
        let mut page = LsmPage::new(&layout, 0, &mut data[..]).unwrap();
        for (s, n) in [("b", 3), ("a", 1), ("b", 1), ("c", 0), ("b", 2), ("b", 0)] {
            insert(&mut page, vec![Val::from(s), Val::I32(n)], rid(n as i64));
        }
        let probe = [Val::from("b")];
        assert!(matches!(
            page.lookup(&probe, true).unwrap(),
            LookupResult::Found { slot: 1, .. }
        ));
        assert!(matches!(
            page.lookup(&probe, false).unwrap(),
            LookupResult::Found { slot: 4, .. }
        ));
        assert_eq!(
            page.lookup(&[Val::from("bb")], true).unwrap(),
            LookupResult::NotFound { slot: 5 }
        );
    }

    #[test]
    fn test_remove_and_overwrite() {
        let layout = PageLayout::new(256, vec![ValKind::I64], ValKind::Rid, 1).unwrap();
        let mut data = vec![0u8; 256];
        layout.init_page(1, &mut data, 1);
        let mut page = LsmPage::new(&layout, 1, &mut data[..]).unwrap();
        for k in 0..6i64 {
            assert!(page.append(&[Val::I64(k)], &rid(k)));
        }
        let free = page.free_offset();
        page.remove_range(1, 3);
        assert_eq!(page.count(), 4);
        assert_eq!(page.free_offset(), free);
        let keys: Vec<_> = page_keys(&page).into_iter().map(|k| k[0].clone()).collect();
        assert_eq!(keys, vec![Val::I64(0), Val::I64(3), Val::I64(4), Val::I64(5)]);

        let LookupResult::Found { value_offset, .. } = page.lookup(&[Val::I64(4)], true).unwrap()
        else {
            panic!("key 4 not found");
        };
        assert_eq!(page.value_len(value_offset).unwrap(), RecordID::ENCODED_LEN);
        page.overwrite_value(value_offset, &rid(40));
        assert_eq!(page.read_value(value_offset).unwrap(), rid(40));
    }

    #[test]
    fn test_page_bloom() {
        let layout =
            PageLayout::new(1024, vec![ValKind::I32, ValKind::I32], ValKind::Rid, 1).unwrap();
        let mut data = vec![0u8; 1024];
        layout.init_page(2, &mut data, 7);
        let mut page = LsmPage::new(&layout, 2, &mut data[..]).unwrap();
        let keys = [Val::I32(1), Val::I32(2)];
        page.add_to_bloom(hash_key_prefix(&keys, 1));
        assert!(page.bloom().might_contain(hash_key_prefix(&[Val::I32(1)], 1)));

        let no_bloom = PageLayout::new(1024, vec![ValKind::I32], ValKind::Rid, 0).unwrap();
        let mut data = vec![0u8; 1024];
        no_bloom.init_page(1, &mut data, 7);
        let page = LsmPage::new(&no_bloom, 1, &data[..]).unwrap();
        assert!(page.bloom().is_disabled());
        assert!(page.bloom().might_contain(123));
    }
}
