use crate::catalog::IndexCatalog;
use crate::conf::{IndexSpec, LsmIndexConfig, UNIQUE_INDEX_FILE_EXT};
use crate::error::{Error, Result};
use crate::file::{FileID, FileInfo, PageID, PageNo, PageStore};
use crate::index::bloom::SeedSource;
use crate::index::compactor::{CompactionStats, Compactor};
use crate::index::lsm_page::{LookupResult, LsmPage, PageLayout};
use crate::index::merge_cursor::MergeCursor;
use crate::index::page_iter::PageIterator;
use lsmdb_datatype::{Val, hash_key_prefix};
use parking_lot::{Mutex, RwLock};
use semistr::SemiStr;
use std::ops::Bound;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

const INDEX_STATE_IDLE: u8 = 0;
const INDEX_STATE_COMPACTING: u8 = 1;
// compaction is swapping the index, writes are rejected.
const INDEX_STATE_FROZEN: u8 = 2;

#[derive(Debug, Default)]
struct IndexStats {
    bloom_false_positives: AtomicU64,
    bloom_skipped_pages: AtomicU64,
    compactions: AtomicU64,
}

/// Point-in-time copy of index counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStatsSnapshot {
    pub bloom_false_positives: u64,
    pub bloom_skipped_pages: u64,
    pub compactions: u64,
}

/// LSM secondary index stored in one page file.
///
/// Inserts go to the tail page only. Each page is sorted, but pages are
/// not sorted against each other, so a key may live on several pages
/// until the index is compacted. Lookups probe every page whose bloom
/// filter admits the key, ordered reads merge all pages.
///
/// The index does no locking of its own. Page access goes through the
/// transaction of the calling thread, writes need an active transaction.
/// While compaction swaps the index, writes fail with `IndexFrozen`.
pub struct LsmIndex<S: PageStore> {
    name: RwLock<SemiStr>,
    file_id: FileID,
    store: Arc<S>,
    catalog: Weak<IndexCatalog<S>>,
    layout: Arc<PageLayout>,
    unique: bool,
    config: LsmIndexConfig,
    seeds: Mutex<SeedSource>,
    state: AtomicU8,
    // writes between state check and end of page modification.
    writers: AtomicUsize,
    // pages below this number take no more inserts.
    sealed_pages: AtomicU32,
    stats: IndexStats,
}

impl<S: PageStore> LsmIndex<S> {
    /// Create a new index file and initialize its first page.
    #[inline]
    pub fn create(
        store: Arc<S>,
        catalog: Weak<IndexCatalog<S>>,
        name: &str,
        spec: &IndexSpec,
        config: LsmIndexConfig,
    ) -> Result<Self> {
        let page_size = config.page_size_bytes();
        let layout = PageLayout::new(
            page_size,
            spec.key_types.clone(),
            spec.value_type,
            spec.bloom_key_depth,
        )?;
        let file_id = store.create_file(name, spec.file_ext(), page_size)?;
        let index = LsmIndex::new(store, catalog, name, file_id, layout, spec.unique, config);
        let res = if index.store.in_transaction() {
            index.init_first_page()
        } else {
            index.store.transaction(|| index.init_first_page())
        };
        if let Err(e) = res {
            let _ = index.store.drop_file(file_id);
            return Err(index.wrap_err("create", e));
        }
        log::debug!(
            "create index {} with file {}, {} key columns, page size {}",
            name,
            file_id,
            spec.key_types.len(),
            page_size
        );
        Ok(index)
    }

    /// Open an existing index file, layout is read from its first page.
    #[inline]
    pub fn open(
        store: Arc<S>,
        catalog: Weak<IndexCatalog<S>>,
        info: &FileInfo,
        config: LsmIndexConfig,
    ) -> Result<Self> {
        let page0 = store.get_page(PageID::new(info.file_id, 0), info.page_size)?;
        let layout = PageLayout::read(info.page_size, &page0)?;
        let config = config.page_size(info.page_size as u64);
        let unique = info.ext == UNIQUE_INDEX_FILE_EXT;
        Ok(LsmIndex::new(
            store,
            catalog,
            &info.name,
            info.file_id,
            layout,
            unique,
            config,
        ))
    }

    #[inline]
    fn new(
        store: Arc<S>,
        catalog: Weak<IndexCatalog<S>>,
        name: &str,
        file_id: FileID,
        layout: PageLayout,
        unique: bool,
        config: LsmIndexConfig,
    ) -> Self {
        let seeds = config.seed_source();
        LsmIndex {
            name: RwLock::new(SemiStr::new(name)),
            file_id,
            store,
            catalog,
            layout: Arc::new(layout),
            unique,
            config,
            seeds: Mutex::new(seeds),
            state: AtomicU8::new(INDEX_STATE_IDLE),
            writers: AtomicUsize::new(0),
            sealed_pages: AtomicU32::new(0),
            stats: IndexStats::default(),
        }
    }

    #[inline]
    fn init_first_page(&self) -> Result<()> {
        let mut page = self
            .store
            .add_page(self.page_id(0), self.layout.page_size())?;
        self.layout.init_page(0, &mut page, self.next_seed());
        self.store.update_page(page)
    }

    #[inline]
    pub fn name(&self) -> String {
        self.name.read().as_str().to_string()
    }

    #[inline]
    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = SemiStr::new(name);
    }

    #[inline]
    pub fn file_id(&self) -> FileID {
        self.file_id
    }

    #[inline]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    #[inline]
    pub fn layout(&self) -> &Arc<PageLayout> {
        &self.layout
    }

    #[inline]
    pub fn config(&self) -> &LsmIndexConfig {
        &self.config
    }

    #[inline]
    pub fn spec(&self) -> IndexSpec {
        IndexSpec::new(self.layout.key_types().to_vec(), self.layout.value_type())
            .bloom_key_depth(self.layout.bloom_key_depth())
            .unique(self.unique)
    }

    #[inline]
    pub(crate) fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[inline]
    pub(crate) fn catalog(&self) -> Option<Arc<IndexCatalog<S>>> {
        self.catalog.upgrade()
    }

    #[inline]
    pub(crate) fn next_seed(&self) -> u32 {
        self.seeds.lock().next_seed()
    }

    #[inline]
    pub(crate) fn page_id(&self, page_no: PageNo) -> PageID {
        PageID::new(self.file_id, page_no)
    }

    #[inline]
    pub(crate) fn sealed_pages(&self) -> &AtomicU32 {
        &self.sealed_pages
    }

    /// Hash fed into page bloom filters, None if filters are disabled
    /// or the key is shorter than bloom key depth.
    #[inline]
    pub(crate) fn bloom_hash(&self, keys: &[Val]) -> Option<u32> {
        let depth = self.layout.bloom_key_depth();
        if depth == 0 || keys.len() < depth {
            return None;
        }
        Some(hash_key_prefix(keys, depth))
    }

    /// Attach index name and operation to page store failures.
    #[inline]
    pub(crate) fn wrap_err(&self, op: &'static str, err: Error) -> Error {
        if err.is_operation_failure() && !matches!(err, Error::IndexOperation { .. }) {
            Error::IndexOperation {
                index: self.name(),
                op,
                source: Box::new(err),
            }
        } else {
            err
        }
    }

    #[inline]
    fn wrap<T>(&self, op: &'static str, res: Result<T>) -> Result<T> {
        res.map_err(|e| self.wrap_err(op, e))
    }

    /// Validate keys and convert them to column types.
    /// With `full` set, every key column must be given,
    /// otherwise a leading subset is accepted.
    #[inline]
    pub fn coerce_keys(&self, keys: &[Val], full: bool) -> Result<Vec<Val>> {
        if keys.is_empty() {
            return Err(Error::EmptyKey);
        }
        let arity = self.layout.arity();
        if full && keys.len() != arity {
            return Err(Error::KeyArityMismatch {
                expected: arity,
                actual: keys.len(),
            });
        }
        if keys.len() > arity {
            return Err(Error::KeyTooLong {
                max: arity,
                actual: keys.len(),
            });
        }
        keys.iter()
            .zip(self.layout.key_types())
            .map(|(key, kind)| {
                if key.is_null() {
                    return Err(Error::NullKey);
                }
                Ok(key.coerce(*kind)?)
            })
            .collect()
    }

    #[inline]
    fn coerce_value(&self, value: &Val) -> Result<Val> {
        if value.is_null() {
            return Err(Error::NullValue);
        }
        Ok(value.coerce(self.layout.value_type())?)
    }

    #[inline]
    fn coerce_bound(&self, bound: Bound<&[Val]>) -> Result<Bound<Vec<Val>>> {
        let res = match bound {
            Bound::Included(keys) => Bound::Included(self.coerce_keys(keys, false)?),
            Bound::Excluded(keys) => Bound::Excluded(self.coerce_keys(keys, false)?),
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(res)
    }

    /// Number of pages visible to the caller.
    #[inline]
    pub fn page_count(&self) -> Result<u32> {
        self.wrap("page_count", self.store.page_count(self.file_id))
    }

    /// Number of live entries on all pages, stale duplicates included.
    #[inline]
    pub fn entry_count(&self) -> Result<usize> {
        self.wrap("entry_count", self.count_entries())
    }

    fn count_entries(&self) -> Result<usize> {
        let mut total = 0;
        for page_no in 0..self.store.page_count(self.file_id)? {
            let page = self
                .store
                .get_page(self.page_id(page_no), self.layout.page_size())?;
            total += LsmPage::new(&self.layout, page_no, &page[..])?.count();
        }
        Ok(total)
    }

    #[inline]
    pub fn stats(&self) -> IndexStatsSnapshot {
        IndexStatsSnapshot {
            bloom_false_positives: self.stats.bloom_false_positives.load(Ordering::Relaxed),
            bloom_skipped_pages: self.stats.bloom_skipped_pages.load(Ordering::Relaxed),
            compactions: self.stats.compactions.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn record_compaction(&self) {
        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true if the page may hold the key, counting skipped pages.
    #[inline]
    fn admit_page<B: AsRef<[u8]>>(&self, page: &LsmPage<'_, B>, hash: Option<u32>) -> bool {
        match hash {
            Some(h) if !page.bloom().might_contain(h) => {
                self.stats
                    .bloom_skipped_pages
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
            _ => true,
        }
    }

    #[inline]
    fn record_false_positive(&self, page_no: PageNo, hash: Option<u32>) {
        if hash.is_some() {
            self.stats
                .bloom_false_positives
                .fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "bloom false positive on page {} of index {}",
                page_no,
                self.name()
            );
        }
    }

    /// Returns values of all entries matching the key on all pages.
    /// A partial key returns every entry starting with it.
    #[inline]
    pub fn get(&self, keys: &[Val]) -> Result<Vec<Val>> {
        let probe = self.coerce_keys(keys, false)?;
        self.wrap("get", self.get_values(&probe))
    }

    fn get_values(&self, probe: &[Val]) -> Result<Vec<Val>> {
        let hash = self.bloom_hash(probe);
        let mut res = vec![];
        for page_no in 0..self.store.page_count(self.file_id)? {
            let page = self
                .store
                .get_page(self.page_id(page_no), self.layout.page_size())?;
            let view = LsmPage::new(&self.layout, page_no, &page[..])?;
            if !self.admit_page(&view, hash) {
                continue;
            }
            match view.lookup(probe, true)? {
                LookupResult::Found { slot, value_offset } => {
                    res.push(view.read_value(value_offset)?);
                    let mut slot = slot + 1;
                    while slot < view.count() && view.matches(slot, probe)? {
                        let offset = view.value_offset(view.entry_offset(slot)?)?;
                        res.push(view.read_value(offset)?);
                        slot += 1;
                    }
                }
                LookupResult::NotFound { .. } => self.record_false_positive(page_no, hash),
            }
        }
        Ok(res)
    }

    /// Insert an entry into the tail page.
    ///
    /// If the tail page already has the key, its value is replaced.
    /// Older pages are not searched, so the same key can exist on several
    /// pages until compaction.
    #[inline]
    pub fn put(&self, keys: &[Val], value: &Val) -> Result<()> {
        let keys = self.coerce_keys(keys, true)?;
        let value = self.coerce_value(value)?;
        let len = self.layout.entry_len(&keys, &value);
        if len > self.layout.max_entry_len() {
            return Err(Error::EntryTooLarge {
                len,
                page_size: self.layout.page_size(),
            });
        }
        let _writer = self.begin_write()?;
        if self.unique {
            let existing = self.wrap("put", self.get_values(&keys))?;
            if existing.iter().any(|v| *v != value) {
                return Err(Error::DuplicateKey(self.name()));
            }
            if !existing.is_empty() {
                return Ok(());
            }
        }
        self.wrap("put", self.put_entry(&keys, &value))
    }

    fn put_entry(&self, keys: &[Val], value: &Val) -> Result<()> {
        let hash = self.bloom_hash(keys);
        let page_size = self.layout.page_size();
        let count = self.store.page_count(self.file_id)?;
        let sealed = self.sealed_pages.load(Ordering::Acquire);
        if let Some(tail) = count.checked_sub(1).filter(|tail| *tail >= sealed) {
            let mut page = self
                .store
                .get_page_to_modify(self.page_id(tail), page_size, false)?;
            let (modified, inserted) = {
                let mut view = LsmPage::new(&self.layout, tail, &mut page[..])?;
                let res = match view.lookup(keys, true)? {
                    LookupResult::Found { slot, value_offset } => {
                        if view.value_len(value_offset)? == value.ser_len() {
                            view.overwrite_value(value_offset, value);
                            (true, true)
                        } else {
                            view.remove_range(slot, slot + 1);
                            (true, view.insert_at(slot, keys, value))
                        }
                    }
                    LookupResult::NotFound { slot } => {
                        let inserted = view.insert_at(slot, keys, value);
                        (inserted, inserted)
                    }
                };
                if let (true, Some(h)) = (res.1, hash) {
                    view.add_to_bloom(h);
                }
                res
            };
            if modified {
                self.store.update_page(page)?;
            }
            if inserted {
                return Ok(());
            }
        }
        let mut page_no = count;
        loop {
            let mut page = self.store.add_page(self.page_id(page_no), page_size)?;
            self.layout.init_page(page_no, &mut page, self.next_seed());
            let inserted = {
                let mut view = LsmPage::new(&self.layout, page_no, &mut page[..])?;
                let inserted = view.insert_at(0, keys, value);
                if let (true, Some(h)) = (inserted, hash) {
                    view.add_to_bloom(h);
                }
                inserted
            };
            self.store.update_page(page)?;
            log::debug!("index {} allocates page {}", self.name(), page_no);
            if inserted {
                return Ok(());
            }
            if page_no > 0 {
                return Err(Error::EntryTooLarge {
                    len: self.layout.entry_len(keys, value),
                    page_size,
                });
            }
            // first page has a longer header, next one may fit.
            page_no += 1;
        }
    }

    /// Remove all entries matching the key on all pages, returns number of
    /// removed entries. Entry bytes stay on the page until compaction.
    #[inline]
    pub fn remove(&self, keys: &[Val]) -> Result<usize> {
        let probe = self.coerce_keys(keys, false)?;
        let _writer = self.begin_write()?;
        self.wrap("remove", self.remove_entries(&probe, None))
    }

    /// Remove entries matching both key and value.
    #[inline]
    pub fn remove_value(&self, keys: &[Val], value: &Val) -> Result<usize> {
        let probe = self.coerce_keys(keys, false)?;
        let value = self.coerce_value(value)?;
        let _writer = self.begin_write()?;
        self.wrap("remove", self.remove_entries(&probe, Some(&value)))
    }

    fn remove_entries(&self, probe: &[Val], value: Option<&Val>) -> Result<usize> {
        let hash = self.bloom_hash(probe);
        let page_size = self.layout.page_size();
        let mut removed = 0;
        for page_no in 0..self.store.page_count(self.file_id)? {
            let (start, end) = {
                let page = self.store.get_page(self.page_id(page_no), page_size)?;
                let view = LsmPage::new(&self.layout, page_no, &page[..])?;
                if !self.admit_page(&view, hash) {
                    continue;
                }
                let LookupResult::Found { slot, .. } = view.lookup(probe, true)? else {
                    self.record_false_positive(page_no, hash);
                    continue;
                };
                let mut end = slot + 1;
                while end < view.count() && view.matches(end, probe)? {
                    end += 1;
                }
                (slot, end)
            };
            let mut page = self
                .store
                .get_page_to_modify(self.page_id(page_no), page_size, false)?;
            let count = {
                let mut view = LsmPage::new(&self.layout, page_no, &mut page[..])?;
                match value {
                    None => {
                        view.remove_range(start, end);
                        end - start
                    }
                    Some(value) => {
                        let mut count = 0;
                        for slot in (start..end).rev() {
                            let offset = view.value_offset(view.entry_offset(slot)?)?;
                            if view.read_value(offset)? == *value {
                                view.remove_range(slot, slot + 1);
                                count += 1;
                            }
                        }
                        count
                    }
                }
            };
            if count > 0 {
                self.store.update_page(page)?;
                removed += count;
            }
        }
        Ok(removed)
    }

    /// Iterator over all entries.
    #[inline]
    pub fn iterator(&self, ascending: bool) -> Result<MergeCursor> {
        self.scan(ascending, Bound::Unbounded, Bound::Unbounded)
    }

    /// Iterator starting at given key, inclusive.
    #[inline]
    pub fn iterator_from(&self, ascending: bool, from: &[Val]) -> Result<MergeCursor> {
        self.scan(ascending, Bound::Included(from), Bound::Unbounded)
    }

    /// Ascending iterator over keys between `from` and `to`, both inclusive.
    #[inline]
    pub fn range(&self, from: &[Val], to: &[Val]) -> Result<MergeCursor> {
        self.scan(true, Bound::Included(from), Bound::Included(to))
    }

    /// Ordered iterator between two bounds in iteration order.
    /// For descending order `from` is the upper key. Bounds may be partial
    /// keys, all entries sharing the partial key are inside the bound.
    #[inline]
    pub fn scan(
        &self,
        ascending: bool,
        from: Bound<&[Val]>,
        to: Bound<&[Val]>,
    ) -> Result<MergeCursor> {
        let from = self.coerce_bound(from)?;
        let to = self.coerce_bound(to)?;
        let iters = self.wrap(
            "scan",
            self.page_iterators(ascending, from.as_ref().map(Vec::as_slice)),
        )?;
        self.wrap("scan", MergeCursor::new(iters, ascending, to))
    }

    /// Position one iterator on every page.
    pub(crate) fn page_iterators(
        &self,
        ascending: bool,
        from: Bound<&[Val]>,
    ) -> Result<Vec<PageIterator>> {
        let count = self.store.page_count(self.file_id)?;
        let mut iters = Vec::with_capacity(count as usize);
        for page_no in 0..count {
            let page = self
                .store
                .get_page(self.page_id(page_no), self.layout.page_size())?;
            iters.push(PageIterator::seek(
                Arc::clone(&self.layout),
                page,
                ascending,
                from,
            )?);
        }
        Ok(iters)
    }

    /// Rewrite all pages into a new sorted index and replace this one in
    /// the catalog. Blocks until done, fails if a compaction of this index
    /// is already running.
    #[inline]
    pub fn compact(&self) -> Result<CompactionStats> {
        let _guard = self.begin_compaction()?;
        let res = Compactor::new(self).run();
        self.wrap("compact", res)
    }

    #[inline]
    pub fn is_compacting(&self) -> bool {
        self.state.load(Ordering::Acquire) != INDEX_STATE_IDLE
    }

    /// Register a running write, fails if the index is frozen.
    #[inline]
    fn begin_write(&self) -> Result<WriteGuard<'_>> {
        // pairs with the state store and writer count load in freeze_writes.
        self.writers.fetch_add(1, Ordering::SeqCst);
        let guard = WriteGuard {
            writers: &self.writers,
        };
        if self.state.load(Ordering::SeqCst) == INDEX_STATE_FROZEN {
            return Err(Error::IndexFrozen(self.name()));
        }
        Ok(guard)
    }

    /// Reject new writes and wait until running ones have handed their
    /// pages to their transactions. Caller must hold the compaction guard,
    /// which unfreezes the index when dropped.
    pub(crate) fn freeze_writes(&self) {
        self.state.store(INDEX_STATE_FROZEN, Ordering::SeqCst);
        while self.writers.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
        log::debug!("index {} is frozen", self.name());
    }

    #[inline]
    pub(crate) fn begin_compaction(&self) -> Result<CompactionGuard<'_>> {
        self.state
            .compare_exchange(
                INDEX_STATE_IDLE,
                INDEX_STATE_COMPACTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyCompacting(self.name()))?;
        Ok(CompactionGuard {
            state: &self.state,
            sealed_pages: &self.sealed_pages,
        })
    }
}

struct WriteGuard<'a> {
    writers: &'a AtomicUsize,
}

impl Drop for WriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resets compaction state of an index when dropped.
pub(crate) struct CompactionGuard<'a> {
    state: &'a AtomicU8,
    sealed_pages: &'a AtomicU32,
}

impl Drop for CompactionGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.sealed_pages.store(0, Ordering::Release);
        self.state.store(INDEX_STATE_IDLE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::CompactionConfig;
    use crate::file::PageFileSystem;
    use lsmdb_datatype::{RecordID, ValKind};

    fn rid(n: i64) -> Val {
        Val::Rid(RecordID::new(3, n))
    }

    fn new_index(spec: IndexSpec, page_size: u64) -> LsmIndex<PageFileSystem> {
        let store = Arc::new(PageFileSystem::in_memory());
        let config = LsmIndexConfig::default()
            .page_size(page_size)
            .bloom_seed(1)
            .compaction(CompactionConfig::default().min_pages(0));
        LsmIndex::create(store, Weak::new(), "idx", &spec, config).unwrap()
    }

    #[test]
    fn test_contract_checks() {
        let index = new_index(
            IndexSpec::new(vec![ValKind::I64, ValKind::Str], ValKind::Rid),
            1024,
        );
        let store = Arc::clone(index.store());
        store.begin().unwrap();
        assert!(matches!(
            index.put(&[Val::I64(1)], &rid(1)),
            Err(Error::KeyArityMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            index.put(&[Val::I64(1), Val::Null], &rid(1)),
            Err(Error::NullKey)
        ));
        assert!(matches!(
            index.put(&[Val::I64(1), Val::from("a")], &Val::Null),
            Err(Error::NullValue)
        ));
        assert!(matches!(index.get(&[]), Err(Error::EmptyKey)));
        assert!(matches!(
            index.get(&[Val::I64(1), Val::from("a"), Val::I32(3)]),
            Err(Error::KeyTooLong { max: 2, actual: 3 })
        ));
        assert!(matches!(
            index.get(&[Val::from("x")]),
            Err(Error::DataType(_))
        ));
        // contract violations leave pages untouched.
        assert_eq!(index.entry_count().unwrap(), 0);
        store.commit().unwrap();
    }

    #[test]
    fn test_put_needs_transaction() {
        let index = new_index(IndexSpec::new(vec![ValKind::I32], ValKind::Rid), 1024);
        let err = index.put(&[Val::I32(1)], &rid(1)).unwrap_err();
        assert!(err.is_operation_failure());
        match err {
            Error::IndexOperation { index, op, source } => {
                assert_eq!(index, "idx");
                assert_eq!(op, "put");
                assert!(matches!(*source, Error::NoActiveTransaction));
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_put_coerces_and_overwrites() {
        let index = new_index(IndexSpec::new(vec![ValKind::I64], ValKind::Rid), 1024);
        let store = Arc::clone(index.store());
        store
            .transaction(|| {
                index.put(&[Val::I32(7)], &rid(1))?;
                index.put(&[Val::I64(7)], &rid(2))
            })
            .unwrap();
        assert_eq!(index.get(&[Val::I32(7)]).unwrap(), vec![rid(2)]);
        assert_eq!(index.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_put_overwrite_with_different_length() {
        let index = new_index(IndexSpec::new(vec![ValKind::I32], ValKind::Str), 1024);
        let store = Arc::clone(index.store());
        store
            .transaction(|| {
                index.put(&[Val::I32(1)], &Val::from("short"))?;
                index.put(&[Val::I32(2)], &Val::from("two"))?;
                index.put(&[Val::I32(1)], &Val::from("much longer value"))
            })
            .unwrap();
        assert_eq!(
            index.get(&[Val::I32(1)]).unwrap(),
            vec![Val::from("much longer value")]
        );
        let keys: Vec<_> = index
            .iterator(true)
            .unwrap()
            .map(|e| e.unwrap().keys[0].clone())
            .collect();
        assert_eq!(keys, vec![Val::I32(1), Val::I32(2)]);
    }

    #[test]
    fn test_entry_too_large() {
        let index = new_index(IndexSpec::new(vec![ValKind::Str], ValKind::Rid), 128);
        let store = Arc::clone(index.store());
        store.begin().unwrap();
        let big = "x".repeat(200);
        assert!(matches!(
            index.put(&[Val::from(big.as_str())], &rid(1)),
            Err(Error::EntryTooLarge { .. })
        ));
        store.rollback().unwrap();
    }

    #[test]
    fn test_unique_index() {
        let spec = IndexSpec::new(vec![ValKind::I32], ValKind::Rid).unique(true);
        let index = new_index(spec, 128);
        let store = Arc::clone(index.store());
        store
            .transaction(|| {
                for k in 0..10 {
                    index.put(&[Val::I32(k)], &rid(k as i64))?;
                }
                // same value again is accepted.
                index.put(&[Val::I32(0)], &rid(0))
            })
            .unwrap();
        assert!(index.page_count().unwrap() > 1);
        store.begin().unwrap();
        assert!(matches!(
            index.put(&[Val::I32(0)], &rid(100)),
            Err(Error::DuplicateKey(_))
        ));
        store.rollback().unwrap();
        assert_eq!(index.get(&[Val::I32(0)]).unwrap(), vec![rid(0)]);
    }

    #[test]
    fn test_remove_value() {
        let index = new_index(
            IndexSpec::new(vec![ValKind::I32, ValKind::I32], ValKind::Rid),
            1024,
        );
        let store = Arc::clone(index.store());
        store
            .transaction(|| {
                index.put(&[Val::I32(1), Val::I32(1)], &rid(1))?;
                index.put(&[Val::I32(1), Val::I32(2)], &rid(2))?;
                index.put(&[Val::I32(1), Val::I32(3)], &rid(1))?;
                index.put(&[Val::I32(2), Val::I32(1)], &rid(1))
            })
            .unwrap();
        let removed = store
            .transaction(|| index.remove_value(&[Val::I32(1)], &rid(1)))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.get(&[Val::I32(1)]).unwrap(), vec![rid(2)]);
        let removed = store.transaction(|| index.remove(&[Val::I32(2)])).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_bloom_stats() {
        let index = new_index(IndexSpec::new(vec![ValKind::I64], ValKind::Rid), 4096);
        let store = Arc::clone(index.store());
        store
            .transaction(|| {
                for k in 0..50 {
                    index.put(&[Val::I64(k * 2)], &rid(k))?;
                }
                Ok(())
            })
            .unwrap();
        for k in 0..50 {
            assert!(index.get(&[Val::I64(k * 2 + 1)]).unwrap().is_empty());
        }
        let stats = index.stats();
        assert_eq!(stats.bloom_skipped_pages + stats.bloom_false_positives, 50);
        assert!(stats.bloom_skipped_pages > 0);
    }

    #[test]
    fn test_compaction_guard() {
        let index = new_index(IndexSpec::new(vec![ValKind::I64], ValKind::Rid), 1024);
        {
            let _guard = index.begin_compaction().unwrap();
            assert!(index.is_compacting());
            assert!(matches!(index.compact(), Err(Error::AlreadyCompacting(_))));
        }
        assert!(!index.is_compacting());
        // compaction without catalog fails but resets state.
        assert!(index.compact().is_err());
        assert!(!index.is_compacting());
    }

    #[test]
    fn test_frozen_index_rejects_writes() {
        let index = new_index(IndexSpec::new(vec![ValKind::I64], ValKind::Rid), 1024);
        let store = Arc::clone(index.store());
        store
            .transaction(|| index.put(&[Val::I64(1)], &rid(1)))
            .unwrap();
        {
            let _guard = index.begin_compaction().unwrap();
            index.freeze_writes();
            assert!(index.is_compacting());
            let res = store.transaction(|| index.put(&[Val::I64(2)], &rid(2)));
            assert!(matches!(res, Err(Error::IndexFrozen(_))));
            let res = store.transaction(|| index.remove(&[Val::I64(1)]));
            assert!(matches!(res, Err(Error::IndexFrozen(_))));
            let res = store.transaction(|| index.remove_value(&[Val::I64(1)], &rid(1)));
            assert!(matches!(res, Err(Error::IndexFrozen(_))));
            // reads are not affected.
            assert_eq!(index.get(&[Val::I64(1)]).unwrap(), vec![rid(1)]);
        }
        assert!(!index.is_compacting());
        store
            .transaction(|| index.put(&[Val::I64(2)], &rid(2)))
            .unwrap();
        assert_eq!(index.entry_count().unwrap(), 2);
    }
}
