use crate::catalog::IndexCatalog;
use crate::error::{Error, Result};
use crate::file::PageStore;
use crate::index::compactor::CompactionStats;
use crate::index::lsm_index::LsmIndex;
use crate::index::merge_cursor::MergeCursor;
use lsmdb_datatype::{Val, hash_key_prefix};
use semistr::SemiStr;
use std::ops::Bound;
use std::sync::Arc;

/// Capabilities shared by all index kinds.
pub trait Index: Send + Sync {
    fn name(&self) -> String;

    fn get(&self, keys: &[Val]) -> Result<Vec<Val>>;

    fn put(&self, keys: &[Val], value: &Val) -> Result<()>;

    fn remove(&self, keys: &[Val]) -> Result<usize>;

    fn scan(
        &self,
        ascending: bool,
        from: Bound<&[Val]>,
        to: Bound<&[Val]>,
    ) -> Result<MergeCursor>;

    fn compact(&self) -> Result<CompactionStats>;

    fn entry_count(&self) -> Result<usize>;
}

impl<S: PageStore> Index for LsmIndex<S> {
    #[inline]
    fn name(&self) -> String {
        LsmIndex::name(self)
    }

    #[inline]
    fn get(&self, keys: &[Val]) -> Result<Vec<Val>> {
        LsmIndex::get(self, keys)
    }

    #[inline]
    fn put(&self, keys: &[Val], value: &Val) -> Result<()> {
        LsmIndex::put(self, keys, value)
    }

    #[inline]
    fn remove(&self, keys: &[Val]) -> Result<usize> {
        LsmIndex::remove(self, keys)
    }

    #[inline]
    fn scan(
        &self,
        ascending: bool,
        from: Bound<&[Val]>,
        to: Bound<&[Val]>,
    ) -> Result<MergeCursor> {
        LsmIndex::scan(self, ascending, from, to)
    }

    #[inline]
    fn compact(&self) -> Result<CompactionStats> {
        LsmIndex::compact(self)
    }

    #[inline]
    fn entry_count(&self) -> Result<usize> {
        LsmIndex::entry_count(self)
    }
}

/// Chooses the shard of a key.
pub trait ShardSelector: Send + Sync {
    /// Returns shard number below `shard_count`, or None if the key
    /// does not determine a single shard, e.g. a partial key.
    fn select(&self, keys: &[Val], shard_count: usize) -> Option<usize>;
}

/// Shards by hash of the leading key columns.
pub struct HashShardSelector {
    depth: usize,
}

impl HashShardSelector {
    #[inline]
    pub fn new(depth: usize) -> Self {
        HashShardSelector {
            depth: depth.max(1),
        }
    }
}

impl ShardSelector for HashShardSelector {
    #[inline]
    fn select(&self, keys: &[Val], shard_count: usize) -> Option<usize> {
        if keys.len() < self.depth || shard_count == 0 {
            return None;
        }
        Some(hash_key_prefix(keys, self.depth) as usize % shard_count)
    }
}

/// Index whose entries are spread over several LSM indexes with the same
/// columns. Shards are looked up by name on every call, so compaction of
/// a shard is picked up transparently.
pub struct PartitionedIndex<S: PageStore> {
    name: SemiStr,
    catalog: Arc<IndexCatalog<S>>,
    shards: Vec<String>,
    selector: Box<dyn ShardSelector>,
}

impl<S: PageStore> PartitionedIndex<S> {
    #[inline]
    pub fn new(
        name: &str,
        catalog: Arc<IndexCatalog<S>>,
        shards: Vec<String>,
        selector: Box<dyn ShardSelector>,
    ) -> Result<Self> {
        let mut spec = None;
        for shard in &shards {
            let index = catalog.get_index(shard)?;
            let mut shard_spec = index.spec();
            shard_spec.unique = false;
            match &spec {
                None => spec = Some(shard_spec),
                Some(first) if *first != shard_spec => return Err(Error::InvalidArgument),
                Some(_) => (),
            }
        }
        if spec.is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(PartitionedIndex {
            name: SemiStr::new(name),
            catalog,
            shards,
            selector,
        })
    }

    #[inline]
    pub fn shard_names(&self) -> &[String] {
        &self.shards
    }

    #[inline]
    fn shard(&self, idx: usize) -> Result<Arc<LsmIndex<S>>> {
        self.catalog.get_index(&self.shards[idx])
    }

    /// Shards possibly holding the key.
    #[inline]
    fn shards_for(&self, keys: &[Val], full: bool) -> Result<Vec<Arc<LsmIndex<S>>>> {
        let first = self.shard(0)?;
        let keys = first.coerce_keys(keys, full)?;
        match self.selector.select(&keys, self.shards.len()) {
            Some(idx) => Ok(vec![self.shard(idx)?]),
            None if full => Err(Error::InvalidState),
            None => (0..self.shards.len()).map(|idx| self.shard(idx)).collect(),
        }
    }
}

impl<S: PageStore> Index for PartitionedIndex<S> {
    #[inline]
    fn name(&self) -> String {
        self.name.as_str().to_string()
    }

    #[inline]
    fn get(&self, keys: &[Val]) -> Result<Vec<Val>> {
        let mut res = vec![];
        for shard in self.shards_for(keys, false)? {
            res.extend(shard.get(keys)?);
        }
        Ok(res)
    }

    #[inline]
    fn put(&self, keys: &[Val], value: &Val) -> Result<()> {
        let shards = self.shards_for(keys, true)?;
        debug_assert_eq!(shards.len(), 1);
        shards[0].put(keys, value)
    }

    #[inline]
    fn remove(&self, keys: &[Val]) -> Result<usize> {
        let mut removed = 0;
        for shard in self.shards_for(keys, false)? {
            removed += shard.remove(keys)?;
        }
        Ok(removed)
    }

    /// Merge of all pages of all shards.
    fn scan(
        &self,
        ascending: bool,
        from: Bound<&[Val]>,
        to: Bound<&[Val]>,
    ) -> Result<MergeCursor> {
        let mut iters = vec![];
        let mut to_keys = Bound::Unbounded;
        for idx in 0..self.shards.len() {
            let shard = self.shard(idx)?;
            let shard_from = match from {
                Bound::Included(keys) => Bound::Included(shard.coerce_keys(keys, false)?),
                Bound::Excluded(keys) => Bound::Excluded(shard.coerce_keys(keys, false)?),
                Bound::Unbounded => Bound::Unbounded,
            };
            to_keys = match to {
                Bound::Included(keys) => Bound::Included(shard.coerce_keys(keys, false)?),
                Bound::Excluded(keys) => Bound::Excluded(shard.coerce_keys(keys, false)?),
                Bound::Unbounded => Bound::Unbounded,
            };
            let shard_iters = shard
                .page_iterators(ascending, shard_from.as_ref().map(Vec::as_slice))
                .map_err(|e| shard.wrap_err("scan", e))?;
            iters.extend(shard_iters);
        }
        MergeCursor::new(iters, ascending, to_keys)
    }

    /// Compact every shard, shards below the page threshold are skipped.
    fn compact(&self) -> Result<CompactionStats> {
        let mut total = CompactionStats {
            skipped: true,
            ..Default::default()
        };
        for idx in 0..self.shards.len() {
            let stats = self.shard(idx)?.compact()?;
            total.skipped &= stats.skipped;
            total.pages_read += stats.pages_read;
            total.batches += stats.batches;
            total.entries_read += stats.entries_read;
            total.entries_written += stats.entries_written;
            total.duplicates_removed += stats.duplicates_removed;
            total.pages_written += stats.pages_written;
            total.pages_carried += stats.pages_carried;
        }
        Ok(total)
    }

    #[inline]
    fn entry_count(&self) -> Result<usize> {
        let mut total = 0;
        for idx in 0..self.shards.len() {
            total += self.shard(idx)?.entry_count()?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{CompactionConfig, IndexSpec, LsmIndexConfig};
    use crate::file::PageFileSystem;
    use lsmdb_datatype::{RecordID, ValKind};

    fn setup() -> (Arc<PageFileSystem>, Arc<IndexCatalog<PageFileSystem>>) {
        let store = Arc::new(PageFileSystem::in_memory());
        let config = LsmIndexConfig::default()
            .page_size(256u64)
            .bloom_seed(9)
            .compaction(CompactionConfig::default().min_pages(1));
        let catalog = IndexCatalog::new(Arc::clone(&store), config);
        for name in ["s0", "s1", "s2"] {
            let spec = IndexSpec::new(vec![ValKind::I64, ValKind::I32], ValKind::Rid);
            catalog.create_index(name, spec).unwrap();
        }
        (store, catalog)
    }

    fn partitioned(
        catalog: &Arc<IndexCatalog<PageFileSystem>>,
    ) -> PartitionedIndex<PageFileSystem> {
        PartitionedIndex::new(
            "orders_by_customer",
            Arc::clone(catalog),
            vec!["s0".into(), "s1".into(), "s2".into()],
            Box::new(HashShardSelector::new(1)),
        )
        .unwrap()
    }

    #[test]
    fn test_partitioned_index() {
        let (store, catalog) = setup();
        let index = partitioned(&catalog);
        store
            .transaction(|| {
                for c in 0..20i64 {
                    for o in 0..3 {
                        let rid = Val::Rid(RecordID::new(c as i32, o as i64));
                        index.put(&[Val::I64(c), Val::I32(o)], &rid)?;
                    }
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(index.entry_count().unwrap(), 60);
        // all orders of one customer live in one shard.
        let mut non_empty = 0;
        for name in index.shard_names() {
            let n = catalog.get_index(name).unwrap().get(&[Val::I64(7)]).unwrap().len();
            assert!(n == 0 || n == 3);
            non_empty += (n > 0) as usize;
        }
        assert_eq!(non_empty, 1);
        assert_eq!(index.get(&[Val::I64(7)]).unwrap().len(), 3);

        let keys: Vec<i64> = index
            .scan(
                true,
                Bound::Included(&[Val::I64(5)][..]),
                Bound::Excluded(&[Val::I64(8)][..]),
            )
            .unwrap()
            .map(|e| e.unwrap().keys[0].as_i64().unwrap())
            .collect();
        assert_eq!(keys, vec![5, 5, 5, 6, 6, 6, 7, 7, 7]);

        let removed = store.transaction(|| index.remove(&[Val::I64(7)])).unwrap();
        assert_eq!(removed, 3);
        let stats = index.compact().unwrap();
        assert!(!stats.skipped);
        assert_eq!(stats.entries_written, 57);
        assert_eq!(index.entry_count().unwrap(), 57);
        assert!(index.get(&[Val::I64(7)]).unwrap().is_empty());
    }

    #[test]
    fn test_index_trait_objects() {
        let (store, catalog) = setup();
        let indexes: Vec<Arc<dyn Index>> = vec![
            Arc::new(partitioned(&catalog)),
            catalog.get_index("s0").unwrap(),
        ];
        for index in &indexes {
            store
                .transaction(|| {
                    index.put(&[Val::I64(1), Val::I32(1)], &Val::Rid(RecordID::new(0, 1)))
                })
                .unwrap();
        }
        assert_eq!(indexes[0].name(), "orders_by_customer");
        assert_eq!(indexes[1].name(), "s0");
        for index in &indexes {
            assert!(!index.get(&[Val::I64(1)]).unwrap().is_empty());
        }
    }

    #[test]
    fn test_partitioned_rejects_mismatched_shards() {
        let (_store, catalog) = setup();
        catalog
            .create_index("other", IndexSpec::new(vec![ValKind::Str], ValKind::Rid))
            .unwrap();
        let res = PartitionedIndex::new(
            "bad",
            Arc::clone(&catalog),
            vec!["s0".into(), "other".into()],
            Box::new(HashShardSelector::new(1)),
        );
        assert!(matches!(res, Err(Error::InvalidArgument)));
        let res =
            PartitionedIndex::new("empty", catalog, vec![], Box::new(HashShardSelector::new(1)));
        assert!(res.is_err());
    }
}
