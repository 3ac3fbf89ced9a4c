use crate::conf::{INDEX_FILE_EXT, IndexSpec, LsmIndexConfig, UNIQUE_INDEX_FILE_EXT};
use crate::error::{Error, Result};
use crate::file::{FileInfo, PageStore};
use crate::index::{CompactionStats, LsmIndex};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Name prefix of an index being built by compaction.
pub const TEMP_INDEX_PREFIX: &str = "temp_";

/// Catalog maps index names to indexes of one page store.
///
/// Compaction replaces an index with a new one under the same name, so
/// callers should resolve indexes by name instead of keeping them across
/// compactions.
pub struct IndexCatalog<S: PageStore> {
    store: Arc<S>,
    config: LsmIndexConfig,
    indexes: RwLock<HashMap<String, Arc<LsmIndex<S>>>>,
    weak_self: Weak<IndexCatalog<S>>,
}

impl<S: PageStore> IndexCatalog<S> {
    /// Create an empty catalog.
    #[inline]
    pub fn new(store: Arc<S>, config: LsmIndexConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| IndexCatalog {
            store,
            config,
            indexes: RwLock::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Create a catalog with all indexes found in the page store.
    ///
    /// Files left by interrupted compactions are dropped. If two files
    /// carry the same index name, the newer one wins.
    #[inline]
    pub fn open(store: Arc<S>, config: LsmIndexConfig) -> Result<Arc<Self>> {
        let catalog = Self::new(store, config);
        catalog.load()?;
        Ok(catalog)
    }

    fn load(&self) -> Result<()> {
        let mut latest: HashMap<String, FileInfo> = HashMap::new();
        for info in self.store.files() {
            if info.ext != INDEX_FILE_EXT && info.ext != UNIQUE_INDEX_FILE_EXT {
                continue;
            }
            if info.name.starts_with(TEMP_INDEX_PREFIX) {
                log::warn!(
                    "drop orphaned compaction output {} with file {}",
                    info.name,
                    info.file_id
                );
                self.store.drop_file(info.file_id)?;
                continue;
            }
            if self.store.page_count(info.file_id)? == 0 {
                log::warn!("drop index file {} without pages", info.file_id);
                self.store.drop_file(info.file_id)?;
                continue;
            }
            // files are listed by id, later file replaces earlier one.
            if let Some(old) = latest.insert(info.name.clone(), info) {
                log::warn!(
                    "drop replaced index file {} of index {}",
                    old.file_id,
                    old.name
                );
                self.store.drop_file(old.file_id)?;
            }
        }
        let mut indexes = self.indexes.write();
        for info in latest.into_values() {
            let index = LsmIndex::open(
                Arc::clone(&self.store),
                self.weak_self.clone(),
                &info,
                self.config.clone(),
            )?;
            log::debug!("open index {} with file {}", info.name, info.file_id);
            indexes.insert(info.name, Arc::new(index));
        }
        Ok(())
    }

    #[inline]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[inline]
    pub fn config(&self) -> &LsmIndexConfig {
        &self.config
    }

    /// Create a new index with the catalog's configuration.
    #[inline]
    pub fn create_index(&self, name: &str, spec: IndexSpec) -> Result<Arc<LsmIndex<S>>> {
        if name.starts_with(TEMP_INDEX_PREFIX) {
            return Err(Error::InvalidArgument);
        }
        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            return Err(Error::IndexAlreadyExists(name.to_string()));
        }
        let index = Arc::new(LsmIndex::create(
            Arc::clone(&self.store),
            self.weak_self.clone(),
            name,
            &spec,
            self.config.clone(),
        )?);
        indexes.insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    #[inline]
    pub fn get_index(&self, name: &str) -> Result<Arc<LsmIndex<S>>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// Remove index from catalog and delete its file.
    #[inline]
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let index = self
            .indexes
            .write()
            .remove(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        self.store.drop_file(index.file_id())?;
        log::debug!("drop index {}", name);
        Ok(())
    }

    /// Register an index built outside the catalog.
    #[inline]
    pub fn register_file(&self, index: Arc<LsmIndex<S>>) -> Result<()> {
        let name = index.name();
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&name) {
            return Err(Error::IndexAlreadyExists(name));
        }
        indexes.insert(name, index);
        Ok(())
    }

    /// Replace `old` with `new`: the new index takes the old name and the
    /// old index file is deleted.
    pub fn swap_indexes(&self, old: &LsmIndex<S>, new: Arc<LsmIndex<S>>) -> Result<()> {
        let name = old.name();
        let new_name = new.name();
        let mut indexes = self.indexes.write();
        match indexes.get(&name) {
            Some(current) if current.file_id() == old.file_id() => (),
            _ => return Err(Error::IndexNotFound(name)),
        }
        self.store.rename_file(new.file_id(), &name)?;
        new.set_name(&name);
        indexes.remove(&new_name);
        indexes.insert(name.clone(), new);
        drop(indexes);
        if let Err(e) = self.store.drop_file(old.file_id()) {
            // a leftover file with the same name is dropped on next open.
            log::warn!(
                "failed to drop file {} of replaced index {}: {}",
                old.file_id(),
                name,
                e
            );
        }
        Ok(())
    }

    /// Compact index with given name.
    #[inline]
    pub fn compact(&self, name: &str) -> Result<CompactionStats> {
        self.get_index(name)?.compact()
    }

    /// Names of all indexes in alphabetical order.
    #[inline]
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::PageFileSystem;
    use lsmdb_datatype::{RecordID, Val, ValKind};

    fn spec() -> IndexSpec {
        IndexSpec::new(vec![ValKind::I64], ValKind::Rid)
    }

    #[test]
    fn test_catalog_create_and_drop() {
        let store = Arc::new(PageFileSystem::in_memory());
        let catalog = IndexCatalog::new(
            Arc::clone(&store),
            LsmIndexConfig::default().page_size(4096u64),
        );
        catalog.create_index("b_idx", spec()).unwrap();
        catalog.create_index("a_idx", spec().unique(true)).unwrap();
        assert!(matches!(
            catalog.create_index("a_idx", spec()),
            Err(Error::IndexAlreadyExists(_))
        ));
        assert!(matches!(
            catalog.create_index("temp_x", spec()),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(catalog.index_names(), vec!["a_idx", "b_idx"]);
        assert!(catalog.get_index("a_idx").unwrap().is_unique());
        catalog.drop_index("a_idx").unwrap();
        assert!(matches!(
            catalog.get_index("a_idx"),
            Err(Error::IndexNotFound(_))
        ));
        assert_eq!(store.files().len(), 1);
    }

    #[test]
    fn test_catalog_reopen_and_orphan_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let config = LsmIndexConfig::default().page_size(1024u64).bloom_seed(5);
        {
            let store = Arc::new(PageFileSystem::open(dir.path()).unwrap());
            let catalog = IndexCatalog::new(Arc::clone(&store), config.clone());
            let index = catalog
                .create_index(
                    "people",
                    IndexSpec::new(vec![ValKind::Str, ValKind::I32], ValKind::Rid)
                        .bloom_key_depth(1),
                )
                .unwrap();
            store
                .transaction(|| {
                    index.put(&[Val::from("ann"), Val::I32(30)], &Val::Rid(RecordID::new(1, 1)))?;
                    index.put(&[Val::from("bob"), Val::I32(41)], &Val::Rid(RecordID::new(1, 2)))
                })
                .unwrap();
            // leftover of an interrupted compaction.
            store.create_file("temp_people", INDEX_FILE_EXT, 1024).unwrap();
        }
        let store = Arc::new(PageFileSystem::open(dir.path()).unwrap());
        assert_eq!(store.files().len(), 2);
        let catalog = IndexCatalog::open(Arc::clone(&store), config).unwrap();
        assert_eq!(catalog.index_names(), vec!["people"]);
        assert_eq!(store.files().len(), 1);
        let index = catalog.get_index("people").unwrap();
        assert_eq!(index.spec().bloom_key_depth, 1);
        assert_eq!(index.layout().page_size(), 1024);
        assert_eq!(
            index.get(&[Val::from("bob")]).unwrap(),
            vec![Val::Rid(RecordID::new(1, 2))]
        );
    }

    #[test]
    fn test_catalog_keeps_newest_duplicate() {
        let store = Arc::new(PageFileSystem::in_memory());
        let config = LsmIndexConfig::default().page_size(1024u64);
        let first = {
            let catalog = IndexCatalog::new(Arc::clone(&store), config.clone());
            catalog.create_index("dup", spec()).unwrap().file_id()
        };
        let second = {
            let catalog = IndexCatalog::new(Arc::clone(&store), config.clone());
            catalog.create_index("dup", spec()).unwrap().file_id()
        };
        assert!(second > first);
        let catalog = IndexCatalog::open(Arc::clone(&store), config).unwrap();
        assert_eq!(catalog.get_index("dup").unwrap().file_id(), second);
        assert_eq!(store.files().len(), 1);
    }

    #[test]
    fn test_register_and_swap() {
        let store = Arc::new(PageFileSystem::in_memory());
        let catalog = IndexCatalog::new(
            Arc::clone(&store),
            LsmIndexConfig::default().page_size(1024u64),
        );
        let old = catalog.create_index("orders", spec()).unwrap();
        let new = Arc::new(
            LsmIndex::create(
                Arc::clone(&store),
                Arc::downgrade(&catalog),
                "temp_orders",
                &spec(),
                catalog.config().clone(),
            )
            .unwrap(),
        );
        catalog.register_file(Arc::clone(&new)).unwrap();
        assert_eq!(catalog.index_names(), vec!["orders", "temp_orders"]);
        catalog.swap_indexes(&old, Arc::clone(&new)).unwrap();
        assert_eq!(catalog.index_names(), vec!["orders"]);
        assert_eq!(catalog.get_index("orders").unwrap().file_id(), new.file_id());
        assert_eq!(new.name(), "orders");
        let files = store.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "orders");
        // old index is gone, swapping it again fails.
        assert!(catalog.swap_indexes(&old, new).is_err());
    }
}
