use crate::error::{Error, Result};
use crate::file::{FileID, FileInfo, MutablePage, PageID, PageNo, PageRef, PageStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, ThreadId};

/// PageFileSystem keeps committed pages in memory and optionally
/// writes them through to one disk file per logical file.
///
/// Each thread owns at most one transaction. A transaction keeps private
/// copies of the pages it modified. Commit validates that every modified
/// page is still at the version it was copied from, otherwise the whole
/// transaction is discarded with `ConcurrentModification`.
pub struct PageFileSystem {
    base_dir: Option<PathBuf>,
    next_file_id: AtomicU32,
    files: RwLock<HashMap<FileID, PageFile>>,
    txns: Mutex<HashMap<ThreadId, Txn>>,
}

struct PageFile {
    info: FileInfo,
    pages: Vec<CommittedPage>,
    handle: Option<(PathBuf, File)>,
}

struct CommittedPage {
    data: Arc<[u8]>,
    version: u64,
}

struct TxnPage {
    data: Arc<[u8]>,
    // 0 means the page is allocated by this transaction.
    base_version: u64,
    // pinned pages are validated and versioned but not rewritten.
    dirty: bool,
}

#[derive(Default)]
struct Txn {
    pages: BTreeMap<PageID, TxnPage>,
    page_counts: HashMap<FileID, u32>,
}

impl PageFileSystem {
    /// Create a file system without persistence.
    #[inline]
    pub fn in_memory() -> Self {
        PageFileSystem {
            base_dir: None,
            next_file_id: AtomicU32::new(1),
            files: RwLock::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
        }
    }

    /// Open a file system on given directory, loading all index files
    /// found in it. The directory is created if missing.
    #[inline]
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        let pattern = format!("{}/*.*idx", base_dir.display());
        let mut files = HashMap::new();
        let mut max_file_id = 0;
        for entry in glob::glob(&pattern)? {
            let path = entry?;
            let Some(info) = parse_file_name(&path) else {
                log::warn!("skip unrecognized file {}", path.display());
                continue;
            };
            let bytes = fs::read(&path)?;
            if bytes.len() % info.page_size != 0 {
                log::warn!(
                    "file {} has incomplete trailing page, length {} page size {}",
                    path.display(),
                    bytes.len(),
                    info.page_size
                );
                return Err(Error::InvalidFormat);
            }
            let pages = bytes
                .chunks_exact(info.page_size)
                .map(|chunk| CommittedPage {
                    data: Arc::from(chunk),
                    version: 1,
                })
                .collect::<Vec<_>>();
            let handle = OpenOptions::new().read(true).write(true).open(&path)?;
            log::debug!(
                "load file {} with {} pages from {}",
                info.name,
                pages.len(),
                path.display()
            );
            max_file_id = max_file_id.max(info.file_id);
            files.insert(
                info.file_id,
                PageFile {
                    info,
                    pages,
                    handle: Some((path, handle)),
                },
            );
        }
        Ok(PageFileSystem {
            base_dir: Some(base_dir),
            next_file_id: AtomicU32::new(max_file_id + 1),
            files: RwLock::new(files),
            txns: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    #[inline]
    fn file_path(&self, info: &FileInfo) -> Option<PathBuf> {
        self.base_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{}.{}.{}.{}",
                info.name, info.file_id, info.page_size, info.ext
            ))
        })
    }

    #[inline]
    fn with_txn<T>(&self, f: impl FnOnce(&mut Txn) -> Result<T>) -> Result<T> {
        let mut txns = self.txns.lock();
        match txns.get_mut(&thread::current().id()) {
            Some(txn) => f(txn),
            None => Err(Error::NoActiveTransaction),
        }
    }

    #[inline]
    fn txn_page(&self, page_id: PageID) -> Option<(Arc<[u8]>, u64)> {
        let txns = self.txns.lock();
        txns.get(&thread::current().id())
            .and_then(|txn| txn.pages.get(&page_id))
            .map(|p| (Arc::clone(&p.data), p.base_version))
    }

    #[inline]
    fn txn_page_count(&self, file_id: FileID) -> Option<u32> {
        let txns = self.txns.lock();
        txns.get(&thread::current().id())
            .and_then(|txn| txn.page_counts.get(&file_id).copied())
    }

    #[inline]
    fn committed_page(&self, page_id: PageID, page_size: usize) -> Result<(Arc<[u8]>, u64)> {
        let files = self.files.read();
        let file = files
            .get(&page_id.file_id)
            .ok_or(Error::FileNotFound(page_id.file_id))?;
        if file.info.page_size != page_size {
            return Err(Error::PageSizeMismatch(page_id.file_id));
        }
        file.pages
            .get(page_id.page_no as usize)
            .map(|p| (Arc::clone(&p.data), p.version))
            .ok_or(Error::PageNotFound(page_id))
    }

    #[inline]
    fn check_page_size(&self, file_id: FileID, page_size: usize) -> Result<()> {
        let files = self.files.read();
        let file = files.get(&file_id).ok_or(Error::FileNotFound(file_id))?;
        if file.info.page_size != page_size {
            return Err(Error::PageSizeMismatch(file_id));
        }
        Ok(())
    }

    /// Validate the transaction against committed state, write its pages
    /// to disk and publish them.
    fn apply(&self, txn: Txn) -> Result<()> {
        let mut files = self.files.write();
        // validate versions and sequential allocation before touching anything.
        let mut next_new: HashMap<FileID, PageNo> = HashMap::new();
        for (page_id, page) in &txn.pages {
            let file = files
                .get(&page_id.file_id)
                .ok_or(Error::FileNotFound(page_id.file_id))?;
            if page.base_version == 0 {
                let expected = next_new
                    .entry(page_id.file_id)
                    .or_insert(file.pages.len() as PageNo);
                if page_id.page_no != *expected {
                    return Err(Error::ConcurrentModification(*page_id));
                }
                *expected += 1;
            } else {
                match file.pages.get(page_id.page_no as usize) {
                    Some(committed) if committed.version == page.base_version => (),
                    _ => return Err(Error::ConcurrentModification(*page_id)),
                }
            }
        }
        // write through.
        let mut touched = Vec::new();
        for (page_id, page) in txn.pages.iter().filter(|(_, p)| p.dirty) {
            let file = &files[&page_id.file_id];
            if let Some((_, handle)) = file.handle.as_ref() {
                let offset = page_id.page_no as u64 * file.info.page_size as u64;
                handle.write_all_at(&page.data, offset)?;
                if touched.last() != Some(&page_id.file_id) {
                    touched.push(page_id.file_id);
                }
            }
        }
        for file_id in touched {
            if let Some((_, handle)) = files[&file_id].handle.as_ref() {
                handle.sync_data()?;
            }
        }
        // publish.
        for (page_id, page) in txn.pages {
            let Some(file) = files.get_mut(&page_id.file_id) else {
                continue;
            };
            let idx = page_id.page_no as usize;
            if idx < file.pages.len() {
                let committed = &mut file.pages[idx];
                if page.dirty {
                    committed.data = page.data;
                }
                committed.version += 1;
            } else {
                debug_assert_eq!(idx, file.pages.len());
                file.pages.push(CommittedPage {
                    data: page.data,
                    version: 1,
                });
            }
        }
        Ok(())
    }
}

#[inline]
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['.', '/', '\\']) {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Parse `<name>.<fileId>.<pageSize>.<ext>`.
#[inline]
fn parse_file_name(path: &Path) -> Option<FileInfo> {
    let file_name = path.file_name()?.to_str()?;
    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() != 4 || parts[0].is_empty() {
        return None;
    }
    let file_id = parts[1].parse::<FileID>().ok()?;
    let page_size = parts[2].parse::<usize>().ok()?;
    if page_size == 0 {
        return None;
    }
    Some(FileInfo {
        file_id,
        name: parts[0].to_string(),
        ext: parts[3].to_string(),
        page_size,
    })
}

impl PageStore for PageFileSystem {
    #[inline]
    fn create_file(&self, name: &str, ext: &str, page_size: usize) -> Result<FileID> {
        validate_name(name)?;
        validate_name(ext)?;
        if page_size == 0 {
            return Err(Error::InvalidPageSize(page_size));
        }
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let info = FileInfo {
            file_id,
            name: name.to_string(),
            ext: ext.to_string(),
            page_size,
        };
        let handle = match self.file_path(&info) {
            Some(path) => {
                let f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)?;
                Some((path, f))
            }
            None => None,
        };
        log::debug!("create file {} with id {}", name, file_id);
        self.files.write().insert(
            file_id,
            PageFile {
                info,
                pages: vec![],
                handle,
            },
        );
        Ok(file_id)
    }

    #[inline]
    fn rename_file(&self, file_id: FileID, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut files = self.files.write();
        let file = files.get_mut(&file_id).ok_or(Error::FileNotFound(file_id))?;
        let mut info = file.info.clone();
        info.name = name.to_string();
        if let (Some((path, _)), Some(new_path)) =
            (file.handle.as_mut(), self.file_path(&info))
        {
            fs::rename(path.as_path(), &new_path)?;
            *path = new_path;
        }
        file.info = info;
        Ok(())
    }

    #[inline]
    fn drop_file(&self, file_id: FileID) -> Result<()> {
        let file = self
            .files
            .write()
            .remove(&file_id)
            .ok_or(Error::FileNotFound(file_id))?;
        if let Some((path, handle)) = file.handle {
            drop(handle);
            fs::remove_file(path)?;
        }
        log::debug!("drop file {} with id {}", file.info.name, file_id);
        Ok(())
    }

    #[inline]
    fn files(&self) -> Vec<FileInfo> {
        let mut res: Vec<_> = self
            .files
            .read()
            .values()
            .map(|f| f.info.clone())
            .collect();
        res.sort_by_key(|f| f.file_id);
        res
    }

    #[inline]
    fn begin(&self) -> Result<()> {
        let mut txns = self.txns.lock();
        let thread_id = thread::current().id();
        if txns.contains_key(&thread_id) {
            return Err(Error::TransactionAlreadyActive);
        }
        txns.insert(thread_id, Txn::default());
        Ok(())
    }

    #[inline]
    fn commit(&self) -> Result<()> {
        let txn = self
            .txns
            .lock()
            .remove(&thread::current().id())
            .ok_or(Error::NoActiveTransaction)?;
        if txn.pages.is_empty() {
            return Ok(());
        }
        let page_count = txn.pages.len();
        self.apply(txn).inspect_err(|e| {
            log::warn!("transaction with {} pages rolled back: {}", page_count, e);
        })
    }

    #[inline]
    fn rollback(&self) -> Result<()> {
        self.txns
            .lock()
            .remove(&thread::current().id())
            .map(|_| ())
            .ok_or(Error::NoActiveTransaction)
    }

    #[inline]
    fn in_transaction(&self) -> bool {
        self.txns.lock().contains_key(&thread::current().id())
    }

    #[inline]
    fn page_count(&self, file_id: FileID) -> Result<u32> {
        let committed = {
            let files = self.files.read();
            let file = files.get(&file_id).ok_or(Error::FileNotFound(file_id))?;
            file.pages.len() as u32
        };
        Ok(self
            .txn_page_count(file_id)
            .map_or(committed, |count| count.max(committed)))
    }

    #[inline]
    fn get_page(&self, page_id: PageID, page_size: usize) -> Result<PageRef> {
        if let Some((data, _)) = self.txn_page(page_id) {
            return Ok(PageRef::new(page_id, data));
        }
        let (data, _) = self.committed_page(page_id, page_size)?;
        Ok(PageRef::new(page_id, data))
    }

    #[inline]
    fn get_page_to_modify(
        &self,
        page_id: PageID,
        page_size: usize,
        is_new: bool,
    ) -> Result<MutablePage> {
        if !self.in_transaction() {
            return Err(Error::NoActiveTransaction);
        }
        if is_new {
            self.check_page_size(page_id.file_id, page_size)?;
            let count = self.page_count(page_id.file_id)?;
            if page_id.page_no != count {
                return Err(Error::InvalidArgument);
            }
            let data = vec![0u8; page_size];
            self.with_txn(|txn| {
                txn.page_counts.insert(page_id.file_id, count + 1);
                // register allocation even if the page is never updated.
                txn.pages.insert(
                    page_id,
                    TxnPage {
                        data: Arc::from(data.as_slice()),
                        base_version: 0,
                        dirty: true,
                    },
                );
                Ok(())
            })?;
            log::debug!("allocate page {}", page_id);
            return Ok(MutablePage::new(page_id, data, 0));
        }
        if let Some((data, base_version)) = self.txn_page(page_id) {
            self.check_page_size(page_id.file_id, page_size)?;
            return Ok(MutablePage::new(page_id, data.to_vec(), base_version));
        }
        let (data, version) = self.committed_page(page_id, page_size)?;
        Ok(MutablePage::new(page_id, data.to_vec(), version))
    }

    #[inline]
    fn update_page(&self, page: MutablePage) -> Result<()> {
        let (page_id, data, base_version) = page.into_parts();
        self.with_txn(|txn| {
            txn.pages.insert(
                page_id,
                TxnPage {
                    data: Arc::from(data),
                    base_version,
                    dirty: true,
                },
            );
            Ok(())
        })
    }

    #[inline]
    fn pin_page(&self, page_id: PageID, page_size: usize) -> Result<()> {
        if self.txn_page(page_id).is_some() {
            return self.check_page_size(page_id.file_id, page_size);
        }
        let (data, version) = self.committed_page(page_id, page_size)?;
        self.with_txn(|txn| {
            txn.pages.insert(
                page_id,
                TxnPage {
                    data,
                    base_version: version,
                    dirty: false,
                },
            );
            Ok(())
        })
    }
}

const DEFAULT_PAGE_FS_BASE_DIR: Option<String> = None;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFileSystemConfig {
    // Directory of index files, pages are kept in memory only if not set.
    pub base_dir: Option<String>,
}

impl PageFileSystemConfig {
    #[inline]
    pub fn base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    #[inline]
    pub fn build(self) -> Result<PageFileSystem> {
        match self.base_dir {
            Some(dir) => PageFileSystem::open(dir),
            None => Ok(PageFileSystem::in_memory()),
        }
    }
}

impl Default for PageFileSystemConfig {
    #[inline]
    fn default() -> Self {
        PageFileSystemConfig {
            base_dir: DEFAULT_PAGE_FS_BASE_DIR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_fs_txn_visibility() {
        let fs = PageFileSystem::in_memory();
        let file_id = fs.create_file("idx1", "lsmidx", 64).unwrap();
        assert_eq!(fs.tail_page_no(file_id).unwrap(), None);
        fs.begin().unwrap();
        let mut page = fs.add_page(PageID::new(file_id, 0), 64).unwrap();
        page[0] = 42;
        fs.update_page(page).unwrap();
        assert_eq!(fs.page_count(file_id).unwrap(), 1);
        assert_eq!(fs.tail_page_no(file_id).unwrap(), Some(0));
        assert_eq!(fs.get_page(PageID::new(file_id, 0), 64).unwrap()[0], 42);

        // another thread does not see uncommitted page.
        thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(fs.page_count(file_id).unwrap(), 0);
                assert!(fs.get_page(PageID::new(file_id, 0), 64).is_err());
            });
        });
        fs.commit().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(fs.get_page(PageID::new(file_id, 0), 64).unwrap()[0], 42);
            });
        });
    }

    #[test]
    fn test_page_fs_rollback() {
        let fs = PageFileSystem::in_memory();
        let file_id = fs.create_file("idx1", "lsmidx", 64).unwrap();
        fs.begin().unwrap();
        fs.add_page(PageID::new(file_id, 0), 64).unwrap();
        assert_eq!(fs.page_count(file_id).unwrap(), 1);
        fs.rollback().unwrap();
        assert_eq!(fs.page_count(file_id).unwrap(), 0);
        assert!(matches!(fs.rollback(), Err(Error::NoActiveTransaction)));
        assert!(matches!(fs.commit(), Err(Error::NoActiveTransaction)));
    }

    #[test]
    fn test_page_fs_txn_rules() {
        let fs = PageFileSystem::in_memory();
        let file_id = fs.create_file("idx1", "lsmidx", 64).unwrap();
        let res = fs.add_page(PageID::new(file_id, 0), 64);
        assert!(matches!(res, Err(Error::NoActiveTransaction)));
        fs.begin().unwrap();
        assert!(matches!(fs.begin(), Err(Error::TransactionAlreadyActive)));
        // pages are allocated sequentially.
        let res = fs.add_page(PageID::new(file_id, 1), 64);
        assert!(matches!(res, Err(Error::InvalidArgument)));
        let res = fs.add_page(PageID::new(file_id, 0), 128);
        assert!(matches!(res, Err(Error::PageSizeMismatch(_))));
        fs.rollback().unwrap();
        assert!(fs.create_file("a.b", "lsmidx", 64).is_err());
        assert!(fs.create_file("a", "lsmidx", 0).is_err());
    }

    #[test]
    fn test_page_fs_concurrent_modification() {
        let fs = PageFileSystem::in_memory();
        let file_id = fs.create_file("idx1", "lsmidx", 64).unwrap();
        let page_id = PageID::new(file_id, 0);
        fs.transaction(|| {
            let page = fs.add_page(page_id, 64)?;
            fs.update_page(page)
        })
        .unwrap();

        fs.begin().unwrap();
        let mut page = fs.get_page_to_modify(page_id, 64, false).unwrap();
        page[1] = 1;
        fs.update_page(page).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                fs.transaction(|| {
                    let mut page = fs.get_page_to_modify(page_id, 64, false)?;
                    page[1] = 2;
                    fs.update_page(page)
                })
                .unwrap();
            });
        });
        let res = fs.commit();
        assert!(matches!(res, Err(Error::ConcurrentModification(_))));
        assert!(!fs.in_transaction());
        assert_eq!(fs.get_page(page_id, 64).unwrap()[1], 2);
    }

    #[test]
    fn test_page_fs_pin_page() {
        let fs = PageFileSystem::in_memory();
        let file_id = fs.create_file("idx1", "lsmidx", 64).unwrap();
        let page_id = PageID::new(file_id, 0);
        fs.transaction(|| {
            let mut page = fs.add_page(page_id, 64)?;
            page[0] = 1;
            fs.update_page(page)
        })
        .unwrap();
        let modify = |value: u8| {
            thread::scope(|s| {
                s.spawn(|| {
                    fs.transaction(|| {
                        let mut page = fs.get_page_to_modify(page_id, 64, false)?;
                        page[0] = value;
                        fs.update_page(page)
                    })
                })
                .join()
                .unwrap()
            })
        };

        // writer commits between pin and commit.
        fs.begin().unwrap();
        fs.pin_page(page_id, 64).unwrap();
        modify(2).unwrap();
        assert!(matches!(
            fs.commit(),
            Err(Error::ConcurrentModification(_))
        ));
        assert_eq!(fs.get_page(page_id, 64).unwrap()[0], 2);

        // writer copied the page before the pin was committed.
        fs.begin().unwrap();
        fs.pin_page(page_id, 64).unwrap();
        let fs = &fs;
        thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel();
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let writer = s.spawn(move || {
                fs.begin().unwrap();
                let mut page = fs.get_page_to_modify(page_id, 64, false).unwrap();
                page[0] = 3;
                fs.update_page(page).unwrap();
                tx.send(()).unwrap();
                done_rx.recv().unwrap();
                fs.commit()
            });
            rx.recv().unwrap();
            fs.commit().unwrap();
            done_tx.send(()).unwrap();
            let res = writer.join().unwrap();
            assert!(matches!(res, Err(Error::ConcurrentModification(_))));
        });
        // pinned commit keeps page content.
        assert_eq!(fs.get_page(page_id, 64).unwrap()[0], 2);
        assert!(matches!(
            fs.pin_page(page_id, 64),
            Err(Error::NoActiveTransaction)
        ));
    }

    #[test]
    fn test_page_fs_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let file_id = {
            let fs = PageFileSystemConfig::default()
                .base_dir(dir.path().to_string_lossy())
                .build()
                .unwrap();
            let file_id = fs.create_file("orders", "lsmidx", 32).unwrap();
            fs.transaction(|| {
                for page_no in 0..3 {
                    let mut page = fs.add_page(PageID::new(file_id, page_no), 32)?;
                    page[0] = page_no as u8 + 10;
                    fs.update_page(page)?;
                }
                Ok(())
            })
            .unwrap();
            fs.rename_file(file_id, "orders2").unwrap();
            file_id
        };
        let fs = PageFileSystem::open(dir.path()).unwrap();
        let files = fs.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "orders2");
        assert_eq!(files[0].page_size, 32);
        assert_eq!(fs.page_count(file_id).unwrap(), 3);
        assert_eq!(fs.get_page(PageID::new(file_id, 2), 32).unwrap()[0], 12);
        // new file id does not collide with loaded ones.
        let new_id = fs.create_file("other", "ulsmidx", 32).unwrap();
        assert!(new_id > file_id);
        fs.drop_file(file_id).unwrap();
        assert_eq!(fs.files().len(), 1);
        let fs = PageFileSystem::open(dir.path()).unwrap();
        assert_eq!(fs.files()[0].name, "other");
    }

    #[test]
    fn test_parse_file_name() {
        let info = parse_file_name(Path::new("/tmp/idx_a.7.4096.ulsmidx")).unwrap();
        assert_eq!(info.name, "idx_a");
        assert_eq!(info.file_id, 7);
        assert_eq!(info.page_size, 4096);
        assert_eq!(info.ext, "ulsmidx");
        assert!(parse_file_name(Path::new("idx.x.4096.lsmidx")).is_none());
        assert!(parse_file_name(Path::new("idx.4096.lsmidx")).is_none());
    }
}
