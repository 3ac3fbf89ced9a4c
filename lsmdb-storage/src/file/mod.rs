pub mod page_fs;

pub use page_fs::{PageFileSystem, PageFileSystemConfig};

use crate::error::Result;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub type FileID = u32;
pub type PageNo = u32;

/// Address of a page: file identity and page number inside that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageID {
    pub file_id: FileID,
    pub page_no: PageNo,
}

impl PageID {
    #[inline]
    pub const fn new(file_id: FileID, page_no: PageNo) -> Self {
        PageID { file_id, page_no }
    }
}

impl fmt::Display for PageID {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_no)
    }
}

/// Read-only snapshot of a page.
/// Cloning is cheap, the bytes are shared with the store.
#[derive(Clone)]
pub struct PageRef {
    id: PageID,
    data: Arc<[u8]>,
}

impl PageRef {
    #[inline]
    pub fn new(id: PageID, data: Arc<[u8]>) -> Self {
        PageRef { id, data }
    }

    #[inline]
    pub fn id(&self) -> PageID {
        self.id
    }
}

impl Deref for PageRef {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Private copy of a page owned by the current transaction.
///
/// Changes become visible to the transaction only after the page is handed
/// back through [`PageStore::update_page`], and to others only after commit.
pub struct MutablePage {
    id: PageID,
    data: Vec<u8>,
    // version of the committed page this copy is based on, 0 for new page.
    base_version: u64,
}

impl MutablePage {
    #[inline]
    pub fn new(id: PageID, data: Vec<u8>, base_version: u64) -> Self {
        MutablePage {
            id,
            data,
            base_version,
        }
    }

    #[inline]
    pub fn id(&self) -> PageID {
        self.id
    }

    #[inline]
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    #[inline]
    pub fn into_parts(self) -> (PageID, Vec<u8>, u64) {
        (self.id, self.data, self.base_version)
    }
}

impl Deref for MutablePage {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MutablePage {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_id: FileID,
    pub name: String,
    pub ext: String,
    pub page_size: usize,
}

/// Transactional store of fixed-size pages.
///
/// Transactions are bound to the calling thread. Reads outside a
/// transaction see committed pages only. Every page of one file has the
/// same size, and pages of a file are allocated sequentially.
pub trait PageStore: Send + Sync + 'static {
    /// Create a new empty file and returns its identity.
    fn create_file(&self, name: &str, ext: &str, page_size: usize) -> Result<FileID>;

    /// Change logical name of a file.
    fn rename_file(&self, file_id: FileID, name: &str) -> Result<()>;

    /// Remove a file with all its pages.
    fn drop_file(&self, file_id: FileID) -> Result<()>;

    /// List all files ordered by file id.
    fn files(&self) -> Vec<FileInfo>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    /// Number of pages visible to the caller, including pages allocated
    /// by its own transaction.
    fn page_count(&self, file_id: FileID) -> Result<u32>;

    /// Returns a consistent read-only view of the page.
    fn get_page(&self, page_id: PageID, page_size: usize) -> Result<PageRef>;

    /// Returns a private copy of the page for modification.
    /// If `is_new` is true, the page must be the next one of the file
    /// and is allocated zeroed.
    fn get_page_to_modify(
        &self,
        page_id: PageID,
        page_size: usize,
        is_new: bool,
    ) -> Result<MutablePage>;

    /// Hand a modified page back to the current transaction.
    fn update_page(&self, page: MutablePage) -> Result<()>;

    /// Add the page unchanged to the current transaction. Commit fails if
    /// another transaction committed the page after it was pinned, and
    /// transactions that modified the page before the commit fail on
    /// their own commit.
    fn pin_page(&self, page_id: PageID, page_size: usize) -> Result<()>;

    #[inline]
    fn add_page(&self, page_id: PageID, page_size: usize) -> Result<MutablePage> {
        self.get_page_to_modify(page_id, page_size, true)
    }

    /// Page number of the last page, None if file is empty.
    #[inline]
    fn tail_page_no(&self, file_id: FileID) -> Result<Option<PageNo>> {
        Ok(self.page_count(file_id)?.checked_sub(1))
    }

    /// Run the closure in a new transaction, commit on success and
    /// rollback on failure.
    #[inline]
    fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce() -> Result<T>,
    {
        self.begin()?;
        match f() {
            Ok(res) => {
                self.commit()?;
                Ok(res)
            }
            Err(e) => {
                if self.in_transaction() {
                    self.rollback()?;
                }
                Err(e)
            }
        }
    }
}
