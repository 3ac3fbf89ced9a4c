use crate::error::Result;
use crate::file::{PageNo, PageRef};
use crate::index::lsm_page::{LookupResult, LsmPage, PageLayout};
use lsmdb_datatype::Val;
use std::ops::Bound;
use std::sync::Arc;

/// One key/value pair read from an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub keys: Vec<Val>,
    pub value: Val,
}

/// Cursor over the pointer array of one page.
///
/// The cursor is positioned on an entry: its keys are decoded when the
/// cursor moves there, and the value offset is kept so that the value is
/// decoded only when asked for.
pub struct PageIterator {
    layout: Arc<PageLayout>,
    page: PageRef,
    count: usize,
    pos: isize,
    ascending: bool,
    current: Option<(Vec<Val>, usize)>,
}

impl PageIterator {
    /// Create an iterator positioned at the first entry in iteration order.
    #[inline]
    pub fn new(layout: Arc<PageLayout>, page: PageRef, ascending: bool) -> Result<Self> {
        Self::seek(layout, page, ascending, Bound::Unbounded)
    }

    /// Create an iterator positioned at the first entry not before `from`
    /// in iteration order. The bound may be a partial key.
    #[inline]
    pub fn seek(
        layout: Arc<PageLayout>,
        page: PageRef,
        ascending: bool,
        from: Bound<&[Val]>,
    ) -> Result<Self> {
        let page_no = page.id().page_no;
        let view = LsmPage::new(&layout, page_no, &page[..])?;
        let count = view.count();
        let pos = match (from, ascending) {
            (Bound::Unbounded, true) => 0,
            (Bound::Unbounded, false) => count as isize - 1,
            (Bound::Included(keys), true) => match view.lookup(keys, true)? {
                LookupResult::Found { slot, .. } | LookupResult::NotFound { slot } => {
                    slot as isize
                }
            },
            (Bound::Included(keys), false) => match view.lookup(keys, false)? {
                LookupResult::Found { slot, .. } => slot as isize,
                LookupResult::NotFound { slot } => slot as isize - 1,
            },
            (Bound::Excluded(keys), true) => match view.lookup(keys, false)? {
                LookupResult::Found { slot, .. } => slot as isize + 1,
                LookupResult::NotFound { slot } => slot as isize,
            },
            (Bound::Excluded(keys), false) => match view.lookup(keys, true)? {
                LookupResult::Found { slot, .. } | LookupResult::NotFound { slot } => {
                    slot as isize - 1
                }
            },
        };
        let mut iter = PageIterator {
            layout,
            page,
            count,
            pos,
            ascending,
            current: None,
        };
        iter.load()?;
        Ok(iter)
    }

    #[inline]
    fn view(&self) -> LsmPage<'_, &[u8]> {
        LsmPage::new_unchecked(&self.layout, self.page.id().page_no, &self.page[..])
    }

    #[inline]
    fn load(&mut self) -> Result<()> {
        self.current = match self.slot() {
            Some(slot) => {
                let view = self.view();
                Some(view.read_keys(view.entry_offset(slot)?)?)
            }
            None => None,
        };
        Ok(())
    }

    #[inline]
    pub fn page_no(&self) -> PageNo {
        self.page.id().page_no
    }

    /// Slot of current entry, None if iterator is exhausted.
    #[inline]
    pub fn slot(&self) -> Option<usize> {
        if self.pos >= 0 && (self.pos as usize) < self.count {
            Some(self.pos as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        if self.ascending {
            self.pos + 1 < self.count as isize
        } else {
            self.pos > 0
        }
    }

    /// Keys of current entry.
    #[inline]
    pub fn keys(&self) -> Option<&[Val]> {
        self.current.as_ref().map(|(keys, _)| &keys[..])
    }

    /// Value of current entry.
    #[inline]
    pub fn value(&self) -> Result<Option<Val>> {
        match &self.current {
            Some((_, value_offset)) => self.view().read_value(*value_offset).map(Some),
            None => Ok(None),
        }
    }

    /// Move to next entry, returns false when exhausted.
    #[inline]
    pub fn advance(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        self.pos += if self.ascending { 1 } else { -1 };
        self.load()?;
        Ok(self.current.is_some())
    }

    /// Take current entry and move to the next one.
    #[inline]
    pub fn take_entry(&mut self) -> Result<Option<IndexEntry>> {
        let Some((keys, value_offset)) = self.current.take() else {
            return Ok(None);
        };
        let value = self.view().read_value(value_offset)?;
        self.pos += if self.ascending { 1 } else { -1 };
        self.load()?;
        Ok(Some(IndexEntry { keys, value }))
    }
}

impl Iterator for PageIterator {
    type Item = Result<IndexEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.take_entry().transpose()
    }
}
