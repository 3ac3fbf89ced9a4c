use crate::catalog::TEMP_INDEX_PREFIX;
use crate::error::{Error, Result};
use crate::file::{MutablePage, PageNo, PageStore};
use crate::index::lsm_index::LsmIndex;
use crate::index::lsm_page::LsmPage;
use crate::index::merge_cursor::MergeCursor;
use crate::index::page_iter::{IndexEntry, PageIterator};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

// commits of the final copy retried on conflict with a committing writer.
const FINAL_COPY_ATTEMPTS: usize = 8;

/// Summary of one compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Index had fewer pages than the configured minimum.
    pub skipped: bool,
    pub pages_read: u32,
    pub batches: usize,
    pub entries_read: u64,
    pub entries_written: u64,
    pub duplicates_removed: u64,
    pub pages_written: u32,
    /// Pages appended while compaction was running, copied as they are.
    pub pages_carried: u32,
}

/// Rewrites all pages of an index into a new index with globally sorted
/// pages, then swaps the new index in through the catalog.
///
/// Pages existing at start are sealed: concurrent inserts go to new pages,
/// which are copied into the new index before the swap.
/// Input pages are merged in batches bounded by the configured memory
/// budget, with a commit after each filled output page and each batch.
///
/// Before the swap the source index is frozen and the new pages are copied
/// in one transaction that pins every source page. Writers that have not
/// committed by then fail on commit. A removal committed on a sealed page
/// after it was merged fails the compaction with `ConcurrentModification`.
pub(crate) struct Compactor<'a, S: PageStore> {
    index: &'a LsmIndex<S>,
    // entry count of each sealed page when it was merged.
    sealed_counts: Vec<usize>,
    stats: CompactionStats,
}

impl<'a, S: PageStore> Compactor<'a, S> {
    #[inline]
    pub fn new(index: &'a LsmIndex<S>) -> Self {
        Compactor {
            index,
            sealed_counts: Vec::new(),
            stats: CompactionStats::default(),
        }
    }

    /// Run compaction, caller must hold the compaction guard of the index.
    pub fn run(mut self) -> Result<CompactionStats> {
        let index = self.index;
        let store = index.store();
        let catalog = index.catalog().ok_or(Error::InvalidState)?;
        if store.in_transaction() {
            return Err(Error::TransactionAlreadyActive);
        }
        let name = index.name();
        let sealed = store.page_count(index.file_id())?;
        let min_pages = index.config().compaction.min_pages;
        if sealed == 0 || (sealed as usize) < min_pages {
            log::debug!(
                "skip compaction of index {} with {} pages, minimum is {}",
                name,
                sealed,
                min_pages
            );
            self.stats.skipped = true;
            return Ok(self.stats);
        }
        index.sealed_pages().store(sealed, Ordering::Release);
        log::info!("compaction of index {} starts with {} pages", name, sealed);
        let start = Instant::now();

        let temp_name = format!("{}{}", TEMP_INDEX_PREFIX, name);
        let config = index.config().clone();
        let target = Arc::new(LsmIndex::create(
            Arc::clone(store),
            Arc::downgrade(&catalog),
            &temp_name,
            &index.spec(),
            config,
        )?);
        catalog.register_file(Arc::clone(&target))?;

        let res = self
            .merge(&target, sealed)
            .and_then(|tail| self.carry_over(&target, sealed, tail))
            .and_then(|_| catalog.swap_indexes(index, Arc::clone(&target)));
        if let Err(e) = res {
            if store.in_transaction() {
                let _ = store.rollback();
            }
            if let Err(drop_err) = catalog.drop_index(&temp_name) {
                log::warn!(
                    "failed to drop compaction target {}: {}",
                    temp_name,
                    drop_err
                );
            }
            log::warn!("compaction of index {} failed: {}", name, e);
            return Err(e);
        }
        target.record_compaction();
        index.record_compaction();
        log::info!(
            "compaction of index {} finished in {:?}: {} pages read, {} pages written, {} entries written, {} duplicates removed, {} pages carried over",
            name,
            start.elapsed(),
            self.stats.pages_read,
            self.stats.pages_written,
            self.stats.entries_written,
            self.stats.duplicates_removed,
            self.stats.pages_carried
        );
        Ok(self.stats)
    }

    /// Merge sealed pages into target, returns last page number of target.
    fn merge(&mut self, target: &LsmIndex<S>, sealed: PageNo) -> Result<PageNo> {
        let index = self.index;
        let store = index.store();
        let page_size = index.layout().page_size();
        let batch_size = index.config().compaction.pages_per_batch(page_size) as PageNo;
        let mut appender = PageAppender::new(target);
        store.begin()?;
        let mut batch_start = 0;
        while batch_start < sealed {
            let batch_end = sealed.min(batch_start + batch_size);
            let mut iters = Vec::with_capacity((batch_end - batch_start) as usize);
            for page_no in batch_start..batch_end {
                let page = store.get_page(index.page_id(page_no), page_size)?;
                let count = LsmPage::new(index.layout(), page_no, &page[..])?.count();
                self.sealed_counts.push(count);
                iters.push(PageIterator::new(Arc::clone(index.layout()), page, true)?);
            }
            let mut cursor = MergeCursor::new(iters, true, Bound::Unbounded)?;
            let mut last: Option<IndexEntry> = None;
            while let Some(entry) = cursor.next_entry()? {
                self.stats.entries_read += 1;
                if last.as_ref() == Some(&entry) {
                    self.stats.duplicates_removed += 1;
                    continue;
                }
                appender.append(&entry)?;
                self.stats.entries_written += 1;
                last = Some(entry);
            }
            appender.end_run()?;
            store.commit()?;
            store.begin()?;
            self.stats.pages_read += batch_end - batch_start;
            self.stats.batches += 1;
            log::debug!(
                "compaction of index {} merged pages {}..{}",
                index.name(),
                batch_start,
                batch_end
            );
            batch_start = batch_end;
        }
        store.commit()?;
        self.stats.pages_written = appender.page_no + 1;
        Ok(appender.page_no)
    }

    /// Freeze the source and copy pages appended after it was sealed.
    fn carry_over(&mut self, target: &LsmIndex<S>, sealed: PageNo, tail: PageNo) -> Result<()> {
        let index = self.index;
        let store = index.store();
        index.freeze_writes();
        let mut attempt = 1;
        loop {
            store.begin()?;
            let carried = self.copy_tail(target, sealed, tail)?;
            // a failed commit ends the transaction.
            match store.commit() {
                Ok(()) => {
                    self.stats.pages_carried = carried;
                    return Ok(());
                }
                Err(Error::ConcurrentModification(page_id)) if attempt < FINAL_COPY_ATTEMPTS => {
                    log::debug!(
                        "final copy of index {} conflicts on page {}, attempt {}",
                        index.name(),
                        page_id,
                        attempt
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pin all source pages, copy the unsealed ones into target and occupy
    /// the next source page so that pending allocations fail on commit.
    fn copy_tail(&self, target: &LsmIndex<S>, sealed: PageNo, tail: PageNo) -> Result<u32> {
        let index = self.index;
        let store = index.store();
        let layout = index.layout();
        let page_size = layout.page_size();
        let count = store.page_count(index.file_id())?;
        for page_no in 0..count {
            let page_id = index.page_id(page_no);
            store.pin_page(page_id, page_size)?;
            if page_no < sealed {
                let page = store.get_page(page_id, page_size)?;
                let entries = LsmPage::new(layout, page_no, &page[..])?.count();
                if entries != self.sealed_counts[page_no as usize] {
                    // removal after merge cannot be applied to the new index.
                    return Err(Error::ConcurrentModification(page_id));
                }
                continue;
            }
            let src = store.get_page(page_id, page_size)?;
            let dst_no = tail + 1 + page_no - sealed;
            let mut dst = store.add_page(target.page_id(dst_no), page_size)?;
            // both pages have the short header, so offsets stay valid.
            dst.copy_from_slice(&src);
            store.update_page(dst)?;
        }
        let mut fence = store.add_page(index.page_id(count), page_size)?;
        layout.init_page(count, &mut fence, index.next_seed());
        store.update_page(fence)?;
        Ok(count - sealed)
    }
}

/// Append-only writer into the pages of a new index.
/// Input arrives sorted, so entries only go to the end of the current page.
/// Each sorted run starts on its own page to keep every page ordered.
struct PageAppender<'a, S: PageStore> {
    index: &'a LsmIndex<S>,
    page_no: PageNo,
    page: Option<MutablePage>,
    page_entries: usize,
    run_ended: bool,
}

impl<'a, S: PageStore> PageAppender<'a, S> {
    #[inline]
    fn new(index: &'a LsmIndex<S>) -> Self {
        PageAppender {
            index,
            page_no: 0,
            page: None,
            page_entries: 0,
            run_ended: false,
        }
    }

    #[inline]
    fn try_append(&self, page: &mut MutablePage, entry: &IndexEntry) -> Result<bool> {
        let mut view = LsmPage::new(self.index.layout(), self.page_no, &mut page[..])?;
        if !view.append(&entry.keys, &entry.value) {
            return Ok(false);
        }
        if let Some(hash) = self.index.bloom_hash(&entry.keys) {
            view.add_to_bloom(hash);
        }
        Ok(true)
    }

    fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        let store = self.index.store();
        let page_size = self.index.layout().page_size();
        let spill = self.run_ended && self.page_entries > 0;
        self.run_ended = false;
        if !spill {
            let mut page = match self.page.take() {
                Some(page) => page,
                None => {
                    store.get_page_to_modify(self.index.page_id(self.page_no), page_size, false)?
                }
            };
            if self.try_append(&mut page, entry)? {
                self.page = Some(page);
                self.page_entries += 1;
                return Ok(());
            }
            // current page is full, spill to a new one.
            store.update_page(page)?;
            store.commit()?;
            store.begin()?;
        }
        self.page_no += 1;
        self.page_entries = 0;
        let mut page = store.add_page(self.index.page_id(self.page_no), page_size)?;
        self.index
            .layout()
            .init_page(self.page_no, &mut page, self.index.next_seed());
        if !self.try_append(&mut page, entry)? {
            return Err(Error::EntryTooLarge {
                len: self.index.layout().entry_len(&entry.keys, &entry.value),
                page_size,
            });
        }
        self.page = Some(page);
        self.page_entries = 1;
        Ok(())
    }

    /// Write the current page, the next entry starts a new page.
    #[inline]
    fn end_run(&mut self) -> Result<()> {
        if let Some(page) = self.page.take() {
            self.index.store().update_page(page)?;
        }
        self.run_ended = true;
        Ok(())
    }
}
