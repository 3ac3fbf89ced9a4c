mod bloom;
mod compactor;
mod kind;
mod lsm_index;
mod lsm_page;
mod merge_cursor;
mod page_iter;
mod search;

pub use bloom::*;
pub use compactor::CompactionStats;
pub use kind::*;
pub use lsm_index::*;
pub use lsm_page::*;
pub use merge_cursor::*;
pub use page_iter::*;
