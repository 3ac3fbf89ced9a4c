use crate::index::SeedSource;
use byte_unit::Byte;
use lsmdb_datatype::ValKind;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: Byte = Byte::from_u64(256 * 1024);
pub const DEFAULT_COMPACTION_RAM_BUDGET: Byte = Byte::from_u64(300 * 1024 * 1024);
pub const DEFAULT_COMPACTION_MIN_PAGES: usize = 10;

/// File extension of non-unique index files.
pub const INDEX_FILE_EXT: &str = "lsmidx";
/// File extension of unique index files.
pub const UNIQUE_INDEX_FILE_EXT: &str = "ulsmidx";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsmIndexConfig {
    pub page_size: Byte,
    // Fixed seed makes bloom seeds of new pages reproducible.
    pub bloom_seed: Option<u64>,
    pub compaction: CompactionConfig,
}

impl Default for LsmIndexConfig {
    #[inline]
    fn default() -> Self {
        LsmIndexConfig {
            page_size: DEFAULT_PAGE_SIZE,
            bloom_seed: None,
            compaction: CompactionConfig::default(),
        }
    }
}

impl LsmIndexConfig {
    #[inline]
    pub fn page_size(mut self, page_size: impl Into<Byte>) -> Self {
        self.page_size = page_size.into();
        self
    }

    #[inline]
    pub fn bloom_seed(mut self, bloom_seed: u64) -> Self {
        self.bloom_seed = Some(bloom_seed);
        self
    }

    #[inline]
    pub fn compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    #[inline]
    pub fn page_size_bytes(&self) -> usize {
        self.page_size.as_u64() as usize
    }

    #[inline]
    pub fn seed_source(&self) -> SeedSource {
        match self.bloom_seed {
            Some(seed) => SeedSource::seeded(seed),
            None => SeedSource::from_entropy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    // Memory used by one merge batch, decides pages per batch.
    pub ram_budget: Byte,
    // Indexes with fewer pages are not compacted.
    pub min_pages: usize,
}

impl Default for CompactionConfig {
    #[inline]
    fn default() -> Self {
        CompactionConfig {
            ram_budget: DEFAULT_COMPACTION_RAM_BUDGET,
            min_pages: DEFAULT_COMPACTION_MIN_PAGES,
        }
    }
}

impl CompactionConfig {
    #[inline]
    pub fn ram_budget(mut self, ram_budget: impl Into<Byte>) -> Self {
        self.ram_budget = ram_budget.into();
        self
    }

    #[inline]
    pub fn min_pages(mut self, min_pages: usize) -> Self {
        self.min_pages = min_pages;
        self
    }

    #[inline]
    pub fn pages_per_batch(&self, page_size: usize) -> usize {
        (self.ram_budget.as_u64() as usize / page_size.max(1)).max(1)
    }
}

/// Definition of index columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub key_types: Vec<ValKind>,
    pub value_type: ValKind,
    // Leading key columns hashed into page bloom filters, 0 disables them.
    pub bloom_key_depth: usize,
    pub unique: bool,
}

impl IndexSpec {
    /// Create a non-unique index spec, bloom filters cover all key columns.
    #[inline]
    pub fn new(key_types: Vec<ValKind>, value_type: ValKind) -> Self {
        let bloom_key_depth = key_types.len();
        IndexSpec {
            key_types,
            value_type,
            bloom_key_depth,
            unique: false,
        }
    }

    #[inline]
    pub fn bloom_key_depth(mut self, bloom_key_depth: usize) -> Self {
        self.bloom_key_depth = bloom_key_depth;
        self
    }

    #[inline]
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    #[inline]
    pub fn file_ext(&self) -> &'static str {
        if self.unique {
            UNIQUE_INDEX_FILE_EXT
        } else {
            INDEX_FILE_EXT
        }
    }
}
