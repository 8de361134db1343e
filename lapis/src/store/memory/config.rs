/// Configuration for an in-memory store.
///
/// # Purpose
/// `InMemoryStoreConfig` carries the physical parameters an in-memory store
/// reports to its consumers. Index modules size their fixed-width node
/// buffers from the configured page size, so varying it in tests exercises
/// different node capacities.
///
/// # Usage
/// ```text
/// let config = InMemoryStoreConfig::new().with_page_size(1024);
/// let store = InMemoryStore::new(config);
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
    page_size: usize,
}

/// Default page size reported by in-memory stores, matching the common
/// pager default.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

impl InMemoryStoreConfig {
    /// Creates a new `InMemoryStoreConfig` with default settings.
    pub fn new() -> InMemoryStoreConfig {
        InMemoryStoreConfig {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Overrides the reported page size.
    pub fn with_page_size(mut self, page_size: usize) -> InMemoryStoreConfig {
        self.page_size = page_size;
        self
    }

    /// The page size this store reports.
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self::new()
    }
}
