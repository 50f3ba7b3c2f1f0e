//! Plain parameter structs used to construct `TupleFifo`s and
//! `StageContainer`s. These are in-process value types handed directly by
//! callers, not loaders that read files or environment variables (those are
//! explicitly out of scope, see `lib.rs`).

/// Default page size used throughout the engine, matching the original
/// `tuple_fifo`/`page` defaults (4096 bytes).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default buffer capacity for a `TupleFifo`, in pages.
pub const DEFAULT_BUFFER_PAGES: usize = 100;

/// Default wakeup threshold for a `TupleFifo`, in pages. Producers/consumers
/// blocked on a full/empty buffer are only woken once this many slots free
/// up, to avoid thrashing on every single page.
pub const DEFAULT_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct FifoConfig {
    pub page_size: usize,
    pub capacity: usize,
    pub threshold: usize,
}

impl Default for FifoConfig {
    fn default() -> Self {
        FifoConfig {
            page_size: DEFAULT_PAGE_SIZE,
            capacity: DEFAULT_BUFFER_PAGES,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl FifoConfig {
    pub fn new(page_size: usize, capacity: usize, threshold: usize) -> Self {
        FifoConfig {
            page_size,
            capacity,
            threshold,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContainerConfig {
    pub worker_count: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig { worker_count: 4 }
    }
}

impl ContainerConfig {
    pub fn new(worker_count: usize) -> Self {
        ContainerConfig { worker_count }
    }
}
