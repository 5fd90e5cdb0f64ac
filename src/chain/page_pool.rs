//! Process-private page pool backing in-memory blocks.
//!
//! Block maps are slotted arrays written into pages rented from here, never
//! from the paged store. A page is owned by exactly one block at a time and
//! comes back when the block is dropped after its flush.

use parking_lot::Mutex;

use crate::store::PAGE_SIZE;

/// A page rented from the pool.
pub type PoolPage = Box<[u8; PAGE_SIZE]>;

/// A fixed-size pool of pre-allocated pages.
pub struct PagePool {
    free: Mutex<Vec<PoolPage>>,
}

impl PagePool {
    /// Default pool size (1024 pages, 4 MiB).
    pub const DEFAULT_PAGES: usize = 1024;

    /// Creates a pool with `pages` pre-allocated pages.
    pub fn new(pages: usize) -> Self {
        let free = (0..pages).map(|_| Box::new([0u8; PAGE_SIZE])).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    /// Rents a page; `None` when the pool is exhausted.
    pub fn rent(&self) -> Option<PoolPage> {
        self.free.lock().pop()
    }

    /// Returns a page to the pool.
    pub fn give_back(&self, page: PoolPage) {
        self.free.lock().push(page);
    }

    /// Number of pages currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}
