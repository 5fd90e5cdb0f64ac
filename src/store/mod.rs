//! Page-based persistent storage.
//!
//! This module implements memory-mapped file storage with Copy-on-Write
//! batches, a root ring for atomic durable commits, and delayed reuse of
//! freed pages so read snapshots stay valid without locks.

mod data_page;
mod db_address;
mod page;
mod page_header;
mod page_types;
mod paged_db;

pub use db_address::DbAddress;
pub use page::{Page, PAGE_SIZE};
pub use page_header::{PageHeader, PageType, CURRENT_VERSION, MODE_FAN_OUT, MODE_LEAF};
pub use page_types::{
    AbandonedPage, BottomPage, DataPage, LeafOverflowPage, RootPage, BUCKET_COUNT,
};
pub use paged_db::{
    BatchContext, CommitOptions, DbError, PageSource, PagedDb, ReadOnlyBatch, Result,
};
