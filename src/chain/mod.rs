//! Block management for unfinalized state.
//!
//! This module handles the "hot" blocks (latest, safe) that are not yet
//! finalized, supporting parallel block creation from the same parent, chain
//! reads across ancestors, and asynchronous finalization into the paged
//! store.

mod block;
mod blockchain;
mod bloom;
mod page_pool;

pub use block::{Block, CommittedBlock};
pub use blockchain::{Blockchain, BlockchainError, Result};
pub use bloom::BloomFilter;
pub use page_pool::{PagePool, PoolPage};
