//! Blockchain - manages blocks before finalization.
//!
//! This component handles the "hot" state that hasn't been finalized yet.
//! Multiple blocks may exist per height; finalizing a block pushes it and its
//! unfinalized ancestors to a single background flusher that applies them to
//! the paged store and commits. Flushed blocks are removed from the indices
//! the next time the caller touches the public API, swapping the database
//! read snapshot at the same time.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use primitive_types::H256;
use rustc_hash::FxBuildHasher;
use thiserror::Error;

use crate::data::MalformedAccount;
use crate::store::{CommitOptions, DbError, PagedDb, ReadOnlyBatch};

use super::block::{Block, CommittedBlock};
use super::page_pool::PagePool;

type FastHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// Blockchain errors.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("block not found: {0:?}")]
    BlockNotFound(H256),
    #[error("block already exists: {0:?}")]
    BlockExists(H256),
    #[error("block {number} is not after the last finalized block {finalized}")]
    NotAfterFinalized { number: u32, finalized: u32 },
    #[error("page pool exhausted")]
    PoolExhausted,
    #[error("value does not fit a pool page")]
    ValueTooLarge,
    #[error("blockchain is closed")]
    Closed,
    #[error("stored account: {0}")]
    BadAccount(#[from] MalformedAccount),
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Result type for blockchain operations.
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Soft bound on how many finalized blocks fuse into one database commit.
const FLUSH_WINDOW: Duration = Duration::from_secs(2);

/// Notice the flusher emits after each committed batch.
struct Flushed {
    reader: ReadOnlyBatch,
    block_numbers: Vec<u32>,
}

struct ChainInner {
    blocks_by_hash: FastHashMap<H256, Arc<CommittedBlock>>,
    blocks_by_number: FastHashMap<u32, Vec<Arc<CommittedBlock>>>,
    /// Snapshot misses fall through to; rotated as flushes complete.
    db_reader: Arc<ReadOnlyBatch>,
    /// Highest block number whose flush has been enqueued.
    last_finalized: u32,
}

/// The blockchain manager.
///
/// Mutating calls (`start_new`, `commit`, `finalize`) are intended for a
/// single caller thread; the only other actor is the background flusher.
pub struct Blockchain {
    db: PagedDb,
    pool: Arc<PagePool>,
    inner: Mutex<ChainInner>,
    finalized_tx: Mutex<Option<Sender<Arc<CommittedBlock>>>>,
    flushed_rx: Mutex<Receiver<Flushed>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Blockchain {
    /// Creates a blockchain over the database with default options.
    pub fn new(db: PagedDb) -> Self {
        Self::with_options(db, CommitOptions::FlushDataOnly, PagePool::DEFAULT_PAGES)
    }

    /// Creates a blockchain with explicit commit durability and pool size.
    pub fn with_options(db: PagedDb, options: CommitOptions, pool_pages: usize) -> Self {
        let pool = Arc::new(PagePool::new(pool_pages));
        let (finalized_tx, finalized_rx) = channel();
        let (flushed_tx, flushed_rx) = channel();

        let flusher_db = db.clone();
        let flusher = thread::Builder::new()
            .name("paprika-flusher".into())
            .spawn(move || flusher_loop(flusher_db, finalized_rx, flushed_tx, options))
            .expect("failed to spawn flusher");

        let db_reader = Arc::new(db.begin_read_only());
        let last_finalized = db_reader.block_number();

        Self {
            db,
            pool,
            inner: Mutex::new(ChainInner {
                blocks_by_hash: FastHashMap::default(),
                blocks_by_number: FastHashMap::default(),
                db_reader,
                last_finalized,
            }),
            finalized_tx: Mutex::new(Some(finalized_tx)),
            flushed_rx: Mutex::new(flushed_rx),
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Returns the underlying database.
    pub fn db(&self) -> &PagedDb {
        &self.db
    }

    /// Returns the highest block number whose flush has been enqueued.
    pub fn last_finalized(&self) -> u32 {
        self.inner.lock().last_finalized
    }

    /// Returns the number of committed, not-yet-flushed blocks.
    pub fn committed_count(&self) -> usize {
        self.inner.lock().blocks_by_hash.len()
    }

    /// Absorbs completed flushes: rotates the database snapshot and retires
    /// the flushed blocks, letting their pool pages return.
    fn drain_flushed(&self) {
        let rx = self.flushed_rx.lock();
        while let Ok(notice) = rx.try_recv() {
            let mut inner = self.inner.lock();
            inner.db_reader = Arc::new(notice.reader);
            for number in notice.block_numbers {
                if let Some(blocks) = inner.blocks_by_number.remove(&number) {
                    for block in blocks {
                        inner.blocks_by_hash.remove(&block.hash);
                    }
                }
            }
        }
    }

    /// Starts a new block on top of `parent_hash`.
    ///
    /// The parent may be unknown (already flushed, or genesis); reads then
    /// fall through to the current database snapshot. Multiple blocks may be
    /// started from the same parent.
    pub fn start_new(&self, parent_hash: H256, block_hash: H256, block_number: u32) -> Block {
        self.drain_flushed();

        let inner = self.inner.lock();
        let mut ancestors = Vec::new();
        let mut cursor = parent_hash;
        while let Some(block) = inner.blocks_by_hash.get(&cursor) {
            ancestors.push(Arc::clone(block));
            cursor = block.parent_hash;
        }

        Block::new(
            block_number,
            block_hash,
            parent_hash,
            Arc::clone(&self.pool),
            ancestors,
            Arc::clone(&inner.db_reader),
        )
    }

    /// Commits a block, making it visible to children and to `finalize`.
    pub fn commit(&self, block: Block) -> Result<H256> {
        self.drain_flushed();

        let committed = Arc::new(block.into_committed());
        let hash = committed.hash;
        let number = committed.number;

        let mut inner = self.inner.lock();
        if inner.blocks_by_hash.contains_key(&hash) {
            return Err(BlockchainError::BlockExists(hash));
        }
        inner.blocks_by_hash.insert(hash, Arc::clone(&committed));
        inner.blocks_by_number.entry(number).or_default().push(committed);
        Ok(hash)
    }

    /// Finalizes the block and its unfinalized ancestors, enqueueing them
    /// oldest-first for the asynchronous flush.
    pub fn finalize(&self, block_hash: H256) -> Result<()> {
        self.drain_flushed();

        let to_flush = {
            let mut inner = self.inner.lock();
            let target = inner
                .blocks_by_hash
                .get(&block_hash)
                .ok_or(BlockchainError::BlockNotFound(block_hash))?;
            if target.number <= inner.last_finalized {
                return Err(BlockchainError::NotAfterFinalized {
                    number: target.number,
                    finalized: inner.last_finalized,
                });
            }

            let mut chain = vec![Arc::clone(target)];
            let mut cursor = target.parent_hash;
            while let Some(block) = inner.blocks_by_hash.get(&cursor) {
                if block.number <= inner.last_finalized {
                    break;
                }
                chain.push(Arc::clone(block));
                cursor = block.parent_hash;
            }

            inner.last_finalized = chain[0].number;
            chain.reverse();
            chain
        };

        let tx = self.finalized_tx.lock();
        let tx = tx.as_ref().ok_or(BlockchainError::Closed)?;
        for block in to_flush {
            tx.send(block).map_err(|_| BlockchainError::Closed)?;
        }
        Ok(())
    }

    /// Blocks until the database has durably absorbed `block_number`, or
    /// the timeout passes. Rotates the read snapshot along the way.
    pub fn wait_flushed(&self, block_number: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_flushed();
            if self.inner.lock().db_reader.block_number() >= block_number {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Shuts the flusher down, draining everything already finalized.
    pub fn close(&self) {
        let sender = self.finalized_tx.lock().take();
        drop(sender);
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        self.drain_flushed();
    }
}

impl Drop for Blockchain {
    fn drop(&mut self) {
        self.close();
    }
}

/// The single consumer of the finalization channel.
///
/// Each wakeup opens one write batch, fuses finalized blocks into it for at
/// most [`FLUSH_WINDOW`], commits, and reports the fresh snapshot back.
fn flusher_loop(
    db: PagedDb,
    finalized_rx: Receiver<Arc<CommittedBlock>>,
    flushed_tx: Sender<Flushed>,
    options: CommitOptions,
) {
    while let Ok(first) = finalized_rx.recv() {
        let started = Instant::now();
        let mut batch = db.begin_next();
        let mut flushed = Vec::new();
        let mut next = Some(first);
        let mut broken = false;

        while let Some(block) = next.take() {
            if block.apply(&mut batch).is_err() {
                broken = true;
                break;
            }
            flushed.push(block.number());

            if started.elapsed() < FLUSH_WINDOW {
                next = finalized_rx.try_recv().ok();
            }
        }

        if broken {
            batch.abort();
            continue;
        }
        if batch.commit(options).is_err() {
            continue;
        }

        let notice = Flushed {
            reader: db.begin_read_only(),
            block_numbers: flushed,
        };
        if flushed_tx.send(notice).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Account;
    use primitive_types::U256;

    const MB: u64 = 1024 * 1024;
    const WAIT: Duration = Duration::from_secs(5);

    fn chain() -> Blockchain {
        let db = PagedDb::open_memory(2, 16 * MB).unwrap();
        Blockchain::new(db)
    }

    #[test]
    fn test_start_and_commit() {
        let chain = chain();
        let mut block = chain.start_new(H256::zero(), H256::repeat_byte(0x01), 1);
        block
            .set_account(&H256::repeat_byte(0xAB), &Account::with_balance(U256::one()))
            .unwrap();
        chain.commit(block).unwrap();
        assert_eq!(chain.committed_count(), 1);
    }

    #[test]
    fn test_duplicate_commit_rejected() {
        let chain = chain();
        let block = chain.start_new(H256::zero(), H256::repeat_byte(0x01), 1);
        chain.commit(block).unwrap();

        let again = chain.start_new(H256::zero(), H256::repeat_byte(0x01), 1);
        assert!(matches!(
            chain.commit(again),
            Err(BlockchainError::BlockExists(_))
        ));
    }

    #[test]
    fn test_child_sees_parent_writes() {
        let chain = chain();
        let address = H256::repeat_byte(0xAA);

        let mut parent = chain.start_new(H256::zero(), H256::repeat_byte(0x01), 1);
        parent
            .set_account(&address, &Account::with_balance(U256::from(100)))
            .unwrap();
        chain.commit(parent).unwrap();

        let child = chain.start_new(H256::repeat_byte(0x01), H256::repeat_byte(0x02), 2);
        assert_eq!(
            child.get_account(&address).unwrap(),
            Some(Account::with_balance(U256::from(100)))
        );
    }

    #[test]
    fn test_child_overrides_parent() {
        let chain = chain();
        let address = H256::repeat_byte(0xAA);

        let mut parent = chain.start_new(H256::zero(), H256::repeat_byte(0x01), 1);
        parent
            .set_account(&address, &Account::with_balance(U256::from(100)))
            .unwrap();
        chain.commit(parent).unwrap();

        let mut child = chain.start_new(H256::repeat_byte(0x01), H256::repeat_byte(0x02), 2);
        child
            .set_account(&address, &Account::with_balance(U256::from(200)))
            .unwrap();
        assert_eq!(
            child.get_account(&address).unwrap(),
            Some(Account::with_balance(U256::from(200)))
        );
    }

    #[test]
    fn test_fork_isolation() {
        let chain = chain();
        let address = H256::repeat_byte(0xAA);

        let mut a = chain.start_new(H256::zero(), H256::repeat_byte(0x1A), 1);
        a.set_account(&address, &Account::with_balance_and_nonce(U256::from(1), 1))
            .unwrap();
        chain.commit(a).unwrap();

        let mut b = chain.start_new(H256::zero(), H256::repeat_byte(0x1B), 1);
        b.set_account(&address, &Account::with_balance_and_nonce(U256::from(2), 2))
            .unwrap();
        chain.commit(b).unwrap();

        let on_a = chain.start_new(H256::repeat_byte(0x1A), H256::repeat_byte(0x2A), 2);
        assert_eq!(
            on_a.get_account(&address).unwrap(),
            Some(Account::with_balance_and_nonce(U256::from(1), 1))
        );

        let on_b = chain.start_new(H256::repeat_byte(0x1B), H256::repeat_byte(0x2B), 2);
        assert_eq!(
            on_b.get_account(&address).unwrap(),
            Some(Account::with_balance_and_nonce(U256::from(2), 2))
        );
    }

    #[test]
    fn test_finalize_flushes_to_database() {
        let chain = chain();
        let address = H256::repeat_byte(0xAB);
        let hash = H256::repeat_byte(0x01);

        let mut block = chain.start_new(H256::zero(), hash, 1);
        block
            .set_account(&address, &Account::with_balance_and_nonce(U256::one(), 1))
            .unwrap();
        chain.commit(block).unwrap();

        chain.finalize(hash).unwrap();
        assert!(chain.wait_flushed(1, WAIT));

        let read = chain.db().begin_read_only();
        assert_eq!(read.metadata(), (1, hash));
        assert_eq!(
            read.get_account(&address).unwrap(),
            Some(Account::with_balance_and_nonce(U256::one(), 1))
        );
    }

    #[test]
    fn test_finalize_unknown_block() {
        let chain = chain();
        assert!(matches!(
            chain.finalize(H256::repeat_byte(0x66)),
            Err(BlockchainError::BlockNotFound(_))
        ));
    }

    #[test]
    fn test_finalize_walks_ancestors() {
        let chain = chain();
        let address = H256::repeat_byte(0xAA);

        let mut prev = H256::zero();
        for number in 1..=3u32 {
            let hash = H256::repeat_byte(number as u8);
            let mut block = chain.start_new(prev, hash, number);
            block
                .set_account(&address, &Account::with_balance(U256::from(number)))
                .unwrap();
            chain.commit(block).unwrap();
            prev = hash;
        }

        // Finalizing the tip flushes the whole chain in order.
        chain.finalize(H256::repeat_byte(3)).unwrap();
        assert_eq!(chain.last_finalized(), 3);
        assert!(chain.wait_flushed(3, WAIT));

        let read = chain.db().begin_read_only();
        assert_eq!(read.block_number(), 3);
        assert_eq!(
            read.get_account(&address).unwrap(),
            Some(Account::with_balance(U256::from(3)))
        );
    }

    #[test]
    fn test_flushed_blocks_return_pool_pages() {
        let db = PagedDb::open_memory(2, 16 * MB).unwrap();
        let chain = Blockchain::with_options(db, CommitOptions::DangerNoFlush, 64);
        let available = chain.pool.available();

        let hash = H256::repeat_byte(0x01);
        let mut block = chain.start_new(H256::zero(), hash, 1);
        block
            .set_account(&H256::repeat_byte(0xAB), &Account::with_balance(U256::one()))
            .unwrap();
        chain.commit(block).unwrap();
        assert!(chain.pool.available() < available);

        chain.finalize(hash).unwrap();
        assert!(chain.wait_flushed(1, WAIT));
        // The retire happens on the next public call after the flush notice.
        chain.drain_flushed();
        assert_eq!(chain.committed_count(), 0);
        assert_eq!(chain.pool.available(), available);
    }

    #[test]
    fn test_close_flushes_pending() {
        let chain = chain();
        let hash = H256::repeat_byte(0x01);

        let mut block = chain.start_new(H256::zero(), hash, 1);
        block
            .set_account(&H256::repeat_byte(0xCD), &Account::with_balance(U256::from(7)))
            .unwrap();
        chain.commit(block).unwrap();
        chain.finalize(hash).unwrap();
        chain.close();

        let read = chain.db().begin_read_only();
        assert_eq!(read.block_number(), 1);
    }
}
