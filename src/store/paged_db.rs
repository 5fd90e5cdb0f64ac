//! PagedDb - Memory-mapped database with Copy-on-Write semantics.
//!
//! This implements a persistent storage engine using memory-mapped files,
//! inspired by LMDB and Paprika. A single writer produces batches; any number
//! of read-only snapshots may live concurrently. Pages touched by a batch are
//! replaced by fresh writable copies, and the replaced addresses only become
//! reusable once `max_reorg_depth` further batches have committed, which
//! keeps every open snapshot stable without locking.
//!
//! Commits land in a ring of root pages (one slot per `batch_id % depth`),
//! each sealed with a checksum. Recovery scans the ring and resumes from the
//! newest root that verifies.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard, RwLock};
use primitive_types::{H256, U256};
use rustc_hash::FxBuildHasher;
use thiserror::Error;

use crate::data::{
    decode_storage_value, encode_account, encode_storage, encode_storage_value, Account,
    MalformedAccount, NibblePath,
};

use super::{data_page, AbandonedPage, DbAddress, Page, RootPage, PAGE_SIZE};
use super::{PageHeader, PageType};

type FastHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("database is corrupted: {0}")]
    Corrupted(&'static str),
    #[error("page not found: {0}")]
    PageNotFound(DbAddress),
    #[error("database is full")]
    Full,
    #[error("invalid page type")]
    InvalidPageType,
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;

impl From<MalformedAccount> for DbError {
    fn from(_: MalformedAccount) -> Self {
        DbError::Corrupted("malformed account payload")
    }
}

/// Options for committing a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOptions {
    /// Flush data pages; the root slot is updated but not flushed. Atomic:
    /// a crash recovers either this batch or the previous one.
    FlushDataOnly,
    /// Flush data pages, then the root slot. Atomic and durable.
    FlushDataAndRoot,
    /// Write everything but flush nothing. Debug only.
    DangerNoFlush,
    /// Skip writing data pages altogether. Debug only, corrupts on crash.
    DangerNoWrite,
}

/// Read access to pages, implemented by both batch flavours so the trie
/// operations can run against either.
pub trait PageSource {
    fn page_at(&self, addr: DbAddress) -> Result<Page>;
}

/// The committed state a snapshot binds to.
#[derive(Clone)]
struct RootSnapshot {
    batch_id: u32,
    block_number: u32,
    block_hash: H256,
    trie_root: DbAddress,
}

/// One batch's freed pages, fully materialized in memory. The on-disk chain
/// headed at `head` carries the same addresses for recovery.
struct AbandonedList {
    batch: u32,
    head: DbAddress,
    addresses: Vec<DbAddress>,
}

/// State owned by the (single) writer.
struct WriterState {
    /// Next fresh page index.
    page_count: u32,
    /// Outstanding abandoned lists, oldest first.
    reusable: Vec<AbandonedList>,
}

struct DbInner {
    /// Memory-mapped file (wrapped in Mutex for interior mutability).
    mmap: Mutex<MmapMut>,
    /// The underlying file, if persistent.
    _file: Option<File>,
    /// Total number of pages the mapping can hold.
    max_pages: u32,
    /// How many committed batches a freed page stays quarantined.
    max_reorg_depth: u32,
    /// Snapshot of the most recently committed root.
    current: RwLock<RootSnapshot>,
    /// Writer-exclusive state; holding the lock is holding the write batch.
    writer: Mutex<WriterState>,
}

impl DbInner {
    fn read_page_checked(&self, addr: DbAddress) -> Result<Page> {
        if addr.is_null() || addr.raw() >= self.max_pages {
            return Err(DbError::PageNotFound(addr));
        }
        Ok(read_page(&self.mmap.lock(), addr))
    }
}

/// The main database handle.
///
/// Cloning is cheap and every clone refers to the same store, so the handle
/// can be shared with readers and the background flusher alike.
#[derive(Clone)]
pub struct PagedDb {
    inner: Arc<DbInner>,
}

impl PagedDb {
    /// Opens or creates a persistent database at the given path.
    ///
    /// The file is sized to `max_size_bytes` up front; `max_reorg_depth`
    /// must lie in `2..=31` and is fixed for the lifetime of the file.
    pub fn open_persistent<P: AsRef<Path>>(
        path: P,
        max_reorg_depth: u32,
        max_size_bytes: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() < max_size_bytes {
            file.set_len(max_size_bytes)?;
        }

        // Safety: the writer lock serializes all mutation of the mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Self::from_mmap(mmap, Some(file), max_reorg_depth)
    }

    /// Creates an in-memory database.
    pub fn open_memory(max_reorg_depth: u32, size_bytes: u64) -> Result<Self> {
        let mmap = MmapMut::map_anon(size_bytes as usize)?;
        Self::from_mmap(mmap, None, max_reorg_depth)
    }

    fn from_mmap(mmap: MmapMut, file: Option<File>, max_reorg_depth: u32) -> Result<Self> {
        assert!(
            (2..RootPage::ABANDONED_SLOTS as u32).contains(&max_reorg_depth),
            "max_reorg_depth out of range"
        );
        let max_pages = (mmap.len() / PAGE_SIZE) as u32;
        assert!(max_pages > max_reorg_depth, "database smaller than root ring");

        // Recovery: pick the newest root slot that verifies.
        let mut best: Option<RootPage> = None;
        let mut any_tagged = false;
        for slot in 0..max_reorg_depth {
            let page = read_page(&mmap, DbAddress::page(slot));
            if page.header().get_page_type() != Some(PageType::Root) {
                continue;
            }
            any_tagged = true;
            let root = RootPage::wrap(page);
            if !root.verify() {
                continue;
            }
            if best.as_ref().map_or(true, |b| root.batch_id() > b.batch_id()) {
                best = Some(root);
            }
        }

        let (snapshot, writer) = match best {
            Some(root) => {
                let mut reusable = Vec::new();
                for slot in 0..RootPage::ABANDONED_SLOTS {
                    let (batch, head) = root.abandoned_entry(slot);
                    if head.is_null() {
                        continue;
                    }
                    let addresses = read_abandoned_chain(&mmap, head, max_pages)?;
                    reusable.push(AbandonedList {
                        batch,
                        head,
                        addresses,
                    });
                }
                reusable.sort_by_key(|list| list.batch);

                (
                    RootSnapshot {
                        batch_id: root.batch_id(),
                        block_number: root.block_number(),
                        block_hash: H256::from(root.block_hash()),
                        trie_root: root.trie_root(),
                    },
                    WriterState {
                        page_count: root.page_count(),
                        reusable,
                    },
                )
            }
            None if any_tagged => return Err(DbError::Corrupted("no root slot verifies")),
            None => (
                RootSnapshot {
                    batch_id: 0,
                    block_number: 0,
                    block_hash: H256::zero(),
                    trie_root: DbAddress::NULL,
                },
                WriterState {
                    page_count: max_reorg_depth,
                    reusable: Vec::new(),
                },
            ),
        };

        let fresh = snapshot.batch_id == 0;
        let db = Self {
            inner: Arc::new(DbInner {
                mmap: Mutex::new(mmap),
                _file: file,
                max_pages,
                max_reorg_depth,
                current: RwLock::new(snapshot),
                writer: Mutex::new(writer),
            }),
        };

        // Make a fresh database recoverable before its first commit.
        if fresh {
            db.write_initial_root();
        }
        Ok(db)
    }

    fn write_initial_root(&self) {
        let snapshot = self.inner.current.read().clone();
        let mut root = RootPage::new(0);
        root.set_block_number(snapshot.block_number);
        root.set_block_hash(snapshot.block_hash.as_fixed_bytes());
        root.set_trie_root(snapshot.trie_root);
        root.set_page_count(self.inner.max_reorg_depth);
        root.seal();

        let mut mmap = self.inner.mmap.lock();
        mmap[0..PAGE_SIZE].copy_from_slice(root.page().as_bytes());
    }

    /// Returns the last committed batch id.
    pub fn batch_id(&self) -> u32 {
        self.inner.current.read().batch_id
    }

    /// Returns the last committed block number.
    pub fn block_number(&self) -> u32 {
        self.inner.current.read().block_number
    }

    /// Returns the last committed block hash.
    pub fn block_hash(&self) -> H256 {
        self.inner.current.read().block_hash
    }

    /// Returns the reorg-depth quarantine window.
    pub fn max_reorg_depth(&self) -> u32 {
        self.inner.max_reorg_depth
    }

    /// Begins a snapshot bound to the most recently committed root.
    ///
    /// Snapshots never block the writer and stay stable for their lifetime:
    /// the pages they reference are only ever abandoned, never mutated, and
    /// abandoned pages stay quarantined past every live snapshot.
    pub fn begin_read_only(&self) -> ReadOnlyBatch {
        ReadOnlyBatch {
            db: Arc::clone(&self.inner),
            snapshot: self.inner.current.read().clone(),
        }
    }

    /// Obtains the sole write batch, blocking while another one is alive.
    pub fn begin_next(&self) -> BatchContext<'_> {
        let inner = &*self.inner;
        let mut writer = inner.writer.lock();
        let snapshot = inner.current.read().clone();
        let batch_id = snapshot.batch_id + 1;

        // Lists freed long enough ago are out of every snapshot's and every
        // possible reorg's visibility; fold them into this batch's pool.
        let mut reclaimed = Vec::new();
        let mut index = 0;
        while index < writer.reusable.len() {
            if batch_id - writer.reusable[index].batch > inner.max_reorg_depth {
                let list = writer.reusable.remove(index);
                reclaimed.extend(list.addresses);
            } else {
                index += 1;
            }
        }

        BatchContext {
            db: inner,
            writer,
            batch_id,
            dirty: FastHashMap::default(),
            block_number: snapshot.block_number,
            block_hash: snapshot.block_hash,
            trie_root: snapshot.trie_root,
            abandoned: Vec::new(),
            reclaimed,
        }
    }
}

fn read_page(mmap: &MmapMut, addr: DbAddress) -> Page {
    let offset = addr.file_offset() as usize;
    let mut data = [0u8; PAGE_SIZE];
    data.copy_from_slice(&mmap[offset..offset + PAGE_SIZE]);
    Page::from_bytes(data)
}

/// Materializes an on-disk abandoned chain, including the chain pages
/// themselves, which become free together with the addresses they list.
fn read_abandoned_chain(
    mmap: &MmapMut,
    head: DbAddress,
    max_pages: u32,
) -> Result<Vec<DbAddress>> {
    let mut addresses = Vec::new();
    let mut chain_pages = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        if cursor.raw() >= max_pages || chain_pages.contains(&cursor) {
            return Err(DbError::Corrupted("broken abandoned chain"));
        }
        let page = read_page(mmap, cursor);
        if page.header().get_page_type() != Some(PageType::Abandoned) {
            return Err(DbError::Corrupted("abandoned chain page type"));
        }
        let list = AbandonedPage::wrap(page);
        for index in 0..list.count() {
            addresses.extend(list.get(index));
        }
        chain_pages.push(cursor);
        cursor = list.next();
    }
    addresses.extend(chain_pages);
    Ok(addresses)
}

// ============================================================================
// ReadOnlyBatch
// ============================================================================

/// A read-only snapshot of the database.
pub struct ReadOnlyBatch {
    db: Arc<DbInner>,
    snapshot: RootSnapshot,
}

impl ReadOnlyBatch {
    /// Returns the batch id this snapshot binds to.
    pub fn batch_id(&self) -> u32 {
        self.snapshot.batch_id
    }

    /// Returns the committed block number.
    pub fn block_number(&self) -> u32 {
        self.snapshot.block_number
    }

    /// Returns the committed block hash.
    pub fn block_hash(&self) -> H256 {
        self.snapshot.block_hash
    }

    /// Returns `(block_number, block_hash)`.
    pub fn metadata(&self) -> (u32, H256) {
        (self.snapshot.block_number, self.snapshot.block_hash)
    }

    /// Looks up a raw key. An empty value is returned as such; callers
    /// decide whether it means "deleted".
    pub fn try_get(&self, key: &NibblePath<'_>) -> Result<Option<Vec<u8>>> {
        data_page::try_get(self, self.snapshot.trie_root, key)
    }

    /// Gets an account by its 32-byte key.
    pub fn get_account(&self, address: &H256) -> Result<Option<Account>> {
        let key = encode_account(address);
        match self.try_get(&key.as_path())? {
            Some(raw) if !raw.is_empty() => Ok(Some(Account::decode(&raw)?)),
            _ => Ok(None),
        }
    }

    /// Gets a storage value; absent slots read as zero.
    pub fn get_storage(&self, address: &H256, slot: &H256) -> Result<U256> {
        let key = encode_storage(address, slot);
        match self.try_get(&key.as_path())? {
            Some(raw) => Ok(decode_storage_value(&raw)),
            None => Ok(U256::zero()),
        }
    }
}

impl PageSource for ReadOnlyBatch {
    fn page_at(&self, addr: DbAddress) -> Result<Page> {
        self.db.read_page_checked(addr)
    }
}

// ============================================================================
// BatchContext
// ============================================================================

/// A writable batch.
///
/// Implements Copy-on-Write: the first write to any page relocates it to a
/// fresh address stamped with this batch id, and the old address is
/// registered for reuse once the visibility window has passed.
pub struct BatchContext<'db> {
    db: &'db DbInner,
    writer: MutexGuard<'db, WriterState>,
    batch_id: u32,
    /// Pages written by this batch, keyed by their (new) address.
    dirty: FastHashMap<DbAddress, Page>,
    block_number: u32,
    block_hash: H256,
    trie_root: DbAddress,
    /// Addresses freed by this batch.
    abandoned: Vec<DbAddress>,
    /// Pages freed long ago and immediately reusable.
    reclaimed: Vec<DbAddress>,
}

impl BatchContext<'_> {
    /// Returns the batch id.
    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    /// Returns the current trie root of the batch.
    pub fn trie_root(&self) -> DbAddress {
        self.trie_root
    }

    /// Returns true if the page at `addr` was written by this batch.
    pub fn was_written(&self, addr: DbAddress) -> bool {
        self.dirty.contains_key(&addr)
    }

    /// Gets a page, preferring this batch's own writes.
    pub fn get_page(&self, addr: DbAddress) -> Result<Page> {
        if let Some(page) = self.dirty.get(&addr) {
            return Ok(page.clone());
        }
        self.db.read_page_checked(addr)
    }

    /// Stores a page under `addr`; it must already be writable here.
    pub fn mark_dirty(&mut self, addr: DbAddress, page: Page) {
        // Copy out of the packed header before asserting.
        let stamped = page.header().batch_id;
        debug_assert_eq!(stamped, self.batch_id);
        self.dirty.insert(addr, page);
    }

    fn allocate(&mut self) -> Result<DbAddress> {
        if let Some(addr) = self.reclaimed.pop() {
            return Ok(addr);
        }
        if self.writer.page_count >= self.db.max_pages {
            return Err(DbError::Full);
        }
        let addr = DbAddress::page(self.writer.page_count);
        self.writer.page_count += 1;
        Ok(addr)
    }

    /// Allocates a zeroed page stamped with this batch id.
    ///
    /// The address was either never used or was freed more than
    /// `max_reorg_depth` batches ago.
    pub fn get_new_page(&mut self, page_type: PageType, level: u8) -> Result<(DbAddress, Page)> {
        let addr = self.allocate()?;
        let page = Page::alloc(PageHeader::new(self.batch_id, page_type, level));
        self.dirty.insert(addr, page.clone());
        Ok((addr, page))
    }

    /// Makes the page at `addr` writable in this batch, relocating it on
    /// first touch and registering the old address for future reuse.
    /// Returns the (possibly new) address.
    pub fn ensure_writable(&mut self, addr: DbAddress) -> Result<DbAddress> {
        if self.dirty.contains_key(&addr) {
            return Ok(addr);
        }

        let mut page = self.db.read_page_checked(addr)?;
        let mut header = page.header();
        header.batch_id = self.batch_id;
        page.set_header(header);

        let new_addr = self.allocate()?;
        self.dirty.insert(new_addr, page);
        self.abandoned.push(addr);
        Ok(new_addr)
    }

    /// Registers a page freed by this batch for reuse after the
    /// visibility window.
    pub fn register_for_future_reuse(&mut self, addr: DbAddress) {
        self.abandoned.push(addr);
    }

    /// Sets the metadata committed with this batch.
    pub fn set_metadata(&mut self, block_number: u32, block_hash: &H256) {
        self.block_number = block_number;
        self.block_hash = *block_hash;
    }

    /// Writes a raw key-value pair through the paged trie. An empty value
    /// deletes the key.
    pub fn set_raw(&mut self, key: &NibblePath<'_>, value: &[u8]) -> Result<()> {
        let root = self.trie_root;
        self.trie_root = data_page::set(self, root, key, value)?;
        Ok(())
    }

    /// Reads a raw key, observing this batch's own writes.
    pub fn get_raw(&self, key: &NibblePath<'_>) -> Result<Option<Vec<u8>>> {
        data_page::try_get(self, self.trie_root, key)
    }

    /// Deletes every key with the given prefix.
    pub fn delete_by_prefix(&mut self, prefix: &NibblePath<'_>) -> Result<()> {
        let root = self.trie_root;
        self.trie_root = data_page::delete_by_prefix(self, root, prefix)?;
        Ok(())
    }

    /// Writes an account body.
    pub fn set_account(&mut self, address: &H256, account: &Account) -> Result<()> {
        let key = encode_account(address);
        self.set_raw(&key.as_path(), &account.encode())
    }

    /// Writes a storage cell; a zero value deletes the slot.
    pub fn set_storage(&mut self, address: &H256, slot: &H256, value: &U256) -> Result<()> {
        let key = encode_storage(address, slot);
        self.set_raw(&key.as_path(), &encode_storage_value(value))
    }

    /// Commits the batch.
    ///
    /// Data pages are written first, then the root slot for this batch is
    /// sealed and written, so a torn commit recovers as the previous batch.
    pub fn commit(mut self, options: CommitOptions) -> Result<()> {
        // Everything freed by this batch, plus reclaimed pages we popped but
        // never handed out, goes into this batch's abandoned list.
        let (head, addresses) = self.write_abandoned_chain()?;

        {
            let mut mmap = self.db.mmap.lock();
            if options != CommitOptions::DangerNoWrite {
                for (addr, page) in &self.dirty {
                    let offset = addr.file_offset() as usize;
                    mmap[offset..offset + PAGE_SIZE].copy_from_slice(page.as_bytes());
                }
            }
            if options == CommitOptions::FlushDataOnly || options == CommitOptions::FlushDataAndRoot
            {
                mmap.flush()?;
            }
        }

        // Record the new list before building the root's abandoned table.
        if !addresses.is_empty() {
            self.writer.reusable.push(AbandonedList {
                batch: self.batch_id,
                head,
                addresses,
            });
        }

        let mut root = RootPage::new(self.batch_id);
        root.set_block_number(self.block_number);
        root.set_block_hash(self.block_hash.as_fixed_bytes());
        root.set_trie_root(self.trie_root);
        root.set_page_count(self.writer.page_count);
        for list in self.writer.reusable.iter() {
            if !list.head.is_null() {
                let slot = list.batch as usize % RootPage::ABANDONED_SLOTS;
                root.set_abandoned_entry(slot, list.batch, list.head);
            }
        }
        root.seal();

        let slot = DbAddress::page(self.batch_id % self.db.max_reorg_depth);
        {
            let mut mmap = self.db.mmap.lock();
            let offset = slot.file_offset() as usize;
            mmap[offset..offset + PAGE_SIZE].copy_from_slice(root.page().as_bytes());
            if options == CommitOptions::FlushDataAndRoot {
                mmap.flush_range(offset, PAGE_SIZE)?;
            }
        }

        *self.db.current.write() = RootSnapshot {
            batch_id: self.batch_id,
            block_number: self.block_number,
            block_hash: self.block_hash,
            trie_root: self.trie_root,
        };
        Ok(())
    }

    /// Chains every address freed by this batch into abandoned pages.
    ///
    /// Returns the chain head and the full set of addresses the in-memory
    /// list must carry (freed pages plus the chain pages themselves, which
    /// become free again together).
    fn write_abandoned_chain(&mut self) -> Result<(DbAddress, Vec<DbAddress>)> {
        let mut freed = std::mem::take(&mut self.abandoned);

        // Chain pages are taken from the reclaimed pool first; those are
        // already out of every snapshot's visibility and safe to overwrite.
        // Popping one shrinks the set left to record, so re-check the need
        // until it settles.
        let max = AbandonedPage::MAX_ADDRESSES;
        let mut chain_pages: Vec<DbAddress> = Vec::new();
        loop {
            let total = freed.len() + self.reclaimed.len();
            let needed = (total + max - 1) / max;
            match chain_pages.len().cmp(&needed) {
                std::cmp::Ordering::Equal => break,
                std::cmp::Ordering::Greater => {
                    // An overshoot page goes back through the quarantine.
                    let addr = chain_pages.pop().expect("overshoot checked");
                    freed.push(addr);
                }
                std::cmp::Ordering::Less => {
                    let addr = match self.reclaimed.pop() {
                        Some(addr) => addr,
                        None => {
                            if self.writer.page_count >= self.db.max_pages {
                                return Err(DbError::Full);
                            }
                            let addr = DbAddress::page(self.writer.page_count);
                            self.writer.page_count += 1;
                            addr
                        }
                    };
                    chain_pages.push(addr);
                }
            }
        }
        freed.append(&mut self.reclaimed);

        let mut head = DbAddress::NULL;
        for (chunk, &addr) in freed.chunks(max).zip(chain_pages.iter()).rev() {
            let mut list = AbandonedPage::new(self.batch_id, self.batch_id);
            for &freed_addr in chunk {
                list.try_add(freed_addr);
            }
            list.set_next(head);
            self.dirty.insert(addr, list.into_page());
            head = addr;
        }

        freed.extend(chain_pages);
        Ok((head, freed))
    }

    /// Aborts the batch, discarding all changes.
    pub fn abort(self) {
        // Dropping the guard releases the writer; dirty pages are discarded.
    }
}

impl PageSource for BatchContext<'_> {
    fn page_at(&self, addr: DbAddress) -> Result<Page> {
        self.get_page(addr)
    }
}
