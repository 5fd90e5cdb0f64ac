//! Block abstraction for managing in-memory state changes.
//!
//! A block accumulates writes in slotted arrays laid over pool pages. Reads
//! walk the block itself, then its captured ancestor chain, then the database
//! snapshot taken when the block was started.

use std::sync::Arc;

use primitive_types::{H256, U256};

use crate::data::{
    decode_storage_value, encode_account, encode_storage, encode_storage_value, Account,
    NibblePath, SlottedArray, MAX_NIBBLES,
};
use crate::store::{BatchContext, ReadOnlyBatch};

use super::blockchain::{BlockchainError, Result};
use super::bloom::BloomFilter;
use super::page_pool::{PagePool, PoolPage};

/// Canonical byte form of a key for bloom insertion: length prefix plus the
/// even-aligned packed nibbles, so prefix keys never alias.
fn bloom_bytes(key: &NibblePath<'_>, out: &mut [u8; MAX_NIBBLES / 2 + 2]) -> usize {
    out[0] = key.len() as u8;
    1 + key.pack_into(&mut out[1..])
}

/// A block under construction.
///
/// Writes observe the block's own previous writes immediately; reads fall
/// back through the ancestors captured at `start_new` and finally to the
/// database snapshot of that moment.
pub struct Block {
    number: u32,
    hash: H256,
    parent_hash: H256,
    bloom: BloomFilter,
    /// Slotted-array buffers, oldest first; writes go to the last one.
    maps: Vec<PoolPage>,
    pool: Arc<PagePool>,
    /// Committed ancestors, nearest first. Holding the `Arc`s leases their
    /// pool pages for the lifetime of this block.
    ancestors: Vec<Arc<CommittedBlock>>,
    /// Database snapshot taken when the block was started.
    db_reader: Arc<ReadOnlyBatch>,
}

impl Block {
    pub(crate) fn new(
        number: u32,
        hash: H256,
        parent_hash: H256,
        pool: Arc<PagePool>,
        ancestors: Vec<Arc<CommittedBlock>>,
        db_reader: Arc<ReadOnlyBatch>,
    ) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            bloom: BloomFilter::new(),
            maps: Vec::new(),
            pool,
            ancestors,
            db_reader,
        }
    }

    /// Returns the block number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns the block hash.
    pub fn hash(&self) -> H256 {
        self.hash
    }

    /// Returns the parent block hash.
    pub fn parent_hash(&self) -> H256 {
        self.parent_hash
    }

    /// Writes a raw key-value pair into this block. An empty value records
    /// a deletion that shadows ancestor and database state.
    pub fn set_raw(&mut self, key: &NibblePath<'_>, value: &[u8]) -> Result<()> {
        let mut scratch = [0u8; MAX_NIBBLES / 2 + 2];
        let len = bloom_bytes(key, &mut scratch);
        self.bloom.insert(&scratch[..len]);

        if let Some(page) = self.maps.last_mut() {
            let mut map = SlottedArray::wrap(&mut page[..]);
            if map.try_set(key, value) {
                return Ok(());
            }
        }

        let mut page = self
            .pool
            .rent()
            .ok_or(BlockchainError::PoolExhausted)?;
        let mut map = SlottedArray::init(&mut page[..]);
        if !map.try_set(key, value) {
            self.pool.give_back(page);
            return Err(BlockchainError::ValueTooLarge);
        }
        self.maps.push(page);
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

    /// Looks up a raw key through this block, its ancestors, and the
    /// database snapshot. An empty value is a tombstone surfaced as such.
    pub fn try_get(&self, key: &NibblePath<'_>) -> Result<Option<Vec<u8>>> {
        for page in self.maps.iter().rev() {
            let map = SlottedArray::wrap(&page[..]);
            if let Some(value) = map.try_get(key) {
                return Ok(Some(value.to_vec()));
            }
        }

        let mut scratch = [0u8; MAX_NIBBLES / 2 + 2];
        let len = bloom_bytes(key, &mut scratch);
        for ancestor in &self.ancestors {
            if let Some(value) = ancestor.try_get_local(key, &scratch[..len]) {
                return Ok(Some(value));
            }
        }

        Ok(self.db_reader.try_get(key)?)
    }

    /// Gets an account as visible from this block.
    pub fn get_account(&self, address: &H256) -> Result<Option<Account>> {
        let key = encode_account(address);
        match self.try_get(&key.as_path())? {
            Some(raw) if !raw.is_empty() => Ok(Some(Account::decode(&raw)?)),
            _ => Ok(None),
        }
    }

    /// Gets a storage value as visible from this block; absent reads zero.
    pub fn get_storage(&self, address: &H256, slot: &H256) -> Result<U256> {
        let key = encode_storage(address, slot);
        match self.try_get(&key.as_path())? {
            Some(raw) => Ok(decode_storage_value(&raw)),
            None => Ok(U256::zero()),
        }
    }

    /// Freezes the block for the blockchain indices, dropping the ancestor
    /// leases and the database snapshot.
    pub(crate) fn into_committed(self) -> CommittedBlock {
        CommittedBlock {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            bloom: self.bloom,
            maps: self.maps,
            pool: self.pool,
        }
    }
}

/// A committed, immutable block.
///
/// Shared through `Arc`: every clone is a read lease, and the pool pages go
/// back to the pool when the last lease drops.
pub struct CommittedBlock {
    pub(crate) number: u32,
    pub(crate) hash: H256,
    pub(crate) parent_hash: H256,
    bloom: BloomFilter,
    maps: Vec<PoolPage>,
    pool: Arc<PagePool>,
}

impl CommittedBlock {
    /// Returns the block number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Returns the block hash.
    pub fn hash(&self) -> H256 {
        self.hash
    }

    /// Looks up a key in this block only, bloom-gated.
    pub(crate) fn try_get_local(&self, key: &NibblePath<'_>, bloom_key: &[u8]) -> Option<Vec<u8>> {
        if !self.bloom.may_contain(bloom_key) {
            return None;
        }
        for page in self.maps.iter().rev() {
            let map = SlottedArray::wrap(&page[..]);
            if let Some(value) = map.try_get(key) {
                return Some(value.to_vec());
            }
        }
        None
    }

    /// Applies every write of this block to a database batch and stamps the
    /// batch metadata. Maps are replayed oldest first so newer writes win.
    pub(crate) fn apply(&self, batch: &mut BatchContext<'_>) -> crate::store::Result<()> {
        for page in &self.maps {
            let map = SlottedArray::wrap(&page[..]);
            for (_, key, value) in map.iter() {
                batch.set_raw(&key.as_path(), value)?;
            }
        }
        batch.set_metadata(self.number, &self.hash);
        Ok(())
    }
}

impl Drop for CommittedBlock {
    fn drop(&mut self) {
        for page in self.maps.drain(..) {
            self.pool.give_back(page);
        }
    }
}
