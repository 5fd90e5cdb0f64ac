//! Specialized page types.
//!
//! Each page type provides specific functionality while sharing the common
//! header. Trie pages come in two shapes: fan-out (`DataPage`, 16 child
//! buckets) and leaf (`BottomPage`, a single overflow child), both carrying a
//! slotted array in the remaining space. `LeafOverflowPage` is the spill
//! target of a leaf, `AbandonedPage` records freed addresses, and `RootPage`
//! anchors a committed batch.

use crate::data::SlottedArray;

use super::{DbAddress, Page, PageHeader, PageType, PAGE_SIZE};

/// Number of child buckets in a fan-out page, one per nibble.
pub const BUCKET_COUNT: usize = 16;

// ============================================================================
// RootPage - Database metadata
// ============================================================================

/// Root page anchoring one committed batch.
///
/// The first `max_reorg_depth` pages of the file form a ring of these; the
/// slot for batch `b` is `b % max_reorg_depth`. Every root carries the full
/// table of outstanding abandoned lists, so recovery from the newest root
/// alone loses no freed pages.
///
/// Layout after header:
/// - checksum: u32 (4 bytes, CRC32C over header and fields)
/// - block_number: u32 (4 bytes)
/// - block_hash: [u8; 32] (32 bytes)
/// - trie_root: DbAddress (4 bytes)
/// - page_count: u32 (4 bytes, next fresh page index)
/// - abandoned table: 32 x (batch: u32, head: DbAddress) ring entries
pub struct RootPage {
    page: Page,
}

impl RootPage {
    const CHECKSUM_OFFSET: usize = PageHeader::SIZE;
    const BLOCK_NUMBER_OFFSET: usize = Self::CHECKSUM_OFFSET + 4;
    const BLOCK_HASH_OFFSET: usize = Self::BLOCK_NUMBER_OFFSET + 4;
    const TRIE_ROOT_OFFSET: usize = Self::BLOCK_HASH_OFFSET + 32;
    const PAGE_COUNT_OFFSET: usize = Self::TRIE_ROOT_OFFSET + DbAddress::SIZE;
    const ABANDONED_TABLE_OFFSET: usize = Self::PAGE_COUNT_OFFSET + 4;
    const FIELDS_END: usize =
        Self::ABANDONED_TABLE_OFFSET + Self::ABANDONED_SLOTS * (4 + DbAddress::SIZE);

    /// Entries in the abandoned-list table; bounds `max_reorg_depth`.
    pub const ABANDONED_SLOTS: usize = 32;

    /// Creates a new root page for the given batch.
    pub fn new(batch_id: u32) -> Self {
        Self {
            page: Page::alloc(PageHeader::new(batch_id, PageType::Root, 0)),
        }
    }

    /// Wraps an existing page as a root page.
    pub fn wrap(page: Page) -> Self {
        debug_assert_eq!(page.header().get_page_type(), Some(PageType::Root));
        Self { page }
    }

    /// Returns the underlying page.
    pub fn into_page(self) -> Page {
        self.page
    }

    /// Returns the underlying page reference.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Returns the batch id recorded in the header.
    pub fn batch_id(&self) -> u32 {
        self.page.header().batch_id
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let data = self.page.as_bytes();
        u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.page.as_bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Gets the block number.
    pub fn block_number(&self) -> u32 {
        self.read_u32(Self::BLOCK_NUMBER_OFFSET)
    }

    /// Sets the block number.
    pub fn set_block_number(&mut self, number: u32) {
        self.write_u32(Self::BLOCK_NUMBER_OFFSET, number);
    }

    /// Gets the block hash.
    pub fn block_hash(&self) -> [u8; 32] {
        let data = self.page.as_bytes();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[Self::BLOCK_HASH_OFFSET..Self::BLOCK_HASH_OFFSET + 32]);
        hash
    }

    /// Sets the block hash.
    pub fn set_block_hash(&mut self, hash: &[u8; 32]) {
        self.page.as_bytes_mut()[Self::BLOCK_HASH_OFFSET..Self::BLOCK_HASH_OFFSET + 32]
            .copy_from_slice(hash);
    }

    /// Gets the trie root address.
    pub fn trie_root(&self) -> DbAddress {
        DbAddress::read(&self.page.as_bytes()[Self::TRIE_ROOT_OFFSET..])
    }

    /// Sets the trie root address.
    pub fn set_trie_root(&mut self, addr: DbAddress) {
        addr.write(&mut self.page.as_bytes_mut()[Self::TRIE_ROOT_OFFSET..]);
    }

    /// Gets an abandoned-table entry as `(batch, list head)`.
    ///
    /// A null head means the slot is vacant.
    pub fn abandoned_entry(&self, slot: usize) -> (u32, DbAddress) {
        debug_assert!(slot < Self::ABANDONED_SLOTS);
        let offset = Self::ABANDONED_TABLE_OFFSET + slot * (4 + DbAddress::SIZE);
        (
            self.read_u32(offset),
            DbAddress::read(&self.page.as_bytes()[offset + 4..]),
        )
    }

    /// Sets an abandoned-table entry.
    pub fn set_abandoned_entry(&mut self, slot: usize, batch: u32, head: DbAddress) {
        debug_assert!(slot < Self::ABANDONED_SLOTS);
        let offset = Self::ABANDONED_TABLE_OFFSET + slot * (4 + DbAddress::SIZE);
        self.write_u32(offset, batch);
        head.write(&mut self.page.as_bytes_mut()[offset + 4..]);
    }

    /// Gets the page-count watermark (next fresh page index).
    pub fn page_count(&self) -> u32 {
        self.read_u32(Self::PAGE_COUNT_OFFSET)
    }

    /// Sets the page-count watermark.
    pub fn set_page_count(&mut self, count: u32) {
        self.write_u32(Self::PAGE_COUNT_OFFSET, count);
    }

    fn compute_checksum(&self) -> u32 {
        let data = self.page.as_bytes();
        let crc = crc32c::crc32c(&data[..PageHeader::SIZE]);
        crc32c::crc32c_append(crc, &data[Self::BLOCK_NUMBER_OFFSET..Self::FIELDS_END])
    }

    /// Stamps the checksum. Must be the last mutation before writing out.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(Self::CHECKSUM_OFFSET, checksum);
    }

    /// Returns true if the stored checksum matches the contents, which
    /// rejects torn writes during recovery.
    pub fn verify(&self) -> bool {
        self.read_u32(Self::CHECKSUM_OFFSET) == self.compute_checksum()
    }
}

// ============================================================================
// DataPage - Fan-out trie page
// ============================================================================

/// Trie page in fan-out mode: 16 child addresses indexed by nibble, plus a
/// slotted array for entries whose residual key is anchored here.
///
/// Layout after header:
/// - buckets: [DbAddress; 16] (64 bytes)
/// - map: SlottedArray (remaining space)
pub struct DataPage {
    page: Page,
}

impl DataPage {
    const BUCKETS_OFFSET: usize = PageHeader::SIZE;
    const MAP_OFFSET: usize = Self::BUCKETS_OFFSET + BUCKET_COUNT * DbAddress::SIZE;

    /// Wraps an existing page as a fan-out page.
    pub fn wrap(page: Page) -> Self {
        debug_assert_eq!(page.header().get_page_type(), Some(PageType::Data));
        Self { page }
    }

    /// Returns the underlying page.
    pub fn into_page(self) -> Page {
        self.page
    }

    /// Returns a reference to the underlying page.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Gets a child address by nibble.
    pub fn bucket(&self, nibble: usize) -> DbAddress {
        debug_assert!(nibble < BUCKET_COUNT);
        let offset = Self::BUCKETS_OFFSET + nibble * DbAddress::SIZE;
        DbAddress::read(&self.page.as_bytes()[offset..])
    }

    /// Sets a child address.
    pub fn set_bucket(&mut self, nibble: usize, addr: DbAddress) {
        debug_assert!(nibble < BUCKET_COUNT);
        let offset = Self::BUCKETS_OFFSET + nibble * DbAddress::SIZE;
        addr.write(&mut self.page.as_bytes_mut()[offset..]);
    }

    /// Returns a read-only view of the in-page map.
    pub fn map(&self) -> SlottedArray<&[u8]> {
        SlottedArray::wrap(&self.page.as_bytes()[Self::MAP_OFFSET..])
    }

    /// Returns a mutable view of the in-page map.
    pub fn map_mut(&mut self) -> SlottedArray<&mut [u8]> {
        SlottedArray::wrap(&mut self.page.as_bytes_mut()[Self::MAP_OFFSET..])
    }

    /// Zeroes the map header and all child addresses.
    pub fn reset(&mut self) {
        let header = self.page.header();
        self.page.as_bytes_mut()[PageHeader::SIZE..].fill(0);
        self.page.set_header(header);
    }
}

// ============================================================================
// BottomPage - Leaf trie page
// ============================================================================

/// Trie page in leaf mode: a single optional overflow child plus a slotted
/// array. A leaf absorbs writes locally, spills into its overflow page, and
/// converts into a fan-out page when both are full.
///
/// Layout after header:
/// - overflow: DbAddress (4 bytes)
/// - map: SlottedArray (remaining space)
pub struct BottomPage {
    page: Page,
}

impl BottomPage {
    const OVERFLOW_OFFSET: usize = PageHeader::SIZE;
    const MAP_OFFSET: usize = Self::OVERFLOW_OFFSET + DbAddress::SIZE;

    /// Wraps an existing page as a leaf page.
    pub fn wrap(page: Page) -> Self {
        debug_assert_eq!(page.header().get_page_type(), Some(PageType::Bottom));
        Self { page }
    }

    /// Returns the underlying page.
    pub fn into_page(self) -> Page {
        self.page
    }

    /// Returns a reference to the underlying page.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Gets the overflow page address.
    pub fn overflow(&self) -> DbAddress {
        DbAddress::read(&self.page.as_bytes()[Self::OVERFLOW_OFFSET..])
    }

    /// Sets the overflow page address.
    pub fn set_overflow(&mut self, addr: DbAddress) {
        addr.write(&mut self.page.as_bytes_mut()[Self::OVERFLOW_OFFSET..]);
    }

    /// Returns a read-only view of the in-page map.
    pub fn map(&self) -> SlottedArray<&[u8]> {
        SlottedArray::wrap(&self.page.as_bytes()[Self::MAP_OFFSET..])
    }

    /// Returns a mutable view of the in-page map.
    pub fn map_mut(&mut self) -> SlottedArray<&mut [u8]> {
        SlottedArray::wrap(&mut self.page.as_bytes_mut()[Self::MAP_OFFSET..])
    }
}

// ============================================================================
// LeafOverflowPage - Spill page of a leaf
// ============================================================================

/// Spill page of a leaf-mode page; the payload is a single slotted array.
pub struct LeafOverflowPage {
    page: Page,
}

impl LeafOverflowPage {
    /// Wraps an existing page as an overflow page.
    pub fn wrap(page: Page) -> Self {
        debug_assert_eq!(page.header().get_page_type(), Some(PageType::LeafOverflow));
        Self { page }
    }

    /// Returns the underlying page.
    pub fn into_page(self) -> Page {
        self.page
    }

    /// Returns a read-only view of the map.
    pub fn map(&self) -> SlottedArray<&[u8]> {
        SlottedArray::wrap(self.page.payload())
    }

    /// Returns a mutable view of the map.
    pub fn map_mut(&mut self) -> SlottedArray<&mut [u8]> {
        SlottedArray::wrap(self.page.payload_mut())
    }
}

// ============================================================================
// AbandonedPage - Tracking reusable pages
// ============================================================================

/// Page listing addresses freed by one batch.
///
/// When a page is replaced under copy-on-write, the original address lands
/// here. The listed pages become reusable only once `max_reorg_depth`
/// further batches have committed.
///
/// Layout after header:
/// - batch_abandoned: u32 (4 bytes) - batch that freed the pages
/// - next: DbAddress (4 bytes) - next page of the same batch's list
/// - count: u16 (2 bytes)
/// - addresses: [DbAddress; ...] (remaining space)
pub struct AbandonedPage {
    page: Page,
}

impl AbandonedPage {
    const BATCH_ABANDONED_OFFSET: usize = PageHeader::SIZE;
    const NEXT_OFFSET: usize = Self::BATCH_ABANDONED_OFFSET + 4;
    const COUNT_OFFSET: usize = Self::NEXT_OFFSET + DbAddress::SIZE;
    const ADDRESSES_OFFSET: usize = Self::COUNT_OFFSET + 2;

    /// Maximum addresses one page can list.
    pub const MAX_ADDRESSES: usize = (PAGE_SIZE - Self::ADDRESSES_OFFSET) / DbAddress::SIZE;

    /// Creates a new abandoned page.
    pub fn new(batch_id: u32, abandoned_at_batch: u32) -> Self {
        let page = Page::alloc(PageHeader::new(batch_id, PageType::Abandoned, 0));
        let mut list = Self { page };
        list.set_batch_abandoned(abandoned_at_batch);
        list
    }

    /// Wraps an existing page.
    pub fn wrap(page: Page) -> Self {
        debug_assert_eq!(page.header().get_page_type(), Some(PageType::Abandoned));
        Self { page }
    }

    /// Returns the underlying page.
    pub fn into_page(self) -> Page {
        self.page
    }

    /// Gets the batch that freed these pages.
    pub fn batch_abandoned(&self) -> u32 {
        let data = self.page.as_bytes();
        u32::from_le_bytes([
            data[Self::BATCH_ABANDONED_OFFSET],
            data[Self::BATCH_ABANDONED_OFFSET + 1],
            data[Self::BATCH_ABANDONED_OFFSET + 2],
            data[Self::BATCH_ABANDONED_OFFSET + 3],
        ])
    }

    fn set_batch_abandoned(&mut self, batch: u32) {
        self.page.as_bytes_mut()[Self::BATCH_ABANDONED_OFFSET..Self::BATCH_ABANDONED_OFFSET + 4]
            .copy_from_slice(&batch.to_le_bytes());
    }

    /// Gets the next page of this batch's list.
    pub fn next(&self) -> DbAddress {
        DbAddress::read(&self.page.as_bytes()[Self::NEXT_OFFSET..])
    }

    /// Sets the next page of this batch's list.
    pub fn set_next(&mut self, addr: DbAddress) {
        addr.write(&mut self.page.as_bytes_mut()[Self::NEXT_OFFSET..]);
    }

    /// Gets the number of addresses stored.
    pub fn count(&self) -> usize {
        let data = self.page.as_bytes();
        u16::from_le_bytes([data[Self::COUNT_OFFSET], data[Self::COUNT_OFFSET + 1]]) as usize
    }

    fn set_count(&mut self, count: usize) {
        self.page.as_bytes_mut()[Self::COUNT_OFFSET..Self::COUNT_OFFSET + 2]
            .copy_from_slice(&(count as u16).to_le_bytes());
    }

    /// Tries to append an address. Returns false when the page is full.
    pub fn try_add(&mut self, addr: DbAddress) -> bool {
        let count = self.count();
        if count >= Self::MAX_ADDRESSES {
            return false;
        }

        let offset = Self::ADDRESSES_OFFSET + count * DbAddress::SIZE;
        addr.write(&mut self.page.as_bytes_mut()[offset..]);
        self.set_count(count + 1);
        true
    }

    /// Gets an address at the given index.
    pub fn get(&self, index: usize) -> Option<DbAddress> {
        if index >= self.count() {
            return None;
        }
        let offset = Self::ADDRESSES_OFFSET + index * DbAddress::SIZE;
        Some(DbAddress::read(&self.page.as_bytes()[offset..]))
    }
}
