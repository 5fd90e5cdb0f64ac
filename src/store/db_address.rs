//! Page addressing.
//!
//! A page is identified by its index in the file. Index 0 always falls
//! inside the root ring, so it can never name a trie page; that frees the
//! zero value to act as the "no child" sentinel inside page payloads. An
//! address says nothing about liveness: a freed page keeps its index for
//! the whole reclaim quarantine and may later reappear holding new data.

use std::fmt;

/// Index of a page within the database file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DbAddress(u32);

impl DbAddress {
    /// The "no child" sentinel (see the module docs for why 0 is free).
    pub const NULL: DbAddress = DbAddress(0);

    /// Width of an address encoded inside a page payload.
    pub const SIZE: usize = 4;

    /// Addresses the page with the given index.
    #[inline]
    pub const fn page(index: u32) -> Self {
        DbAddress(index)
    }

    /// The raw page index.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Byte offset of this page within the file.
    #[inline]
    pub const fn file_offset(self) -> u64 {
        self.0 as u64 * super::PAGE_SIZE as u64
    }

    /// True for the sentinel.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Decodes an address from the start of `data` (little-endian).
    pub fn read(data: &[u8]) -> Self {
        let mut raw = [0u8; Self::SIZE];
        raw.copy_from_slice(&data[..Self::SIZE]);
        DbAddress(u32::from_le_bytes(raw))
    }

    /// Encodes the address at the start of `dest` (little-endian).
    pub fn write(self, dest: &mut [u8]) {
        dest[..Self::SIZE].copy_from_slice(&self.0.to_le_bytes());
    }
}

impl fmt::Debug for DbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("DbAddress(NULL)")
        } else {
            write!(f, "DbAddress({})", self.0)
        }
    }
}

impl fmt::Display for DbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            fmt::Display::fmt(&self.0, f)
        }
    }
}
