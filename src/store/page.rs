//! The 4 KiB storage unit.
//!
//! Pages travel through the engine as owned buffers: a batch copies a page
//! out of the mapping, mutates the copy, and writes it back at commit, so
//! nothing ever aliases the mapped file. The first eight bytes of every page
//! are the common header; everything after belongs to the typed wrappers in
//! `page_types`.

use super::page_header::PageHeader;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// An owned page buffer.
#[derive(Clone)]
pub struct Page(Box<[u8; PAGE_SIZE]>);

impl Page {
    /// Allocates a zeroed page already stamped with its header.
    ///
    /// Every page enters the system through here (or `from_bytes`), so a
    /// page without a valid header never exists.
    pub fn alloc(header: PageHeader) -> Self {
        let mut page = Page(Box::new([0u8; PAGE_SIZE]));
        page.set_header(header);
        page
    }

    /// Adopts a buffer copied out of the mapping.
    pub fn from_bytes(data: [u8; PAGE_SIZE]) -> Self {
        Page(Box::new(data))
    }

    /// The raw bytes, header included.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    /// The raw bytes, mutable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }

    /// Decodes the common header.
    pub fn header(&self) -> PageHeader {
        PageHeader::read(&self.0[..])
    }

    /// Overwrites the common header, leaving the payload alone.
    pub fn set_header(&mut self, header: PageHeader) {
        header.write(&mut self.0[..]);
    }

    /// The type-specific area after the header.
    pub fn payload(&self) -> &[u8] {
        &self.0[PageHeader::SIZE..]
    }

    /// The type-specific area, mutable.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.0[PageHeader::SIZE..]
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = self.header();
        // Pull the packed fields out before formatting borrows them.
        let batch_id = header.batch_id;
        let level = header.level;
        write!(
            f,
            "Page<{:?} batch={} level={}>",
            header.get_page_type(),
            batch_id,
            level,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PageType;

    #[test]
    fn test_alloc_stamps_header_and_zeroes_payload() {
        let page = Page::alloc(PageHeader::new(7, PageType::Bottom, 2));

        let header = page.header();
        let batch_id = header.batch_id;
        assert_eq!(batch_id, 7);
        assert_eq!(header.get_page_type(), Some(PageType::Bottom));
        assert!(page.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_payload_excludes_header() {
        let mut page = Page::alloc(PageHeader::new(1, PageType::Data, 0));
        page.payload_mut().fill(0xEE);

        let header = page.header();
        let batch_id = header.batch_id;
        assert_eq!(batch_id, 1);
        assert_eq!(page.payload().len(), PAGE_SIZE - PageHeader::SIZE);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut page = Page::alloc(PageHeader::new(3, PageType::LeafOverflow, 1));
        page.payload_mut()[0] = 0xAB;

        let copy = Page::from_bytes(*page.as_bytes());
        assert_eq!(copy.as_bytes(), page.as_bytes());
        assert_eq!(copy.payload()[0], 0xAB);
    }
}
