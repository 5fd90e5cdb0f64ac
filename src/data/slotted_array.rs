//! SlottedArray - In-page key-value storage using the slot array pattern.
//!
//! Inspired by PostgreSQL's page layout, this structure stores variable-length
//! entries in a fixed-size buffer by growing slots from the start and data
//! from the end. Keys are nibble paths; the outer nibbles of a key are packed
//! into a 16-bit per-slot hash so that lookups scan the slot array without
//! touching payloads in the common case.

use super::nibble_path::{NibbleBuf, NibblePath, MAX_NIBBLES};

/// Header size at the start of the slotted array.
const HEADER_SIZE: usize = 8;

/// Size of each slot entry.
const SLOT_SIZE: usize = 4;

/// Key length < 4; the whole key plus its length live in the slot hash.
const PREAMBLE_SHORT: u8 = 0;
/// Key length == 4; the whole key lives in the slot hash.
const PREAMBLE_FOUR: u8 = 1;
/// Key length >= 5; outer four nibbles in the hash, middle in the payload.
const PREAMBLE_LONG: u8 = 2;
/// Tombstone marker for deleted slots.
const PREAMBLE_DELETED: u8 = 7;

/// Header stored at the beginning of the array.
///
/// `low` counts slot bytes, `high` counts payload bytes; both grow toward
/// each other and `low + high` never exceeds the usable area.
#[derive(Clone, Copy)]
struct Header {
    low: u16,
    high: u16,
    deleted: u16,
}

#[derive(Clone, Copy)]
struct Slot {
    /// High 3 bits: key preamble. Low 13 bits: payload offset in the buffer.
    raw: u16,
    hash: u16,
}

impl Slot {
    fn preamble(&self) -> u8 {
        (self.raw >> 13) as u8
    }

    fn addr(&self) -> usize {
        (self.raw & 0x1FFF) as usize
    }
}

/// A slotted array over a borrowed or owned buffer.
///
/// The same type serves page payloads (`&mut [u8]`), read-only views
/// (`&[u8]`) and pool pages (boxed buffers).
pub struct SlottedArray<B> {
    buf: B,
}

fn read_header(data: &[u8]) -> Header {
    Header {
        low: u16::from_le_bytes([data[0], data[1]]),
        high: u16::from_le_bytes([data[2], data[3]]),
        deleted: u16::from_le_bytes([data[4], data[5]]),
    }
}

fn write_header(data: &mut [u8], header: Header) {
    data[0..2].copy_from_slice(&header.low.to_le_bytes());
    data[2..4].copy_from_slice(&header.high.to_le_bytes());
    data[4..6].copy_from_slice(&header.deleted.to_le_bytes());
}

fn read_slot(data: &[u8], index: usize) -> Slot {
    let at = HEADER_SIZE + index * SLOT_SIZE;
    Slot {
        raw: u16::from_le_bytes([data[at], data[at + 1]]),
        hash: u16::from_le_bytes([data[at + 2], data[at + 3]]),
    }
}

fn write_slot(data: &mut [u8], index: usize, slot: Slot) {
    let at = HEADER_SIZE + index * SLOT_SIZE;
    data[at..at + 2].copy_from_slice(&slot.raw.to_le_bytes());
    data[at + 2..at + 4].copy_from_slice(&slot.hash.to_le_bytes());
}

fn slot_count(data: &[u8]) -> usize {
    read_header(data).low as usize / SLOT_SIZE
}

/// Payload byte range of slot `index`.
///
/// Entries are laid out contiguously from the buffer end downward in slot
/// order, so the end of an entry is the start of its predecessor (or the
/// buffer end for slot 0). Deletion keeps addresses and defragmentation
/// restores the layout, which keeps this derivation valid at all times.
fn payload_span(data: &[u8], index: usize) -> (usize, usize) {
    let start = read_slot(data, index).addr();
    let end = if index == 0 {
        data.len()
    } else {
        read_slot(data, index - 1).addr()
    };
    (start, end)
}

/// Bytes the key occupies at the start of the payload of slot `index`.
fn key_overhead(data: &[u8], index: usize) -> usize {
    let slot = read_slot(data, index);
    if slot.preamble() == PREAMBLE_LONG {
        let (start, _) = payload_span(data, index);
        let mid_nibbles = data[start] as usize;
        1 + (mid_nibbles + 1) / 2
    } else {
        0
    }
}

fn value_span(data: &[u8], index: usize) -> (usize, usize) {
    let (start, end) = payload_span(data, index);
    (start + key_overhead(data, index), end)
}

/// Computes the slot hash and preamble of a key.
///
/// The first nibble of any non-empty key always occupies the top four bits
/// of the hash, which makes per-nibble filtering and fan-out statistics a
/// pure slot scan.
fn key_parts(key: &NibblePath<'_>) -> (u16, u8) {
    let len = key.len();
    match len {
        0..=3 => {
            let mut hash = len as u16;
            if len >= 1 {
                hash |= (key.get(0) as u16) << 12;
            }
            if len >= 2 {
                hash |= (key.get(1) as u16) << 8;
            }
            if len >= 3 {
                hash |= (key.get(2) as u16) << 4;
            }
            (hash, PREAMBLE_SHORT)
        }
        4 => {
            let hash = (key.get(0) as u16) << 12
                | (key.get(1) as u16) << 8
                | (key.get(2) as u16) << 4
                | key.get(3) as u16;
            (hash, PREAMBLE_FOUR)
        }
        _ => {
            let hash = (key.get(0) as u16) << 12
                | (key.get(1) as u16) << 8
                | (key.get(len - 2) as u16) << 4
                | key.get(len - 1) as u16;
            (hash, PREAMBLE_LONG)
        }
    }
}

/// Packs the middle nibbles of a long key (`[2, len - 2)`) even-aligned.
fn pack_middle(key: &NibblePath<'_>, out: &mut [u8]) -> usize {
    let mid = key.slice_from(2).slice_to(key.len() - 4);
    mid.pack_into(out)
}

/// Reconstructs the full key of a live slot.
fn key_of(data: &[u8], index: usize) -> NibbleBuf {
    let slot = read_slot(data, index);
    let hash = slot.hash;
    let mut key = NibbleBuf::new();
    match slot.preamble() {
        PREAMBLE_SHORT => {
            let len = (hash & 0xF) as usize;
            let nibbles = [(hash >> 12) as u8, (hash >> 8) as u8 & 0xF, (hash >> 4) as u8 & 0xF];
            for &n in nibbles.iter().take(len) {
                key.push(n);
            }
        }
        PREAMBLE_FOUR => {
            key.push((hash >> 12) as u8);
            key.push((hash >> 8) as u8 & 0xF);
            key.push((hash >> 4) as u8 & 0xF);
            key.push(hash as u8 & 0xF);
        }
        PREAMBLE_LONG => {
            let (start, _) = payload_span(data, index);
            let mid_nibbles = data[start] as usize;
            let mid = NibblePath::from_bytes_at(&data[start + 1..], 0, mid_nibbles);
            key.push((hash >> 12) as u8);
            key.push((hash >> 8) as u8 & 0xF);
            key.extend(&mid);
            key.push((hash >> 4) as u8 & 0xF);
            key.push(hash as u8 & 0xF);
        }
        _ => unreachable!("deleted slot has no key"),
    }
    key
}

impl<B: AsRef<[u8]>> SlottedArray<B> {
    /// Wraps an existing buffer without touching its contents.
    pub fn wrap(buf: B) -> Self {
        debug_assert!(buf.as_ref().len() >= HEADER_SIZE);
        debug_assert!(buf.as_ref().len() < 1 << 13);
        Self { buf }
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Returns the number of slots, including tombstones.
    pub fn slot_count(&self) -> usize {
        slot_count(self.data())
    }

    /// Returns the number of live entries.
    pub fn live_count(&self) -> usize {
        let header = read_header(self.data());
        header.low as usize / SLOT_SIZE - header.deleted as usize
    }

    /// Returns the number of tombstoned slots.
    pub fn deleted_count(&self) -> usize {
        read_header(self.data()).deleted as usize
    }

    /// Bytes consumed by slots and payloads together.
    pub fn taken(&self) -> usize {
        let header = read_header(self.data());
        header.low as usize + header.high as usize
    }

    /// Bytes still available for a new slot plus payload.
    pub fn free_space(&self) -> usize {
        let data = self.data();
        (data.len() - HEADER_SIZE).saturating_sub(self.taken())
    }

    fn find(&self, key: &NibblePath<'_>, hash: u16, preamble: u8) -> Option<usize> {
        let data = self.data();
        let count = slot_count(data);
        let mut mid = [0u8; MAX_NIBBLES / 2 + 1];
        let mid_bytes = if preamble == PREAMBLE_LONG {
            pack_middle(key, &mut mid)
        } else {
            0
        };
        let mid_nibbles = key.len().saturating_sub(4);

        for i in 0..count {
            let slot = read_slot(data, i);
            if slot.preamble() == PREAMBLE_DELETED {
                continue;
            }
            if slot.hash != hash || slot.preamble() != preamble {
                continue;
            }
            if preamble == PREAMBLE_LONG {
                let (start, _) = payload_span(data, i);
                if data[start] as usize != mid_nibbles {
                    continue;
                }
                if &data[start + 1..start + 1 + mid_bytes] != &mid[..mid_bytes] {
                    continue;
                }
            }
            return Some(i);
        }
        None
    }

    /// Looks up a value by key. Never allocates.
    pub fn try_get(&self, key: &NibblePath<'_>) -> Option<&[u8]> {
        let (hash, preamble) = key_parts(key);
        let index = self.find(key, hash, preamble)?;
        let (start, end) = value_span(self.data(), index);
        Some(&self.data()[start..end])
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &NibblePath<'_>) -> bool {
        let (hash, preamble) = key_parts(key);
        self.find(key, hash, preamble).is_some()
    }

    /// Iterates over all live entries in slot order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            data: self.data(),
            index: 0,
            nibble: None,
        }
    }

    /// Iterates over live entries whose first nibble equals `nibble`.
    ///
    /// The first nibble is recovered from the slot hash, so filtered slots
    /// are skipped without touching their payloads.
    pub fn iter_nibble(&self, nibble: u8) -> Iter<'_> {
        debug_assert!(nibble <= 0x0F);
        Iter {
            data: self.data(),
            index: 0,
            nibble: Some(nibble),
        }
    }

    /// Counts live entries per first nibble into `stats`.
    pub fn gather_count_stats_first_nibble(&self, stats: &mut [u16; 16]) {
        let data = self.data();
        for i in 0..slot_count(data) {
            let slot = read_slot(data, i);
            match slot.preamble() {
                PREAMBLE_DELETED => {}
                PREAMBLE_SHORT if slot.hash & 0xF == 0 => {}
                _ => stats[(slot.hash >> 12) as usize] += 1,
            }
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedArray<B> {
    /// Wraps a buffer and zeroes the header, discarding prior contents.
    pub fn init(mut buf: B) -> Self {
        buf.as_mut()[..HEADER_SIZE].fill(0);
        Self::wrap(buf)
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Zeroes the header, forgetting all entries.
    pub fn clear(&mut self) {
        self.data_mut()[..HEADER_SIZE].fill(0);
    }

    /// Tries to insert or update a key-value pair.
    ///
    /// Returns `false` only when no arrangement of the page fits the entry,
    /// even after defragmentation.
    pub fn try_set(&mut self, key: &NibblePath<'_>, value: &[u8]) -> bool {
        let (hash, preamble) = key_parts(key);

        if let Some(index) = self.find(key, hash, preamble) {
            let (start, end) = value_span(self.data(), index);
            if end - start == value.len() {
                self.data_mut()[start..end].copy_from_slice(value);
                return true;
            }
            self.tombstone(index);
        }

        let mut mid = [0u8; MAX_NIBBLES / 2 + 1];
        let (mid_bytes, mid_nibbles) = if preamble == PREAMBLE_LONG {
            (pack_middle(key, &mut mid), key.len() - 4)
        } else {
            (0, 0)
        };
        let overhead = if preamble == PREAMBLE_LONG {
            1 + mid_bytes
        } else {
            0
        };
        let total = overhead + value.len();

        if self.free_space() < total + SLOT_SIZE {
            if self.deleted_count() == 0 {
                return false;
            }
            self.defragment();
            if self.free_space() < total + SLOT_SIZE {
                return false;
            }
        }

        let data_len = self.data().len();
        let mut header = read_header(self.data());
        let addr = data_len - header.high as usize - total;
        let index = header.low as usize / SLOT_SIZE;

        let data = self.data_mut();
        if preamble == PREAMBLE_LONG {
            data[addr] = mid_nibbles as u8;
            data[addr + 1..addr + 1 + mid_bytes].copy_from_slice(&mid[..mid_bytes]);
        }
        data[addr + overhead..addr + total].copy_from_slice(value);
        write_slot(
            data,
            index,
            Slot {
                raw: ((preamble as u16) << 13) | addr as u16,
                hash,
            },
        );

        header.low += SLOT_SIZE as u16;
        header.high += total as u16;
        write_header(data, header);
        true
    }

    /// Deletes a key. Returns `false` if it was absent.
    pub fn delete(&mut self, key: &NibblePath<'_>) -> bool {
        let (hash, preamble) = key_parts(key);
        match self.find(key, hash, preamble) {
            Some(index) => {
                self.tombstone(index);
                true
            }
            None => false,
        }
    }

    /// Deletes the slot at `index`, as yielded by the iterators.
    ///
    /// Tombstoned tail slots are collected eagerly, so callers deleting
    /// several indices must process them in descending order.
    pub fn delete_at(&mut self, index: usize) {
        debug_assert!(index < self.slot_count());
        debug_assert!(read_slot(self.data(), index).preamble() != PREAMBLE_DELETED);
        self.tombstone(index);
    }

    fn tombstone(&mut self, index: usize) {
        let data = self.data_mut();
        let mut slot = read_slot(data, index);
        slot.raw = ((PREAMBLE_DELETED as u16) << 13) | (slot.raw & 0x1FFF);
        write_slot(data, index, slot);

        let mut header = read_header(data);
        header.deleted += 1;
        write_header(data, header);
        self.collect_tail();
    }

    /// Reclaims tombstoned slots at the tail by reversing `low`/`high`.
    fn collect_tail(&mut self) {
        loop {
            let data = self.data();
            let count = slot_count(data);
            if count == 0 {
                break;
            }
            let last = count - 1;
            if read_slot(data, last).preamble() != PREAMBLE_DELETED {
                break;
            }
            let (start, end) = payload_span(data, last);
            let mut header = read_header(data);
            header.low -= SLOT_SIZE as u16;
            header.high -= (end - start) as u16;
            header.deleted -= 1;
            write_header(self.data_mut(), header);
        }
    }

    /// Repacks live entries, dropping tombstones. Post-condition:
    /// `deleted_count() == 0`. Idempotent.
    pub fn defragment(&mut self) {
        let data_len = self.data().len();
        let mut scratch = vec![0u8; data_len];

        let mut low = 0u16;
        let mut high = 0usize;
        for i in 0..slot_count(self.data()) {
            let slot = read_slot(self.data(), i);
            if slot.preamble() == PREAMBLE_DELETED {
                continue;
            }
            let (start, end) = payload_span(self.data(), i);
            let total = end - start;
            high += total;
            let addr = data_len - high;
            scratch[addr..addr + total].copy_from_slice(&self.data()[start..end]);
            write_slot(
                &mut scratch,
                low as usize / SLOT_SIZE,
                Slot {
                    raw: ((slot.preamble() as u16) << 13) | addr as u16,
                    hash: slot.hash,
                },
            );
            low += SLOT_SIZE as u16;
        }

        write_header(
            &mut scratch,
            Header {
                low,
                high: high as u16,
                deleted: 0,
            },
        );
        self.data_mut().copy_from_slice(&scratch);
    }

    /// Best-effort migration of live entries into another slotted array.
    ///
    /// Entries that fit in `dst` are removed from `self`. When
    /// `treat_empty_as_tombstone` is set, an empty value deletes the key in
    /// `dst` instead of being copied. Returns true iff every entry moved.
    pub fn move_non_empty_keys_to<B2: AsRef<[u8]> + AsMut<[u8]>>(
        &mut self,
        dst: &mut SlottedArray<B2>,
        treat_empty_as_tombstone: bool,
    ) -> bool {
        let entries: Vec<(NibbleBuf, Vec<u8>)> = self
            .iter()
            .map(|(_, key, value)| (key, value.to_vec()))
            .collect();

        let mut all_moved = true;
        for (key, value) in entries {
            let key = key.as_path();
            if value.is_empty() && treat_empty_as_tombstone {
                dst.delete(&key);
                self.delete(&key);
            } else if dst.try_set(&key, &value) {
                self.delete(&key);
            } else {
                all_moved = false;
            }
        }
        all_moved
    }
}

/// Iterator over live entries of a slotted array.
pub struct Iter<'a> {
    data: &'a [u8],
    index: usize,
    nibble: Option<u8>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, NibbleBuf, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let count = slot_count(self.data);
        while self.index < count {
            let index = self.index;
            self.index += 1;

            let slot = read_slot(self.data, index);
            if slot.preamble() == PREAMBLE_DELETED {
                continue;
            }
            if let Some(nibble) = self.nibble {
                let empty = slot.preamble() == PREAMBLE_SHORT && slot.hash & 0xF == 0;
                if empty || (slot.hash >> 12) as u8 != nibble {
                    continue;
                }
            }

            let key = key_of(self.data, index);
            let (start, end) = value_span(self.data, index);
            return Some((index, key, &self.data[start..end]));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4000;

    fn array() -> SlottedArray<Vec<u8>> {
        SlottedArray::init(vec![0u8; PAGE])
    }

    #[test]
    fn test_new_array() {
        let arr = array();
        assert_eq!(arr.slot_count(), 0);
        assert_eq!(arr.live_count(), 0);
        assert!(arr.free_space() > 0);
    }

    #[test]
    fn test_insert_and_get() {
        let mut arr = array();
        let key_bytes = [0xAB, 0xCD, 0x12];
        let key = NibblePath::from_bytes(&key_bytes);
        let value = b"hello world";

        assert!(arr.try_set(&key, value));
        assert_eq!(arr.live_count(), 1);
        assert_eq!(arr.try_get(&key), Some(value.as_slice()));
    }

    #[test]
    fn test_all_key_length_classes() {
        let mut arr = array();
        let backing = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC];
        for len in 0..=12 {
            let key = NibblePath::from_bytes_at(&backing, 0, len);
            let value = vec![len as u8; len + 1];
            assert!(arr.try_set(&key, &value), "len {}", len);
        }
        for len in 0..=12 {
            let key = NibblePath::from_bytes_at(&backing, 0, len);
            let value = vec![len as u8; len + 1];
            assert_eq!(arr.try_get(&key), Some(value.as_slice()), "len {}", len);
        }
    }

    #[test]
    fn test_update_in_place() {
        let mut arr = array();
        let key = NibblePath::from_bytes(&[0xAB, 0xCD, 0xEF]);

        assert!(arr.try_set(&key, b"first"));
        assert!(arr.try_set(&key, b"fresh"));
        assert_eq!(arr.try_get(&key), Some(b"fresh".as_slice()));
        assert_eq!(arr.live_count(), 1);
        assert_eq!(arr.slot_count(), 1);
    }

    #[test]
    fn test_update_different_size() {
        let mut arr = array();
        let key = NibblePath::from_bytes(&[0xAB, 0xCD, 0xEF]);

        assert!(arr.try_set(&key, b"short"));
        assert!(arr.try_set(&key, b"considerably longer value"));
        assert_eq!(arr.try_get(&key), Some(b"considerably longer value".as_slice()));
        assert_eq!(arr.live_count(), 1);
    }

    #[test]
    fn test_delete() {
        let mut arr = array();
        let key = NibblePath::from_bytes(&[0xAB, 0xCD, 0xEF]);

        assert!(arr.try_set(&key, b"test"));
        assert!(arr.delete(&key));
        assert!(arr.try_get(&key).is_none());
        assert!(!arr.delete(&key));
    }

    #[test]
    fn test_delete_reclaims_tail() {
        let mut arr = array();
        let key = NibblePath::from_bytes(&[0xAB, 0xCD, 0xEF]);

        arr.try_set(&key, b"test");
        arr.delete(&key);
        assert_eq!(arr.slot_count(), 0);
        assert_eq!(arr.taken(), 0);
    }

    #[test]
    fn test_empty_value_roundtrip() {
        let mut arr = array();
        let key = NibblePath::from_bytes(&[0xAB]);
        assert!(arr.try_set(&key, &[]));
        assert_eq!(arr.try_get(&key), Some([].as_slice()));
    }

    #[test]
    fn test_defragment() {
        let mut arr = array();
        let keys: Vec<[u8; 3]> = (0..10u8).map(|i| [i, i + 1, i + 2]).collect();

        for key in &keys {
            assert!(arr.try_set(&NibblePath::from_bytes(key), key));
        }
        for key in keys.iter().step_by(2) {
            assert!(arr.delete(&NibblePath::from_bytes(key)));
        }

        let taken_before = arr.taken();
        arr.defragment();
        assert_eq!(arr.deleted_count(), 0);
        assert!(arr.taken() < taken_before);

        // Idempotent.
        arr.defragment();
        assert_eq!(arr.deleted_count(), 0);

        for key in keys.iter().skip(1).step_by(2) {
            assert_eq!(
                arr.try_get(&NibblePath::from_bytes(key)),
                Some(key.as_slice())
            );
        }
        for key in keys.iter().step_by(2) {
            assert!(arr.try_get(&NibblePath::from_bytes(key)).is_none());
        }
    }

    #[test]
    fn test_fill_until_full_then_defragment() {
        let mut arr = array();
        let mut inserted = Vec::new();
        for i in 0u16..1000 {
            let key_bytes = [(i >> 8) as u8, i as u8, 0x42];
            let key = NibblePath::from_bytes(&key_bytes);
            if !arr.try_set(&key, &[0xEE; 16]) {
                break;
            }
            inserted.push(key_bytes);
        }
        assert!(inserted.len() > 10);
        assert!(arr.taken() + HEADER_SIZE <= PAGE);

        // Delete half, then the freed space must be usable again.
        for key in inserted.iter().step_by(2) {
            assert!(arr.delete(&NibblePath::from_bytes(key)));
        }
        let key = NibblePath::from_bytes(&[0xFF, 0xFF, 0xFF]);
        assert!(arr.try_set(&key, &[0xEE; 16]));
    }

    #[test]
    fn test_iter() {
        let mut arr = array();
        for i in 0..5u8 {
            let key = [i << 4 | 0x1, 0x23];
            arr.try_set(&NibblePath::from_bytes(&key), &[i]);
        }
        arr.delete(&NibblePath::from_bytes(&[0x21, 0x23]));

        let collected: Vec<(Vec<u8>, Vec<u8>)> = arr
            .iter()
            .map(|(_, k, v)| (k.as_path().iter().collect(), v.to_vec()))
            .collect();
        assert_eq!(collected.len(), 4);
        assert_eq!(collected[0].0, vec![0x0, 0x1, 0x2, 0x3]);
        assert_eq!(collected[0].1, vec![0]);
    }

    #[test]
    fn test_iter_nibble() {
        let mut arr = array();
        arr.try_set(&NibblePath::from_bytes(&[0x12, 0x34]), b"a");
        arr.try_set(&NibblePath::from_bytes(&[0x15, 0x67]), b"b");
        arr.try_set(&NibblePath::from_bytes(&[0x29, 0xAB]), b"c");

        let ones: Vec<Vec<u8>> = arr.iter_nibble(1).map(|(_, _, v)| v.to_vec()).collect();
        assert_eq!(ones, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(arr.iter_nibble(3).count(), 0);
    }

    #[test]
    fn test_gather_stats() {
        let mut arr = array();
        arr.try_set(&NibblePath::from_bytes(&[0x12, 0x34]), b"a");
        arr.try_set(&NibblePath::from_bytes(&[0x15, 0x67]), b"b");
        arr.try_set(&NibblePath::from_bytes(&[0x29, 0xAB]), b"c");
        arr.try_set(&NibblePath::EMPTY, b"root");

        let mut stats = [0u16; 16];
        arr.gather_count_stats_first_nibble(&mut stats);
        assert_eq!(stats[1], 2);
        assert_eq!(stats[2], 1);
        assert_eq!(stats.iter().sum::<u16>(), 3);
    }

    #[test]
    fn test_move_non_empty_keys() {
        let mut src = array();
        let mut dst = array();

        let keep = NibblePath::from_bytes(&[0x12, 0x34]);
        let gone = NibblePath::from_bytes(&[0x56, 0x78]);
        src.try_set(&keep, b"value");
        src.try_set(&gone, b"");
        dst.try_set(&gone, b"stale");

        assert!(src.move_non_empty_keys_to(&mut dst, true));
        assert_eq!(src.live_count(), 0);
        assert_eq!(dst.try_get(&keep), Some(b"value".as_slice()));
        assert!(dst.try_get(&gone).is_none());
    }

    #[test]
    fn test_long_keys_shared_outer_nibbles() {
        // Same outer four nibbles, different middles: the hash collides and
        // the stored middle must disambiguate.
        let mut arr = array();
        let a = [0x12, 0xAA, 0xAA, 0x34];
        let b = [0x12, 0xBB, 0xBB, 0x34];
        arr.try_set(&NibblePath::from_bytes(&a), b"first");
        arr.try_set(&NibblePath::from_bytes(&b), b"second");

        assert_eq!(arr.try_get(&NibblePath::from_bytes(&a)), Some(b"first".as_slice()));
        assert_eq!(arr.try_get(&NibblePath::from_bytes(&b)), Some(b"second".as_slice()));
    }

    #[test]
    fn test_capacity_conservation() {
        let mut arr = array();
        let mut i = 0u16;
        loop {
            let key_bytes = [(i >> 8) as u8, i as u8];
            if !arr.try_set(&NibblePath::from_bytes(&key_bytes), &[0xAB; 24]) {
                break;
            }
            if i % 3 == 0 {
                arr.delete(&NibblePath::from_bytes(&key_bytes));
            }
            assert!(arr.taken() <= PAGE - HEADER_SIZE);
            assert_eq!(
                arr.live_count(),
                arr.slot_count() - arr.deleted_count()
            );
            i += 1;
        }
    }
}
