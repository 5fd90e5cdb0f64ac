#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use paprika_db::data::NibblePath;

#[derive(Arbitrary, Debug)]
struct NibblePathInput {
    bytes: Vec<u8>,
    from: usize,
    len: usize,
    slice_at: usize,
}

fuzz_target!(|input: NibblePathInput| {
    if input.bytes.is_empty() || input.bytes.len() > 48 {
        return;
    }

    let total = input.bytes.len() * 2;
    let from = input.from % total;
    let len = input.len % (total - from + 1);

    let path = NibblePath::from_bytes_at(&input.bytes, from, len);
    assert_eq!(path.len(), len);

    // Every nibble is reachable and below 16.
    for i in 0..len {
        assert!(path.get(i) <= 0x0F);
    }

    // Serialization round-trips and preserves the hash.
    let mut dst = vec![0u8; path.serialized_len() + 2];
    let written = path.write_to(&mut dst);
    assert_eq!(written, path.serialized_len());
    let (read, _) = NibblePath::read_from(&dst);
    assert_eq!(read, path);
    assert_eq!(read.hash(), path.hash());

    // Slices agree with direct indexing.
    let at = input.slice_at % (len + 1);
    let tail = path.slice_from(at);
    assert_eq!(tail.len(), len - at);
    for i in 0..tail.len() {
        assert_eq!(tail.get(i), path.get(at + i));
    }

    let head = path.slice_to(at);
    for i in 0..head.len() {
        assert_eq!(head.get(i), path.get(i));
    }

    // A slice point is where head and tail part ways.
    assert_eq!(path.first_different(&head), head.len());
});
