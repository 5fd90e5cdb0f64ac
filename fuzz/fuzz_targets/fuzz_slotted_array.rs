#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use paprika_db::data::{NibblePath, SlottedArray};

#[derive(Arbitrary, Debug)]
struct SlottedArrayInput {
    operations: Vec<SlottedOp>,
}

#[derive(Arbitrary, Debug)]
enum SlottedOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
    IterateAll,
    Defragment,
}

fuzz_target!(|input: SlottedArrayInput| {
    if input.operations.len() > 200 {
        return;
    }

    let mut arr = SlottedArray::init(vec![0u8; 4000]);
    let mut expected: std::collections::HashMap<Vec<u8>, Vec<u8>> =
        std::collections::HashMap::new();

    for op in input.operations {
        match op {
            SlottedOp::Set { key, value } => {
                if key.len() > 60 || value.len() > 500 {
                    continue;
                }
                let path = NibblePath::from_bytes(&key);
                if arr.try_set(&path, &value) {
                    expected.insert(key, value);
                } else {
                    // A failed update has already removed the old entry.
                    expected.remove(&key);
                }
            }
            SlottedOp::Get { key } => {
                if key.len() > 60 {
                    continue;
                }
                let path = NibblePath::from_bytes(&key);
                let got = arr.try_get(&path);
                assert_eq!(got, expected.get(&key).map(|v| v.as_slice()));
            }
            SlottedOp::Delete { key } => {
                if key.len() > 60 {
                    continue;
                }
                let path = NibblePath::from_bytes(&key);
                let deleted = arr.delete(&path);
                assert_eq!(deleted, expected.remove(&key).is_some());
            }
            SlottedOp::IterateAll => {
                let live = arr.iter().count();
                assert_eq!(live, expected.len());
            }
            SlottedOp::Defragment => {
                arr.defragment();
                assert_eq!(arr.deleted_count(), 0);
            }
        }

        assert_eq!(arr.live_count(), expected.len());
        assert_eq!(arr.live_count(), arr.slot_count() - arr.deleted_count());
    }

    // Every surviving entry must still read back.
    for (key, value) in &expected {
        let path = NibblePath::from_bytes(key);
        assert_eq!(arr.try_get(&path), Some(value.as_slice()));
    }
});
