//! Core data structures for trie navigation and in-page storage.

mod account;
mod key;
mod nibble_path;
mod slotted_array;


pub use account::{decode_storage_value, encode_storage_value, Account, MalformedAccount};
pub use key::{encode_account, encode_storage, Key, KeyType};
pub use nibble_path::{NibbleBuf, NibblePath, MAX_NIBBLES, MAX_SERIALIZED_NIBBLES};
pub use slotted_array::{Iter as SlottedArrayIter, SlottedArray};
