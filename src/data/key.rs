//! Keys addressing the account / storage / merkle key space.
//!
//! A key is a triple of account path, key type and storage path. It is
//! flattened into a single nibble path with a leading type-tag nibble, so the
//! engine below this layer only ever sees nibble paths.

use primitive_types::H256;

use super::nibble_path::{NibbleBuf, NibblePath};

/// Tag nibble for account bodies.
const TAG_ACCOUNT: u8 = 0x0;
/// Tag nibble for storage cells.
const TAG_STORAGE: u8 = 0x1;
/// Tag nibble for merkle nodes of the state trie.
const TAG_MERKLE: u8 = 0x2;
/// Tag nibble for merkle nodes under a storage trie.
const TAG_MERKLE_STORAGE: u8 = 0x3;

/// What a key addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    /// An account body.
    Account,
    /// A storage cell of an account.
    StorageCell,
    /// A merkle node; the paths may be prefixes of arbitrary length.
    Merkle,
}

/// A key into the world state.
///
/// `storage_path` is non-empty only for storage cells and for merkle nodes
/// under a storage trie.
#[derive(Clone, Copy, Debug)]
pub struct Key<'a> {
    pub path: NibblePath<'a>,
    pub kind: KeyType,
    pub storage_path: NibblePath<'a>,
}

impl<'a> Key<'a> {
    /// A key addressing an account body.
    pub fn account(path: NibblePath<'a>) -> Self {
        Self {
            path,
            kind: KeyType::Account,
            storage_path: NibblePath::EMPTY,
        }
    }

    /// A key addressing a storage cell.
    pub fn storage_cell(path: NibblePath<'a>, storage_path: NibblePath<'a>) -> Self {
        Self {
            path,
            kind: KeyType::StorageCell,
            storage_path,
        }
    }

    /// A key addressing a merkle node at a state-trie prefix. The root
    /// node has an empty path.
    pub fn merkle(path: NibblePath<'a>) -> Self {
        Self {
            path,
            kind: KeyType::Merkle,
            storage_path: NibblePath::EMPTY,
        }
    }

    /// A key addressing a merkle node at a storage-trie prefix.
    pub fn merkle_storage(path: NibblePath<'a>, storage_path: NibblePath<'a>) -> Self {
        Self {
            path,
            kind: KeyType::Merkle,
            storage_path,
        }
    }

    /// Flattens the key into a single tag-prefixed nibble path.
    ///
    /// The tag makes every encoded key self-describing no matter how deep
    /// the trie truncates it, so account bodies, storage cells and merkle
    /// nodes of equal depth can never alias.
    pub fn encode(&self) -> NibbleBuf {
        let tag = match self.kind {
            KeyType::Account => TAG_ACCOUNT,
            KeyType::StorageCell => TAG_STORAGE,
            KeyType::Merkle if self.storage_path.is_empty() => TAG_MERKLE,
            KeyType::Merkle => TAG_MERKLE_STORAGE,
        };
        let mut buf = NibbleBuf::new();
        buf.push(tag);
        buf.extend(&self.path);
        buf.extend(&self.storage_path);
        buf
    }
}

/// Encodes the key of an account body addressed by a 32-byte key.
pub fn encode_account(address: &H256) -> NibbleBuf {
    Key::account(NibblePath::from_bytes(address.as_bytes())).encode()
}

/// Encodes the key of a storage cell.
pub fn encode_storage(address: &H256, slot: &H256) -> NibbleBuf {
    Key::storage_cell(
        NibblePath::from_bytes(address.as_bytes()),
        NibblePath::from_bytes(slot.as_bytes()),
    )
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_key() {
        let address = H256::repeat_byte(0xAB);
        let key = encode_account(&address);
        assert_eq!(key.len(), 65);
        assert_eq!(key.as_path().get(0), TAG_ACCOUNT);
        assert_eq!(key.as_path().get(1), 0xA);
    }

    #[test]
    fn test_storage_key() {
        let address = H256::repeat_byte(0xAB);
        let slot = H256::repeat_byte(0xCD);
        let key = encode_storage(&address, &slot);
        assert_eq!(key.len(), 129);
        assert_eq!(key.as_path().get(0), TAG_STORAGE);
        assert_eq!(key.as_path().get(65), 0xC);
    }

    #[test]
    fn test_merkle_root_key() {
        let key = Key::merkle(NibblePath::EMPTY).encode();
        assert_eq!(key.len(), 1);
        assert_eq!(key.as_path().get(0), TAG_MERKLE);
    }

    #[test]
    fn test_kinds_never_alias() {
        let address = H256::repeat_byte(0x11);
        let account = encode_account(&address);
        let merkle = Key::merkle(NibblePath::from_bytes(address.as_bytes())).encode();
        assert_eq!(account.len(), merkle.len());
        assert_ne!(account.as_path(), merkle.as_path());
    }
}
