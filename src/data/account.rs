//! Account representation for Ethereum world state.
//!
//! Accounts are stored as compact, self-describing payloads. A leading flags
//! byte records which optional fields follow and how many bytes the balance
//! needs, so the common externally-owned account costs ten bytes instead of
//! a fixed-width record.

use primitive_types::{H256, U256};
use thiserror::Error;

/// A stored account body failed to decode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("malformed account payload")]
pub struct MalformedAccount;

/// An Ethereum account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    /// Account nonce.
    pub nonce: u64,
    /// Account balance.
    pub balance: U256,
    /// Hash of the contract code; zero for code-less accounts.
    pub code_hash: H256,
    /// Root of the storage trie, computed by the external merkle layer;
    /// zero while storage is empty or not yet hashed.
    pub storage_root: H256,
}

impl Account {
    /// An account with the given balance and a zero nonce.
    pub fn with_balance(balance: U256) -> Self {
        Self::with_balance_and_nonce(balance, 0)
    }

    /// An account with the given balance and nonce.
    pub fn with_balance_and_nonce(balance: U256, nonce: u64) -> Self {
        Self {
            nonce,
            balance,
            ..Default::default()
        }
    }

    /// True when every field still has its default value.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Encodes the account.
    ///
    /// Payload layout:
    /// - flags: u8 — `balance_len << 2 | has_storage_root << 1 | has_code`
    /// - nonce: u64 LE
    /// - balance: `balance_len` big-endian bytes, leading zeros stripped
    /// - code_hash: 32 bytes, present iff `has_code`
    /// - storage_root: 32 bytes, present iff `has_storage_root`
    pub fn encode(&self) -> Vec<u8> {
        let balance = encode_storage_value(&self.balance);
        let has_code = self.code_hash != H256::zero();
        let has_storage = self.storage_root != H256::zero();

        let flags =
            (balance.len() as u8) << 2 | u8::from(has_storage) << 1 | u8::from(has_code);
        let mut out = Vec::with_capacity(9 + balance.len() + 64);
        out.push(flags);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&balance);
        if has_code {
            out.extend_from_slice(self.code_hash.as_bytes());
        }
        if has_storage {
            out.extend_from_slice(self.storage_root.as_bytes());
        }
        out
    }

    /// Decodes an account payload written by `encode`.
    ///
    /// The payload is length-checked against its own flags, so truncated or
    /// padded data is rejected rather than misread.
    pub fn decode(data: &[u8]) -> Result<Self, MalformedAccount> {
        let (&flags, rest) = data.split_first().ok_or(MalformedAccount)?;
        let balance_len = (flags >> 2) as usize;
        let has_storage = flags & 0b10 != 0;
        let has_code = flags & 0b01 != 0;
        if balance_len > 32 {
            return Err(MalformedAccount);
        }

        let hashes = usize::from(has_code) + usize::from(has_storage);
        if rest.len() != 8 + balance_len + 32 * hashes {
            return Err(MalformedAccount);
        }

        let (nonce, rest) = rest.split_at(8);
        let nonce = u64::from_le_bytes(nonce.try_into().expect("split at 8"));
        let (balance, mut rest) = rest.split_at(balance_len);
        let balance = decode_storage_value(balance);

        let mut code_hash = H256::zero();
        if has_code {
            code_hash = H256::from_slice(&rest[..32]);
            rest = &rest[32..];
        }
        let mut storage_root = H256::zero();
        if has_storage {
            storage_root = H256::from_slice(&rest[..32]);
        }

        Ok(Self {
            nonce,
            balance,
            code_hash,
            storage_root,
        })
    }
}

/// Encodes a storage value as its minimal big-endian bytes.
pub fn encode_storage_value(value: &U256) -> Vec<u8> {
    if value.is_zero() {
        return Vec::new();
    }
    let bytes = value.to_big_endian();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes a storage value written by `encode_storage_value`.
pub fn decode_storage_value(data: &[u8]) -> U256 {
    if data.is_empty() {
        U256::zero()
    } else {
        U256::from_big_endian(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_fields() {
        let account = Account {
            nonce: 42,
            balance: U256::from(1000),
            code_hash: H256::repeat_byte(0xAB),
            storage_root: H256::repeat_byte(0xCD),
        };

        let encoded = account.encode();
        assert_eq!(encoded.len(), 1 + 8 + 2 + 32 + 32);
        assert_eq!(Account::decode(&encoded), Ok(account));
    }

    #[test]
    fn test_plain_account_stays_compact() {
        let account = Account::with_balance_and_nonce(U256::one(), 1);
        let encoded = account.encode();
        // flags + nonce + one balance byte, no hashes.
        assert_eq!(encoded.len(), 10);
        assert_eq!(Account::decode(&encoded), Ok(account));
    }

    #[test]
    fn test_default_account_roundtrip() {
        let encoded = Account::default().encode();
        assert_eq!(encoded.len(), 9);
        assert_eq!(Account::decode(&encoded), Ok(Account::default()));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(Account::decode(&[]), Err(MalformedAccount));

        let mut encoded = Account::with_balance(U256::from(7)).encode();
        // Truncated payloads no longer match their flags.
        encoded.pop();
        assert_eq!(Account::decode(&encoded), Err(MalformedAccount));

        // A balance length the flags cannot mean.
        let mut bad = vec![33 << 2];
        bad.extend_from_slice(&[0u8; 8 + 33]);
        assert_eq!(Account::decode(&bad), Err(MalformedAccount));
    }

    #[test]
    fn test_empty_account() {
        assert!(Account::default().is_empty());
        assert!(!Account::with_balance(U256::from(1)).is_empty());
    }

    #[test]
    fn test_storage_value_roundtrip() {
        for value in [U256::zero(), U256::one(), U256::from(0xDEADBEEFu64), U256::MAX] {
            let encoded = encode_storage_value(&value);
            assert_eq!(decode_storage_value(&encoded), value);
        }
        assert!(encode_storage_value(&U256::zero()).is_empty());
    }
}
