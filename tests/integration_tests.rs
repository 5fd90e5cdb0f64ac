//! End-to-end scenarios for paprika_db.

use std::time::Duration;

use primitive_types::{H256, U256};

use paprika_db::chain::Blockchain;
use paprika_db::data::Account;
use paprika_db::store::{CommitOptions, PagedDb};

const MB: u64 = 1024 * 1024;
const WAIT: Duration = Duration::from_secs(30);

fn account_key(i: u64) -> H256 {
    let mut raw = [0u8; 32];
    raw[..8].copy_from_slice(&i.to_be_bytes());
    raw[31] = (i % 251) as u8;
    H256::from(raw)
}

#[test]
fn single_account() {
    let db = PagedDb::open_memory(2, 16 * MB).unwrap();
    let chain = Blockchain::new(db.clone());

    let h1 = H256::repeat_byte(0x01);
    let k0 = H256::repeat_byte(0xA0);
    let account = Account::with_balance_and_nonce(U256::one(), 1);

    let mut block = chain.start_new(H256::zero(), h1, 1);
    block.set_account(&k0, &account).unwrap();
    chain.commit(block).unwrap();

    // Committed but not finalized: visible from a child block.
    let probe = chain.start_new(h1, H256::repeat_byte(0x02), 2);
    assert_eq!(probe.get_account(&k0).unwrap(), Some(account.clone()));

    chain.finalize(h1).unwrap();
    assert!(chain.wait_flushed(1, WAIT));

    let read = db.begin_read_only();
    assert_eq!(read.metadata(), (1, h1));
    assert_eq!(read.get_account(&k0).unwrap(), Some(account));
}

#[test]
fn fork_blocks_stay_isolated() {
    let db = PagedDb::open_memory(2, 16 * MB).unwrap();
    let chain = Blockchain::new(db);

    let k0 = H256::repeat_byte(0xA0);
    let h1a = H256::repeat_byte(0x1A);
    let h1b = H256::repeat_byte(0x1B);

    let mut block_1a = chain.start_new(H256::zero(), h1a, 1);
    block_1a
        .set_account(&k0, &Account::with_balance_and_nonce(U256::from(1), 1))
        .unwrap();
    chain.commit(block_1a).unwrap();

    let mut block_1b = chain.start_new(H256::zero(), h1b, 1);
    block_1b
        .set_account(&k0, &Account::with_balance_and_nonce(U256::from(2), 2))
        .unwrap();
    chain.commit(block_1b).unwrap();

    let block_2a = chain.start_new(h1a, H256::repeat_byte(0x2A), 2);
    assert_eq!(
        block_2a.get_account(&k0).unwrap(),
        Some(Account::with_balance_and_nonce(U256::from(1), 1))
    );
}

#[test]
fn storage_roundtrip() {
    let db = PagedDb::open_memory(2, 16 * MB).unwrap();
    let chain = Blockchain::new(db.clone());

    let k0 = H256::repeat_byte(0xA0);
    let s0 = H256::repeat_byte(0x50);
    let h1 = H256::repeat_byte(0x01);
    let value = U256::from(0xDEADBEEFu64);

    let mut block = chain.start_new(H256::zero(), h1, 1);
    block.set_account(&k0, &Account::with_balance(U256::one())).unwrap();
    block.set_storage(&k0, &s0, &value).unwrap();
    chain.commit(block).unwrap();
    chain.finalize(h1).unwrap();
    assert!(chain.wait_flushed(1, WAIT));

    let read = db.begin_read_only();
    assert_eq!(read.get_storage(&k0, &s0).unwrap(), value);
    assert_eq!(
        read.get_storage(&k0, &H256::repeat_byte(0x51)).unwrap(),
        U256::zero()
    );
}

#[test]
fn large_batch_stress() {
    const ACCOUNTS_PER_BLOCK: u64 = 50;
    const BLOCKS: u32 = 64;
    const FINALIZE_EVERY: u32 = 16;

    let db = PagedDb::open_memory(8, 128 * MB).unwrap();
    let chain = Blockchain::new(db.clone());

    let mut parent = H256::zero();
    for number in 1..=BLOCKS {
        let hash = H256::from_low_u64_be(number as u64);
        let mut block = chain.start_new(parent, hash, number);

        for i in 0..ACCOUNTS_PER_BLOCK {
            let id = (number as u64 - 1) * ACCOUNTS_PER_BLOCK + i;
            let address = account_key(id);
            let account = Account::with_balance_and_nonce(U256::from(id + 1), id);
            block.set_account(&address, &account).unwrap();
            block
                .set_storage(&address, &H256::from_low_u64_be(id), &U256::from(id * 2 + 1))
                .unwrap();
        }

        chain.commit(block).unwrap();
        if number % FINALIZE_EVERY == 0 {
            chain.finalize(hash).unwrap();
        }
        parent = hash;
    }
    if BLOCKS % FINALIZE_EVERY != 0 {
        chain.finalize(H256::from_low_u64_be(BLOCKS as u64)).unwrap();
    }
    chain.close();

    let read = db.begin_read_only();
    assert_eq!(read.block_number(), BLOCKS);
    for id in 0..(BLOCKS as u64 * ACCOUNTS_PER_BLOCK) {
        let address = account_key(id);
        let account = read
            .get_account(&address)
            .unwrap()
            .unwrap_or_else(|| panic!("missing account {id}"));
        assert_eq!(account.balance, U256::from(id + 1), "account {id}");
        assert_eq!(account.nonce, id, "account {id}");
        assert_eq!(
            read.get_storage(&address, &H256::from_low_u64_be(id)).unwrap(),
            U256::from(id * 2 + 1),
            "storage {id}"
        );
    }
}

#[test]
fn durable_commit_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paprika.db");

    const BLOCKS: u32 = 5;
    let mut written = Vec::new();
    {
        let db = PagedDb::open_persistent(&path, 2, 64 * MB).unwrap();
        let chain = Blockchain::with_options(db, CommitOptions::FlushDataAndRoot, 1024);

        let mut parent = H256::zero();
        for number in 1..=BLOCKS {
            let hash = H256::from_low_u64_be(number as u64);
            let mut block = chain.start_new(parent, hash, number);
            for i in 0..20u64 {
                let id = (number as u64 - 1) * 20 + i;
                let address = account_key(id);
                let account = Account::with_balance(U256::from(id + 100));
                block.set_account(&address, &account).unwrap();
                written.push((address, account));
            }
            chain.commit(block).unwrap();
            parent = hash;
        }
        chain.finalize(parent).unwrap();
        chain.close();
    }

    // Simulated crash: nothing of the process survives but the file.
    let db = PagedDb::open_persistent(&path, 2, 64 * MB).unwrap();
    let read = db.begin_read_only();
    assert_eq!(read.block_number(), BLOCKS);
    assert_eq!(read.block_hash(), H256::from_low_u64_be(BLOCKS as u64));
    for (address, account) in &written {
        assert_eq!(
            read.get_account(address).unwrap().as_ref(),
            Some(account),
            "account {address:?}"
        );
    }
}

#[test]
fn finalization_monotonic_metadata() {
    let db = PagedDb::open_memory(4, 32 * MB).unwrap();
    let chain = Blockchain::new(db.clone());

    let mut parent = H256::zero();
    let mut observed = 0u32;
    for number in 1..=12u32 {
        let hash = H256::from_low_u64_be(number as u64);
        let mut block = chain.start_new(parent, hash, number);
        block
            .set_account(&account_key(number as u64), &Account::with_balance(U256::from(number)))
            .unwrap();
        chain.commit(block).unwrap();

        if number % 3 == 0 {
            chain.finalize(hash).unwrap();
            assert!(chain.wait_flushed(number, WAIT));
        }

        let now = db.begin_read_only().block_number();
        assert!(now >= observed, "metadata went backwards: {observed} -> {now}");
        observed = now;
        parent = hash;
    }
    assert_eq!(observed, 12);
}
