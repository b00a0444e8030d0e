//! End-to-end tests across the storage and concurrency core.

use anyhow::Result;
use larchdb::access::btree::key::{decode_i64, encode_i64, BytewiseComparator};
use larchdb::access::{BTree, Rid};
use larchdb::catalog::TableOid;
use larchdb::concurrency::{LockManager, LockMode, RowLockMode};
use larchdb::storage::buffer::lru_k::LruKReplacer;
use larchdb::storage::{BufferPoolManager, PageId, PageManager};
use larchdb::transaction::{IsolationLevel, TransactionManager, TransactionState};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn open_pool(path: &Path, pool_size: usize) -> Result<BufferPoolManager> {
    let page_manager = if path.exists() {
        PageManager::open(path)?
    } else {
        PageManager::create(path)?
    };
    let replacer = Box::new(LruKReplacer::new(pool_size, 2));
    Ok(BufferPoolManager::new(page_manager, replacer, pool_size))
}

fn rid(n: i64) -> Rid {
    Rid::new(PageId(500), n as u16)
}

#[test]
fn test_index_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("orders.db");

    {
        let pool = open_pool(&path, 16)?;
        let tree = BTree::new("orders_pk", pool.clone(), Arc::new(BytewiseComparator), 4, 4)?;
        for n in 0..100 {
            assert!(tree.insert(&encode_i64(n), rid(n))?);
        }
        pool.flush_all()?;
    }

    {
        let pool = open_pool(&path, 16)?;
        let tree = BTree::new("orders_pk", pool, Arc::new(BytewiseComparator), 4, 4)?;
        assert!(!tree.is_empty());
        for n in 0..100 {
            assert_eq!(tree.get_value(&encode_i64(n))?, Some(rid(n)));
        }
        let keys: Vec<i64> = tree
            .iter()?
            .map(|entry| Ok(decode_i64(&entry?.0)))
            .collect::<Result<_>>()?;
        assert_eq!(keys, (0..100).collect::<Vec<_>>());
    }
    Ok(())
}

#[test]
fn test_two_indexes_share_one_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("shared.db");
    let pool = open_pool(&path, 32)?;

    let orders = BTree::new("orders_pk", pool.clone(), Arc::new(BytewiseComparator), 4, 4)?;
    let users = BTree::new("users_pk", pool.clone(), Arc::new(BytewiseComparator), 4, 4)?;

    for n in 0..50 {
        orders.insert(&encode_i64(n), rid(n))?;
        users.insert(&encode_i64(1000 + n), rid(n))?;
    }

    for n in 0..50 {
        assert_eq!(orders.get_value(&encode_i64(n))?, Some(rid(n)));
        assert_eq!(orders.get_value(&encode_i64(1000 + n))?, None);
        assert_eq!(users.get_value(&encode_i64(1000 + n))?, Some(rid(n)));
    }
    Ok(())
}

#[test]
fn test_concurrent_index_registration() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(&dir.path().join("register.db"), 16)?;
    // Materialize the header page before racing registrations against it.
    let _bootstrap = BTree::new("bootstrap", pool.clone(), Arc::new(BytewiseComparator), 4, 4)?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(std::thread::spawn(move || {
            BTree::new("shared_idx", pool, Arc::new(BytewiseComparator), 4, 4)
                .map(|tree| tree.root_page_id())
        }));
    }
    for handle in handles {
        // Every open succeeds; exactly one registered, the rest observed it.
        assert_eq!(handle.join().unwrap()?, None);
    }
    Ok(())
}

#[test]
fn test_flush_then_fetch_yields_identical_bytes() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(&dir.path().join("bytes.db"), 4)?;

    let (page_id, mut guard) = pool.new_page()?;
    for (i, byte) in guard.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let before: Vec<u8> = guard.to_vec();
    drop(guard);

    assert!(pool.flush_page(page_id)?);
    let after = pool.fetch_page(page_id)?;
    assert_eq!(&before[..], &after[..]);
    Ok(())
}

#[test]
fn test_tree_under_memory_pressure() -> Result<()> {
    // A pool with few frames forces constant eviction underneath the tree
    // while it splits and merges.
    let dir = tempdir()?;
    let pool = open_pool(&dir.path().join("pressure.db"), 16)?;
    let tree = BTree::new("tiny_pool", pool, Arc::new(BytewiseComparator), 4, 4)?;

    for n in 0..300 {
        assert!(tree.insert(&encode_i64(n), rid(n))?);
    }
    for n in (0..300).step_by(2) {
        tree.remove(&encode_i64(n))?;
    }

    let keys: Vec<i64> = tree
        .iter()?
        .map(|entry| Ok(decode_i64(&entry?.0)))
        .collect::<Result<_>>()?;
    assert_eq!(keys, (1..300).step_by(2).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_transactional_access_pattern() -> Result<()> {
    // The executor-facing flow: intent lock on the table, row locks for the
    // touched records, index lookups in between, then commit releases all.
    let dir = tempdir()?;
    let pool = open_pool(&dir.path().join("txn.db"), 16)?;
    let tree = Arc::new(BTree::new(
        "accounts_pk",
        pool,
        Arc::new(BytewiseComparator),
        8,
        8,
    )?);
    for n in 0..20 {
        tree.insert(&encode_i64(n), rid(n))?;
    }

    let lock_manager = Arc::new(LockManager::new());
    let manager = Arc::new(TransactionManager::new(Arc::clone(&lock_manager)));
    let table = TableOid(1);

    let writer = manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&writer, LockMode::IntentionExclusive, table)?;
    let target = tree.get_value(&encode_i64(7))?.expect("key 7 present");
    lock_manager.lock_row(&writer, RowLockMode::Exclusive, table, target)?;
    tree.remove(&encode_i64(7))?;

    let reader = manager.begin(IsolationLevel::ReadCommitted);
    lock_manager.lock_table(&reader, LockMode::IntentionShared, table)?;
    let other = tree.get_value(&encode_i64(3))?.expect("key 3 present");
    lock_manager.lock_row(&reader, RowLockMode::Shared, table, other)?;

    manager.commit(&writer)?;
    manager.commit(&reader)?;
    assert_eq!(writer.state(), TransactionState::Committed);
    assert_eq!(tree.get_value(&encode_i64(7))?, None);
    assert!(!writer.holds_row_locks_on(table));
    assert!(!reader.holds_row_locks_on(table));
    Ok(())
}

#[test]
fn test_concurrent_tree_workload() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(&dir.path().join("mixed.db"), 32)?;
    let tree = Arc::new(BTree::new(
        "events_pk",
        pool.clone(),
        Arc::new(BytewiseComparator),
        8,
        8,
    )?);

    let mut handles = Vec::new();
    for t in 0..4i64 {
        let tree = Arc::clone(&tree);
        handles.push(std::thread::spawn(move || -> Result<()> {
            for n in (t * 100)..((t + 1) * 100) {
                assert!(tree.insert(&encode_i64(n), rid(n % 100))?);
            }
            for n in (t * 100..(t + 1) * 100).step_by(3) {
                tree.remove(&encode_i64(n))?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    let expected: Vec<i64> = (0..400).filter(|n| n % 100 % 3 != 0).collect();
    let keys: Vec<i64> = tree
        .iter()?
        .map(|entry| Ok(decode_i64(&entry?.0)))
        .collect::<Result<_>>()?;
    assert_eq!(keys, expected);

    pool.flush_all()?;
    Ok(())
}
