//! In-memory store with optimistic transactions.
//!
//! Concurrency control is first-committer-wins: each transaction records the
//! keys (and prefixes) it read; at commit time any of those having been
//! rewritten since the transaction's snapshot sequence fails the commit with
//! `Conflict`. Within a transaction, reads see the transaction's own buffered
//! writes overlaid on the latest committed state.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use super::{ReadStore, StoreError, WriteStore};

#[derive(Default)]
struct Committed {
    data: BTreeMap<String, Vec<u8>>,
    /// Sequence number of the last commit that wrote each key (including
    /// deletions, so tombstones conflict too).
    versions: BTreeMap<String, u64>,
    seq: u64,
}

/// Shared, thread-safe in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Committed>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. `read_only` transactions reject writes.
    pub fn new_txn(&self, read_only: bool) -> Txn {
        let snapshot_seq = self.inner.lock().unwrap().seq;
        Txn {
            store: Arc::clone(&self.inner),
            read_only,
            state: Mutex::new(TxnState {
                snapshot_seq,
                writes: BTreeMap::new(),
                reads: HashSet::new(),
                prefix_reads: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Open a transaction intended to be shared across tasks. Identical
    /// conflict semantics; the distinction exists so call sites read like
    /// what they do.
    pub fn new_concurrent_txn(&self, read_only: bool) -> Txn {
        self.new_txn(read_only)
    }

    /// Direct read of committed state, outside any transaction.
    pub fn get_committed(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().data.get(key).cloned()
    }

    /// Direct single-key write, committed immediately.
    pub fn put_committed(&self, key: &str, value: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        inner.data.insert(key.to_string(), value);
        inner.versions.insert(key.to_string(), seq);
    }
}

struct TxnState {
    snapshot_seq: u64,
    /// Buffered writes; `None` is a pending deletion.
    writes: BTreeMap<String, Option<Vec<u8>>>,
    reads: HashSet<String>,
    prefix_reads: Vec<String>,
    closed: bool,
}

/// A transaction over a `MemoryStore`. Safe to share behind an `Arc` —
/// all methods take `&self`.
pub struct Txn {
    store: Arc<Mutex<Committed>>,
    read_only: bool,
    state: Mutex<TxnState>,
}

impl Txn {
    /// Validate the read set and apply buffered writes atomically.
    pub fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(StoreError::TransactionClosed);
        }
        state.closed = true;

        if state.writes.is_empty() {
            return Ok(());
        }

        let mut committed = self.store.lock().unwrap();
        for key in &state.reads {
            if let Some(&v) = committed.versions.get(key) {
                if v > state.snapshot_seq {
                    return Err(StoreError::Conflict);
                }
            }
        }
        for prefix in &state.prefix_reads {
            let range = committed
                .versions
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded));
            for (key, &v) in range {
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                if v > state.snapshot_seq {
                    return Err(StoreError::Conflict);
                }
            }
        }

        committed.seq += 1;
        let seq = committed.seq;
        for (key, value) in std::mem::take(&mut state.writes) {
            match value {
                Some(v) => {
                    committed.data.insert(key.clone(), v);
                }
                None => {
                    committed.data.remove(&key);
                }
            }
            committed.versions.insert(key, seq);
        }
        Ok(())
    }

    /// Drop all buffered writes. Safe to call on an already-closed
    /// transaction.
    pub fn discard(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

impl ReadStore for Txn {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(StoreError::TransactionClosed);
        }
        if let Some(pending) = state.writes.get(key) {
            return Ok(pending.clone());
        }
        state.reads.insert(key.to_string());
        Ok(self.store.lock().unwrap().data.get(key).cloned())
    }

    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(StoreError::TransactionClosed);
        }
        state.prefix_reads.push(prefix.to_string());

        let committed = self.store.lock().unwrap();
        let mut merged: BTreeMap<String, Option<Vec<u8>>> = committed
            .data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        drop(committed);

        let overlay = state
            .writes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix));
        for (k, v) in overlay {
            merged.insert(k.clone(), v.clone());
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }
}

impl WriteStore for Txn {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(StoreError::TransactionClosed);
        }
        state.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(StoreError::TransactionClosed);
        }
        state.writes.insert(key.to_string(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();

        let txn = store.new_txn(false);
        txn.put("/a", b"1".to_vec()).unwrap();
        assert_eq!(store.get_committed("/a"), None);
        txn.commit().unwrap();

        assert_eq!(store.get_committed("/a"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_discard_drops_writes() {
        let store = MemoryStore::new();
        let txn = store.new_txn(false);
        txn.put("/a", b"1".to_vec()).unwrap();
        txn.discard();
        assert_eq!(store.get_committed("/a"), None);
    }

    #[test]
    fn test_read_write_conflict() {
        let store = MemoryStore::new();
        store.put_committed("/counter", b"0".to_vec());

        let t1 = store.new_txn(false);
        let t2 = store.new_txn(false);

        // Both read the counter, both try to bump it.
        t1.get("/counter").unwrap();
        t2.get("/counter").unwrap();
        t1.put("/counter", b"1".to_vec()).unwrap();
        t2.put("/counter", b"1".to_vec()).unwrap();

        t1.commit().unwrap();
        assert!(matches!(t2.commit(), Err(StoreError::Conflict)));
    }

    #[test]
    fn test_blind_writes_do_not_conflict() {
        let store = MemoryStore::new();
        let t1 = store.new_txn(false);
        let t2 = store.new_txn(false);
        t1.put("/blocks/x", b"x".to_vec()).unwrap();
        t2.put("/blocks/x", b"x".to_vec()).unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();
    }

    #[test]
    fn test_prefix_read_conflicts_with_new_entry() {
        let store = MemoryStore::new();

        let t1 = store.new_txn(false);
        let t2 = store.new_txn(false);

        assert!(t1.iter_prefix("/heads/").unwrap().is_empty());
        t1.put("/data/x", b"1".to_vec()).unwrap();

        t2.put("/heads/a", b"1".to_vec()).unwrap();
        t2.commit().unwrap();

        assert!(matches!(t1.commit(), Err(StoreError::Conflict)));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        let txn = store.new_txn(true);
        assert!(matches!(
            txn.put("/a", vec![]),
            Err(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn test_iter_prefix_sees_own_writes() {
        let store = MemoryStore::new();
        store.put_committed("/index/s/doc1", vec![]);

        let txn = store.new_txn(false);
        txn.put("/index/s/doc2", vec![]).unwrap();
        txn.delete("/index/s/doc1").unwrap();

        let keys: Vec<String> = txn
            .iter_prefix("/index/s/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/index/s/doc2".to_string()]);
    }
}
