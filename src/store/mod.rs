//! Transactional key-value storage consumed by the replication core.
//!
//! The engine is written against the small `ReadStore`/`WriteStore` traits so
//! the CRDT and clock layers do not care whether they are handed a raw store
//! or a transaction. `MemoryStore` provides the optimistic-transaction
//! semantics the push handler's retry loop depends on: commits fail with
//! `StoreError::Conflict` when another transaction touched a key this one
//! read.

mod memory;

pub use memory::{MemoryStore, Txn};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another transaction committed a conflicting write first. Retryable.
    #[error("transaction conflict: please retry")]
    Conflict,

    #[error("cannot write in a read-only transaction")]
    ReadOnly,

    #[error("transaction already committed or discarded")]
    TransactionClosed,

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Read access to the key space.
pub trait ReadStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// All live entries whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Write access. Writes are buffered until commit when implemented by a
/// transaction.
pub trait WriteStore: ReadStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}
