//! Delta CRDTs interpreted by the replication engine.
//!
//! Two delta kinds flow through the commit DAG: `Lww` for individual field
//! registers and `Composite` for the per-document head commit that ties field
//! commits together. Stored values are prefixed with a one-byte type marker
//! so a reader can tell what wrote them.

pub mod composite;
pub mod lwwreg;

pub use composite::{CompositeDelta, CompositeRegister};
pub use lwwreg::{LwwRegDelta, LwwRegister};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::{self, DocKey};
use crate::store::{ReadStore, StoreError, WriteStore};

/// One-byte marker identifying which CRDT wrote a stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CrdtType {
    LwwRegister = 1,
    Composite = 2,
}

#[derive(Error, Debug)]
pub enum CrdtError {
    #[error("merge with mismatched delta type")]
    MismatchedMergeType,

    #[error("failed to get priority")]
    FailedToGetPriority(#[source] StoreError),

    #[error("failed to store value")]
    FailedToStoreValue(#[source] StoreError),

    #[error("failed to encode delta: {0}")]
    Encode(String),

    #[error("failed to decode delta: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A single CRDT operation carried by one commit block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    Lww(LwwRegDelta),
    Composite(CompositeDelta),
}

impl Delta {
    pub fn priority(&self) -> u64 {
        match self {
            Delta::Lww(d) => d.priority,
            Delta::Composite(d) => d.priority,
        }
    }

    pub fn set_priority(&mut self, priority: u64) {
        match self {
            Delta::Lww(d) => d.priority = priority,
            Delta::Composite(d) => d.priority = priority,
        }
    }

    pub fn doc_key(&self) -> &[u8] {
        match self {
            Delta::Lww(d) => &d.doc_key,
            Delta::Composite(d) => &d.doc_key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CrdtError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode a delta from the raw payload of a commit block.
    pub fn decode(data: &[u8]) -> Result<Self, CrdtError> {
        ciborium::from_reader(data).map_err(|e| CrdtError::Decode(e.to_string()))
    }
}

pub(crate) fn encode_priority(priority: u64) -> Vec<u8> {
    priority.to_be_bytes().to_vec()
}

pub(crate) fn decode_priority(key: &str, raw: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("priority must be 8 bytes, got {}", raw.len()),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Read the stored merge priority for a (doc, field) pair. Zero when unset.
pub(crate) fn get_priority<S: ReadStore>(
    store: &S,
    doc: &DocKey,
    field: &str,
) -> Result<u64, StoreError> {
    let key = keys::priority_key(doc, field);
    match store.get(&key)? {
        Some(raw) => decode_priority(&key, &raw),
        None => Ok(0),
    }
}

pub(crate) fn set_priority<S: WriteStore>(
    store: &S,
    doc: &DocKey,
    field: &str,
    priority: u64,
) -> Result<(), StoreError> {
    store.put(&keys::priority_key(doc, field), encode_priority(priority))
}
