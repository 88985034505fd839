//! Last-writer-wins register.
//!
//! Convergence comes from ordering merges by `(priority, value bytes)`:
//! higher priority wins outright, and equal priorities fall back to a
//! lexicographic comparison of the raw values so every replica picks the
//! same winner without any clock agreement.

use serde::{Deserialize, Serialize};

use super::{CrdtError, CrdtType, Delta};
use crate::keys::{self, DocKey, DELETED_OBJECT_MARKER};
use crate::store::{ReadStore, WriteStore};

/// A single LWW register operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegDelta {
    pub schema_version_id: String,
    /// Merge ordering key; assigned by the merkle clock when the delta is
    /// wrapped into a commit.
    pub priority: u64,
    pub data: Vec<u8>,
    pub doc_key: Vec<u8>,
}

/// LWW register bound to one (document, field) pair. Stateless — all state
/// lives in the store it is handed.
pub struct LwwRegister {
    doc_key: DocKey,
    field: String,
    schema_version_id: String,
}

impl LwwRegister {
    pub fn new(
        doc_key: DocKey,
        field: impl Into<String>,
        schema_version_id: impl Into<String>,
    ) -> Self {
        Self {
            doc_key,
            field: field.into(),
            schema_version_id: schema_version_id.into(),
        }
    }

    /// Construct a delta setting the register to `value`. Priority is left
    /// at zero for the clock to fill in.
    pub fn set(&self, value: Vec<u8>) -> LwwRegDelta {
        LwwRegDelta {
            schema_version_id: self.schema_version_id.clone(),
            priority: 0,
            data: value,
            doc_key: self.doc_key.as_str().as_bytes().to_vec(),
        }
    }

    /// Current register value, with the type-marker prefix stripped.
    pub fn value<S: ReadStore>(&self, store: &S) -> Result<Option<Vec<u8>>, CrdtError> {
        let key = keys::value_key(&self.doc_key, &self.field);
        match store.get(&key)? {
            Some(buf) if !buf.is_empty() => Ok(Some(buf[1..].to_vec())),
            Some(_) => Ok(Some(Vec::new())),
            None => Ok(None),
        }
    }

    /// Merge a delta into the stored state.
    pub fn merge<S: WriteStore>(&self, store: &S, delta: &Delta) -> Result<(), CrdtError> {
        let Delta::Lww(d) = delta else {
            return Err(CrdtError::MismatchedMergeType);
        };
        self.set_value(store, &d.data, d.priority)
    }

    fn set_value<S: WriteStore>(
        &self,
        store: &S,
        value: &[u8],
        priority: u64,
    ) -> Result<(), CrdtError> {
        let current = super::get_priority(store, &self.doc_key, &self.field)
            .map_err(CrdtError::FailedToGetPriority)?;

        // Deleted documents keep their field values under a separate key so
        // a later read can tell live state from tombstoned state.
        let marker = store.get(&keys::primary_key(&self.doc_key))?;
        let key = if marker.as_deref() == Some(&[DELETED_OBJECT_MARKER]) {
            keys::deleted_value_key(&self.doc_key, &self.field)
        } else {
            keys::value_key(&self.doc_key, &self.field)
        };

        if priority < current {
            return Ok(());
        }
        if priority == current {
            let stored = store.get(&key)?.unwrap_or_default();
            // Skip the marker byte; it is metadata, not value.
            let stored = if stored.is_empty() { &stored[..] } else { &stored[1..] };
            if stored >= value {
                return Ok(());
            }
        }

        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.push(CrdtType::LwwRegister as u8);
        buf.extend_from_slice(value);
        store
            .put(&key, buf)
            .map_err(CrdtError::FailedToStoreValue)?;

        super::set_priority(store, &self.doc_key, &self.field, priority)
            .map_err(CrdtError::FailedToStoreValue)
    }
}
