//! Composite document delta.
//!
//! Every write to a document produces one composite commit alongside the
//! field commits it aggregates. The composite DAG is what remote peers walk:
//! its links name the field commits and its `_head` parents chain document
//! versions together. Merging one only moves the document-level priority and
//! primary-key marker; the field registers do the value work.

use serde::{Deserialize, Serialize};

use super::{CrdtError, Delta};
use crate::keys::{self, DocKey, OBJECT_MARKER};
use crate::store::WriteStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeDelta {
    pub schema_version_id: String,
    pub priority: u64,
    pub doc_key: Vec<u8>,
}

/// Register for the per-document composite commit chain.
pub struct CompositeRegister {
    doc_key: DocKey,
    schema_version_id: String,
}

impl CompositeRegister {
    pub fn new(doc_key: DocKey, schema_version_id: impl Into<String>) -> Self {
        Self {
            doc_key,
            schema_version_id: schema_version_id.into(),
        }
    }

    pub fn set(&self) -> CompositeDelta {
        CompositeDelta {
            schema_version_id: self.schema_version_id.clone(),
            priority: 0,
            doc_key: self.doc_key.as_str().as_bytes().to_vec(),
        }
    }

    pub fn merge<S: WriteStore>(&self, store: &S, delta: &Delta) -> Result<(), CrdtError> {
        let Delta::Composite(d) = delta else {
            return Err(CrdtError::MismatchedMergeType);
        };

        let current = super::get_priority(store, &self.doc_key, keys::COMPOSITE_FIELD)
            .map_err(CrdtError::FailedToGetPriority)?;
        if d.priority < current {
            return Ok(());
        }
        super::set_priority(store, &self.doc_key, keys::COMPOSITE_FIELD, d.priority)
            .map_err(CrdtError::FailedToStoreValue)?;

        // First sight of this document: mark it live.
        let pk = keys::primary_key(&self.doc_key);
        if store.get(&pk)?.is_none() {
            store
                .put(&pk, vec![OBJECT_MARKER])
                .map_err(CrdtError::FailedToStoreValue)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ReadStore};

    #[test]
    fn test_merge_marks_document_live_and_tracks_priority() {
        let store = MemoryStore::new();
        let txn = store.new_txn(false);
        let doc = DocKey::from_string("doc-1");
        let reg = CompositeRegister::new(doc.clone(), "schema-v1");

        let mut delta = Delta::Composite(reg.set());
        delta.set_priority(2);
        reg.merge(&txn, &delta).unwrap();

        assert_eq!(
            txn.get(&keys::primary_key(&doc)).unwrap(),
            Some(vec![OBJECT_MARKER])
        );
        assert_eq!(
            super::super::get_priority(&txn, &doc, keys::COMPOSITE_FIELD).unwrap(),
            2
        );

        // Stale composite does not move the priority back.
        let mut stale = Delta::Composite(reg.set());
        stale.set_priority(1);
        reg.merge(&txn, &stale).unwrap();
        assert_eq!(
            super::super::get_priority(&txn, &doc, keys::COMPOSITE_FIELD).unwrap(),
            2
        );
    }
}
