//! Datastore key layout.
//!
//! Every piece of persisted state lives in one flat key space:
//!
//! ```text
//! /data/{doc}/{field}/v      field value (marker-prefixed)
//! /data/{doc}/{field}/dv     field value, deleted-document variant
//! /data/{doc}/{field}/p      field priority (8-byte big-endian)
//! /data/{doc}/pk             primary-key marker (object / deleted sentinel)
//! /heads/{doc}/{field}/{cid} head entry, value = priority
//! /stale/{doc}/{field}/{cid} superseded-commit marker
//! /blocks/{cid}              raw commit block bytes
//! /index/{schema}/{doc}      doc-key index per collection
//! /system/collections/{name} collection descriptor
//! /system/replicators/{peer} replicator record
//! /system/p2p/{schema}       subscribed-collection set membership
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dag::Cid;

/// Stable string identifier of a collection's schema.
pub type SchemaId = String;

/// Field id of the per-document composite commit DAG.
pub const COMPOSITE_FIELD: &str = "_head";

/// Marker byte for a live document's primary key.
pub const OBJECT_MARKER: u8 = 0x01;
/// Marker byte recording that a document has been deleted.
pub const DELETED_OBJECT_MARKER: u8 = 0x02;

/// Stable string identifier of a document, derived from the content hash of
/// its creation state.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocKey(String);

impl DocKey {
    /// Derive a doc key from a collection schema and the document's initial
    /// field values. Identical content yields an identical key.
    pub fn generate(schema_id: &str, fields: &[(String, Vec<u8>)]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(schema_id.as_bytes());
        let mut sorted: Vec<_> = fields.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in sorted {
            hasher.update(name.as_bytes());
            hasher.update(value);
        }
        DocKey(hex::encode(hasher.finalize()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        DocKey(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocKey({}..)", &self.0[..self.0.len().min(16)])
    }
}

pub fn value_key(doc: &DocKey, field: &str) -> String {
    format!("/data/{doc}/{field}/v")
}

pub fn deleted_value_key(doc: &DocKey, field: &str) -> String {
    format!("/data/{doc}/{field}/dv")
}

pub fn priority_key(doc: &DocKey, field: &str) -> String {
    format!("/data/{doc}/{field}/p")
}

pub fn primary_key(doc: &DocKey) -> String {
    format!("/data/{doc}/pk")
}

pub fn head_key(doc: &DocKey, field: &str, cid: &Cid) -> String {
    format!("/heads/{doc}/{field}/{cid}")
}

pub fn head_prefix(doc: &DocKey, field: &str) -> String {
    format!("/heads/{doc}/{field}/")
}

/// Marks a commit as superseded by some later commit, so an out-of-order
/// DAG walk never re-adds an ancestor to the head set.
pub fn stale_head_key(doc: &DocKey, field: &str, cid: &Cid) -> String {
    format!("/stale/{doc}/{field}/{cid}")
}

pub fn block_key(cid: &Cid) -> String {
    format!("/blocks/{cid}")
}

pub fn doc_index_key(schema_id: &str, doc: &DocKey) -> String {
    format!("/index/{schema_id}/{doc}")
}

pub fn doc_index_prefix(schema_id: &str) -> String {
    format!("/index/{schema_id}/")
}

pub fn collection_key(name: &str) -> String {
    format!("/system/collections/{name}")
}

pub const COLLECTION_PREFIX: &str = "/system/collections/";

pub fn replicator_key(peer: &str) -> String {
    format!("/system/replicators/{peer}")
}

pub const REPLICATOR_PREFIX: &str = "/system/replicators/";

pub fn p2p_collection_key(schema_id: &str) -> String {
    format!("/system/p2p/{schema_id}")
}

pub const P2P_COLLECTION_PREFIX: &str = "/system/p2p/";
