//! Commit blocks — the nodes of the per-field Merkle-DAG.
//!
//! A commit block carries one CBOR-encoded delta plus named links to other
//! blocks: `_head` links point at the parent commits this one supersedes,
//! field-name links (on composite blocks) point at the field commits the
//! document commit aggregates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Cid;

/// Link name used for parent (prior head) references.
pub const HEAD_LINK: &str = "_head";

#[derive(Error, Debug)]
pub enum DagError {
    #[error("failed to encode block: {0}")]
    Encode(String),

    #[error("failed to decode block: {0}")]
    Decode(String),

    #[error("block does not match its cid (expected {expected}, computed {actual})")]
    CidMismatch { expected: Cid, actual: Cid },
}

/// A named reference from one block to another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLink {
    pub name: String,
    pub cid: Cid,
}

/// A single Merkle-DAG node: delta payload plus outbound links.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBlock {
    /// CBOR-encoded delta (see `crdt::Delta`).
    pub delta: Vec<u8>,
    pub links: Vec<BlockLink>,
}

impl CommitBlock {
    pub fn new(delta: Vec<u8>) -> Self {
        Self {
            delta,
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, name: impl Into<String>, cid: Cid) -> Self {
        self.links.push(BlockLink {
            name: name.into(),
            cid,
        });
        self
    }

    /// Encode to the canonical byte form that the cid is computed over.
    pub fn encode(&self) -> Result<Vec<u8>, DagError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| DagError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DagError> {
        ciborium::from_reader(data).map_err(|e| DagError::Decode(e.to_string()))
    }

    /// Decode and verify the payload hashes to the cid it was advertised under.
    pub fn decode_verified(data: &[u8], expected: Cid) -> Result<Self, DagError> {
        let actual = Cid::from_content(data);
        if actual != expected {
            return Err(DagError::CidMismatch { expected, actual });
        }
        Self::decode(data)
    }

    pub fn cid(&self) -> Result<Cid, DagError> {
        Ok(Cid::from_content(&self.encode()?))
    }

    /// Parent commits — the `_head` links this block supersedes.
    pub fn parents(&self) -> impl Iterator<Item = Cid> + '_ {
        self.links
            .iter()
            .filter(|l| l.name == HEAD_LINK)
            .map(|l| l.cid)
    }
}
