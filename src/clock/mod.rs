//! Merkle clock.
//!
//! A DAG-shaped logical clock: every commit's priority is one greater than
//! the highest priority among the heads it supersedes, and the head table
//! tracks the set of tip cids per (document, field). No wall clocks anywhere.

use thiserror::Error;

use crate::crdt::{self, CrdtError, Delta};
use crate::dag::{BlockLink, CommitBlock, Cid, DagError, HEAD_LINK};
use crate::keys::{self, DocKey};
use crate::store::{ReadStore, StoreError, WriteStore};

#[derive(Error, Debug)]
pub enum ClockError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Delta(#[from] CrdtError),

    #[error("corrupt head entry at {key}: {reason}")]
    CorruptHead { key: String, reason: String },
}

/// Clock over one (document, field) commit chain.
pub struct MerkleClock {
    doc_key: DocKey,
    field: String,
}

impl MerkleClock {
    pub fn new(doc_key: DocKey, field: impl Into<String>) -> Self {
        Self {
            doc_key,
            field: field.into(),
        }
    }

    /// Current head set: tip cids with their priorities.
    pub fn heads<S: ReadStore>(&self, store: &S) -> Result<Vec<(Cid, u64)>, ClockError> {
        let prefix = keys::head_prefix(&self.doc_key, &self.field);
        let mut heads = Vec::new();
        for (key, value) in store.iter_prefix(&prefix)? {
            let cid: Cid = key[prefix.len()..]
                .parse()
                .map_err(|e: hex::FromHexError| ClockError::CorruptHead {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            let priority = crdt::decode_priority(&key, &value)?;
            heads.push((cid, priority));
        }
        Ok(heads)
    }

    /// Highest priority among current heads; zero for an empty chain.
    pub fn head_priority<S: ReadStore>(&self, store: &S) -> Result<u64, ClockError> {
        Ok(self
            .heads(store)?
            .iter()
            .map(|(_, p)| *p)
            .max()
            .unwrap_or(0))
    }

    /// Wrap a locally-produced delta into a commit block: assign it the next
    /// priority, link it to the current heads (plus any extra named links),
    /// store the block, and advance the head set to the new commit.
    pub fn add_delta<S: WriteStore>(
        &self,
        store: &S,
        delta: &mut Delta,
        extra_links: Vec<BlockLink>,
    ) -> Result<(Cid, CommitBlock), ClockError> {
        let heads = self.heads(store)?;
        let priority = heads.iter().map(|(_, p)| *p).max().unwrap_or(0) + 1;
        delta.set_priority(priority);

        let mut block = CommitBlock::new(delta.encode()?);
        for (head, _) in &heads {
            block = block.with_link(HEAD_LINK, *head);
        }
        block.links.extend(extra_links);

        let encoded = block.encode()?;
        let cid = Cid::from_content(&encoded);
        store.put(&keys::block_key(&cid), encoded)?;

        for (head, _) in &heads {
            self.supersede(store, head)?;
        }
        store.put(
            &keys::head_key(&self.doc_key, &self.field, &cid),
            crdt::encode_priority(priority),
        )?;

        Ok((cid, block))
    }

    /// Advance the head set for a remotely-received commit.
    ///
    /// Every parent the commit names is marked superseded and dropped from
    /// the head set; the commit itself becomes a head unless something
    /// processed earlier already superseded it. The stale markers are what
    /// keep an out-of-order DAG walk (child merged before its parent
    /// arrives) from re-adding an ancestor as a head.
    pub fn process_node<S: WriteStore>(
        &self,
        store: &S,
        cid: &Cid,
        priority: u64,
        parents: &[Cid],
    ) -> Result<(), ClockError> {
        for parent in parents {
            self.supersede(store, parent)?;
        }
        if store.has(&keys::stale_head_key(&self.doc_key, &self.field, cid))? {
            return Ok(());
        }
        store.put(
            &keys::head_key(&self.doc_key, &self.field, cid),
            crdt::encode_priority(priority),
        )?;
        Ok(())
    }

    fn supersede<S: WriteStore>(&self, store: &S, cid: &Cid) -> Result<(), ClockError> {
        let head = keys::head_key(&self.doc_key, &self.field, cid);
        if store.has(&head)? {
            store.delete(&head)?;
        }
        store.put(
            &keys::stale_head_key(&self.doc_key, &self.field, cid),
            Vec::new(),
        )?;
        Ok(())
    }
}
