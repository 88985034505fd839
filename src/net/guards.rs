//! Small concurrency guards for the push path.

use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::dag::Cid;

/// Tracks cids currently being processed so two parallel parent chains
/// meeting at a common ancestor do not both fetch and merge it.
#[derive(Clone, Default)]
pub(crate) struct CidVisitSet {
    inner: Arc<Mutex<HashSet<Cid>>>,
}

impl CidVisitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true iff this is the first visit of `cid` still in flight.
    pub fn visit(&self, cid: Cid) -> bool {
        self.inner.lock().unwrap().insert(cid)
    }

    pub fn remove(&self, cid: &Cid) {
        self.inner.lock().unwrap().remove(cid);
    }
}

/// Removes the visit entry when the processing scope ends, error paths
/// included.
pub(crate) struct VisitGuard {
    set: CidVisitSet,
    cid: Cid,
}

impl VisitGuard {
    pub fn new(set: CidVisitSet, cid: Cid) -> Self {
        Self { set, cid }
    }
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        self.set.remove(&self.cid);
    }
}

/// Per-document serialization queue.
///
/// Exactly one holder per doc key at a time; everyone else parks until the
/// holder releases, then races to re-acquire. Not re-entrant — a second
/// acquire from the same holder waits like any other.
#[derive(Default)]
pub(crate) struct DocQueue {
    docs: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl DocQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, doc_key: &str) {
        loop {
            let mut waiter = {
                let mut docs = self.docs.lock().unwrap();
                match docs.entry(doc_key.to_string()) {
                    Entry::Vacant(slot) => {
                        let (tx, _) = broadcast::channel(1);
                        slot.insert(tx);
                        return;
                    }
                    // Subscribe while holding the lock so a release between
                    // here and the await cannot be missed.
                    Entry::Occupied(slot) => slot.get().subscribe(),
                }
            };
            let _ = waiter.recv().await;
        }
    }

    pub fn release(&self, doc_key: &str) {
        let mut docs = self.docs.lock().unwrap();
        if let Some(tx) = docs.remove(doc_key) {
            let _ = tx.send(());
        }
    }
}
