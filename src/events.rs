//! Local update event bus.
//!
//! The store facade emits an `Update` after every successful local commit;
//! the peer's broadcast loop turns these into pubsub publishes and direct
//! replicator pushes. Emission happens strictly after the transaction
//! commits, so a published commit is always durable locally first.

use tokio::sync::broadcast;

use crate::dag::Cid;
use crate::keys::{DocKey, SchemaId};

/// A locally-committed document update.
#[derive(Clone, Debug)]
pub struct Update {
    pub doc_key: DocKey,
    pub cid: Cid,
    pub schema_id: SchemaId,
    /// Encoded composite commit block.
    pub block: Vec<u8>,
    pub priority: u64,
}

/// Broadcast bus for update events. Cheap to clone; all clones share the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    updates: broadcast::Sender<Update>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        Self { updates }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    /// Publish an update. Having no subscribers is not an error.
    pub fn publish(&self, update: Update) {
        let _ = self.updates.send(update);
    }
}
