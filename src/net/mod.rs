//! Peer replication core.
//!
//! `Peer` is the public face: replicator registry, outbound publisher, and
//! lifecycle. The internal `Server` owns the pubsub topic map and the
//! inbound push-log path. Both talk to the network exclusively through the
//! traits in `transport`, with `simulated` providing the in-process
//! implementation used by tests and local assembly.

mod guards;
mod peer;
mod rpc;
mod server;
mod simulated;
mod transport;

pub use peer::{P2PCollection, Peer};
pub use rpc::{PushLogReply, PushLogRequest, RpcReply, RpcRequest};
pub use simulated::{SimHost, SimNetwork};
pub use transport::{
    BlockExchange, BlockSource, Host, MessageHandler, Peerstore, PubSubNet, RpcHandler, RpcNet,
    TopicEventHandler, TopicHandle, TopicHandlers,
};

use std::time::Duration;

use thiserror::Error;

use crate::clock::ClockError;
use crate::crdt::CrdtError;
use crate::dag::{Cid, DagError};
use crate::db::DbError;
use crate::keys::DocKey;
use crate::peers::{PeerAddrError, PeerId};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("can't target ourselves as a replicator")]
    SelfTarget,

    #[error("replicator already exists for {collection} with peer {peer}")]
    ReplicatorExists { collection: String, peer: PeerId },

    #[error(transparent)]
    InvalidPeerAddr(#[from] PeerAddrError),

    #[error("transaction conflict retries exhausted after {retries} attempts")]
    MaxTxnRetries { retries: usize },

    #[error("peer {0} is unreachable")]
    PeerUnreachable(PeerId),

    #[error("no provider found for block {0}")]
    BlockNotFound(Cid),

    #[error("topic {topic:?}: {reason}")]
    Topic { topic: String, reason: String },

    #[error("failed to encode wire message: {0}")]
    WireEncode(String),

    #[error("failed to decode wire message: {0}")]
    WireDecode(String),

    #[error("failed to process log for doc {doc_key} (cid {cid}): {source}")]
    ProcessLog {
        doc_key: DocKey,
        cid: Cid,
        #[source]
        source: Box<NetError>,
    },

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Dag(#[from] DagError),
}

/// Net-layer configuration.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Parallelism of the per-push child-block fetch pool.
    pub dag_worker_count: usize,
    /// How long shutdown waits for in-flight work before forcing.
    pub shutdown_timeout: Duration,
    /// Buffer size of the observability event channels.
    pub emitter_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            dag_worker_count: 5,
            shutdown_timeout: Duration::from_secs(10),
            emitter_capacity: 64,
        }
    }
}

/// Emitted whenever a peer joins a topic we subscribe to.
#[derive(Clone, Debug)]
pub struct PubSubEvent {
    pub peer: PeerId,
}

/// Emitted after an inbound push log is applied for the first time.
#[derive(Clone, Debug)]
pub struct ReceivedPushLog {
    /// The peer the request arrived from.
    pub from_peer: PeerId,
    /// The peer that originally created the log.
    pub by_peer: PeerId,
}
