//! Network trait definitions.
//!
//! The replication core consumes the host through these narrow interfaces so
//! that the real transport stack stays swappable — the simulated in-process
//! network implements the same traits the production host would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::rpc::{RpcReply, RpcRequest};
use super::NetError;
use crate::dag::Cid;
use crate::peers::PeerId;

/// Callback for messages delivered on a subscribed topic. The optional
/// reply is ignored by fire-and-forget publishes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(
        self: Arc<Self>,
        from: PeerId,
        topic: &str,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, NetError>;
}

/// Callback for topic membership traffic.
pub trait TopicEventHandler: Send + Sync {
    fn on_peer_joined(&self, peer: PeerId, topic: &str);
}

/// Handlers installed when joining a topic.
#[derive(Clone, Default)]
pub struct TopicHandlers {
    pub message: Option<Arc<dyn MessageHandler>>,
    pub event: Option<Arc<dyn TopicEventHandler>>,
}

/// An open topic. Closing it drops the subscription.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Fire-and-forget publish to all subscribers.
    async fn publish(&self, data: Vec<u8>) -> Result<(), NetError>;

    async fn close(&self) -> Result<(), NetError>;
}

/// Topic-based fan-out with a subscribe / publish-only distinction.
#[async_trait]
pub trait PubSubNet: Send + Sync {
    /// Join a topic. With `subscribe` false the handle can publish but
    /// receives nothing and is not listed as a topic peer.
    async fn join(
        &self,
        topic: &str,
        subscribe: bool,
        handlers: TopicHandlers,
    ) -> Result<Arc<dyn TopicHandle>, NetError>;

    /// Peers currently subscribed to a topic.
    fn list_peers(&self, topic: &str) -> Vec<PeerId>;
}

/// Inbound RPC dispatch.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(self: Arc<Self>, from: PeerId, req: RpcRequest) -> Result<RpcReply, NetError>;
}

/// Point-to-point request/reply between peers.
#[async_trait]
pub trait RpcNet: Send + Sync {
    /// Start serving inbound requests with the given handler.
    async fn serve(&self, handler: Arc<dyn RpcHandler>) -> Result<(), NetError>;

    /// Send a request to a peer and await its reply. Dialing requires the
    /// peer's addresses to be present in the peerstore.
    async fn push(&self, to: PeerId, req: RpcRequest) -> Result<RpcReply, NetError>;

    /// Stop serving: drain in-flight requests for up to `graceful`, then
    /// force.
    async fn stop(&self, graceful: Duration);
}

/// Known dial addresses per peer.
pub trait Peerstore: Send + Sync {
    /// Record addresses for a peer. Entries persist until cleared.
    fn add_addrs(&self, peer: PeerId, addrs: Vec<String>);
    fn clear_addrs(&self, peer: PeerId);
    fn addrs(&self, peer: PeerId) -> Vec<String>;
}

/// Fetch blocks other peers hold.
#[async_trait]
pub trait BlockExchange: Send + Sync {
    async fn fetch(&self, cid: Cid) -> Result<Vec<u8>, NetError>;
}

/// Serves this node's blocks to the exchange.
pub trait BlockSource: Send + Sync {
    fn get_block(&self, cid: &Cid) -> Option<Vec<u8>>;
}

impl BlockSource for crate::db::Database {
    fn get_block(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.block_get(cid)
    }
}

/// Everything the peer needs from its network host.
pub trait Host: PubSubNet + RpcNet + Peerstore + BlockExchange + Send + Sync {
    fn id(&self) -> PeerId;
}
