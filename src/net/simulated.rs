//! In-process network simulator.
//!
//! A `SimNetwork` is the shared medium; each `SimHost` on it is one node's
//! view, implementing pubsub, RPC, peerstore, and block exchange entirely
//! in-process. Used for integration testing without a real transport stack.
//! Payloads still round-trip through CBOR so the wire shape is exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;

use super::rpc::{decode_message, encode_message, RpcReply, RpcRequest};
use super::transport::{
    BlockExchange, BlockSource, Host, Peerstore, PubSubNet, RpcHandler, RpcNet, TopicHandle,
    TopicHandlers,
};
use super::NetError;
use crate::dag::Cid;
use crate::peers::{PeerAddr, PeerId};

#[derive(Clone)]
struct TopicSub {
    subscribed: bool,
    handlers: TopicHandlers,
}

#[derive(Default)]
struct NetState {
    /// topic -> member -> subscription.
    topics: HashMap<String, HashMap<PeerId, TopicSub>>,
    rpc: HashMap<PeerId, Arc<dyn RpcHandler>>,
    in_flight: HashMap<PeerId, Arc<AtomicUsize>>,
    blocks: HashMap<PeerId, Arc<dyn BlockSource>>,
}

/// The shared medium all simulated hosts communicate through.
pub struct SimNetwork {
    state: Mutex<NetState>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState::default()),
        })
    }

    /// Create a new host on this network with a fresh identity.
    pub fn create_host(self: &Arc<Self>) -> Arc<SimHost> {
        Arc::new(SimHost {
            id: PeerId::random(),
            network: Arc::clone(self),
            peerstore: Mutex::new(HashMap::new()),
        })
    }
}

/// One node's view of the simulated network.
pub struct SimHost {
    id: PeerId,
    network: Arc<SimNetwork>,
    /// Local peerstore: known dial addresses per peer.
    peerstore: Mutex<HashMap<PeerId, Vec<String>>>,
}

impl SimHost {
    /// This host's dialable address.
    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.id, format!("sim://{}", self.id))
    }

    /// Register the source this host serves blocks from.
    pub fn provide_blocks(&self, source: Arc<dyn BlockSource>) {
        let mut state = self.network.state.lock().unwrap();
        state.blocks.insert(self.id, source);
    }
}

impl Host for SimHost {
    fn id(&self) -> PeerId {
        self.id
    }
}

#[async_trait]
impl PubSubNet for SimHost {
    async fn join(
        &self,
        topic: &str,
        subscribe: bool,
        handlers: TopicHandlers,
    ) -> Result<Arc<dyn TopicHandle>, NetError> {
        let joined_handlers = {
            let mut state = self.network.state.lock().unwrap();
            let members = state.topics.entry(topic.to_string()).or_default();
            members.insert(
                self.id,
                TopicSub {
                    subscribed: subscribe,
                    handlers,
                },
            );
            if subscribe {
                members
                    .iter()
                    .filter(|(peer, sub)| **peer != self.id && sub.subscribed)
                    .filter_map(|(_, sub)| sub.handlers.event.clone())
                    .collect()
            } else {
                Vec::new()
            }
        };
        // Tell existing subscribers a peer joined, off the lock.
        for handler in joined_handlers {
            handler.on_peer_joined(self.id, topic);
        }

        Ok(Arc::new(SimTopicHandle {
            network: Arc::clone(&self.network),
            topic: topic.to_string(),
            peer: self.id,
        }))
    }

    fn list_peers(&self, topic: &str) -> Vec<PeerId> {
        let state = self.network.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|members| {
                members
                    .iter()
                    .filter(|(peer, sub)| **peer != self.id && sub.subscribed)
                    .map(|(peer, _)| *peer)
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct SimTopicHandle {
    network: Arc<SimNetwork>,
    topic: String,
    peer: PeerId,
}

#[async_trait]
impl TopicHandle for SimTopicHandle {
    fn name(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), NetError> {
        let targets: Vec<(PeerId, Arc<dyn super::MessageHandler>)> = {
            let state = self.network.state.lock().unwrap();
            let members = state
                .topics
                .get(&self.topic)
                .ok_or_else(|| NetError::Topic {
                    topic: self.topic.clone(),
                    reason: "not joined".to_string(),
                })?;
            if !members.contains_key(&self.peer) {
                return Err(NetError::Topic {
                    topic: self.topic.clone(),
                    reason: "not joined".to_string(),
                });
            }
            members
                .iter()
                .filter(|(peer, sub)| **peer != self.peer && sub.subscribed)
                .filter_map(|(peer, sub)| sub.handlers.message.clone().map(|h| (*peer, h)))
                .collect()
        };

        // Fire-and-forget delivery; replies and per-subscriber failures are
        // the receiver's problem.
        let from = self.peer;
        for (target, handler) in targets {
            let topic = self.topic.clone();
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.on_message(from, &topic, &data).await {
                    log::warn!("pubsub delivery to {} on {:?} failed: {}", target, topic, e);
                }
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NetError> {
        let mut state = self.network.state.lock().unwrap();
        if let Some(members) = state.topics.get_mut(&self.topic) {
            members.remove(&self.peer);
            if members.is_empty() {
                state.topics.remove(&self.topic);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RpcNet for SimHost {
    async fn serve(&self, handler: Arc<dyn RpcHandler>) -> Result<(), NetError> {
        let mut state = self.network.state.lock().unwrap();
        state.rpc.insert(self.id, handler);
        state
            .in_flight
            .entry(self.id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        Ok(())
    }

    async fn push(&self, to: PeerId, req: RpcRequest) -> Result<RpcReply, NetError> {
        if self.addrs(to).is_empty() {
            return Err(NetError::PeerUnreachable(to));
        }
        // Full wire round-trip even in-process.
        let wire = encode_message(&req)?;

        let (handler, counter) = {
            let state = self.network.state.lock().unwrap();
            let handler = state
                .rpc
                .get(&to)
                .cloned()
                .ok_or(NetError::PeerUnreachable(to))?;
            let counter = state
                .in_flight
                .get(&to)
                .cloned()
                .ok_or(NetError::PeerUnreachable(to))?;
            (handler, counter)
        };

        counter.fetch_add(1, Ordering::SeqCst);
        let result = handler.handle(self.id, decode_message(&wire)?).await;
        counter.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn stop(&self, graceful: Duration) {
        let counter = {
            let mut state = self.network.state.lock().unwrap();
            state.rpc.remove(&self.id);
            state.in_flight.remove(&self.id)
        };
        let Some(counter) = counter else { return };

        let deadline = Instant::now() + graceful;
        while counter.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                log::warn!(
                    "rpc server for {} stopped ungracefully with {} requests in flight",
                    self.id,
                    counter.load(Ordering::SeqCst)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Peerstore for SimHost {
    fn add_addrs(&self, peer: PeerId, addrs: Vec<String>) {
        let mut store = self.peerstore.lock().unwrap();
        let entry = store.entry(peer).or_default();
        for addr in addrs {
            if !entry.contains(&addr) {
                entry.push(addr);
            }
        }
    }

    fn clear_addrs(&self, peer: PeerId) {
        self.peerstore.lock().unwrap().remove(&peer);
    }

    fn addrs(&self, peer: PeerId) -> Vec<String> {
        self.peerstore
            .lock()
            .unwrap()
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlockExchange for SimHost {
    async fn fetch(&self, cid: Cid) -> Result<Vec<u8>, NetError> {
        let sources: Vec<Arc<dyn BlockSource>> = {
            let state = self.network.state.lock().unwrap();
            state
                .blocks
                .iter()
                .filter(|(peer, _)| **peer != self.id)
                .map(|(_, source)| source.clone())
                .collect()
        };
        for source in sources {
            if let Some(block) = source.get_block(&cid) {
                return Ok(block);
            }
        }
        Err(NetError::BlockNotFound(cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::MessageHandler;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<(PeerId, String, Vec<u8>)>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(
            self: Arc<Self>,
            from: PeerId,
            topic: &str,
            data: &[u8],
        ) -> Result<Option<Vec<u8>>, NetError> {
            let _ = self.tx.send((from, topic.to_string(), data.to_vec()));
            Ok(None)
        }
    }

    fn recording_handlers() -> (TopicHandlers, mpsc::UnboundedReceiver<(PeerId, String, Vec<u8>)>)
    {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TopicHandlers {
                message: Some(Arc::new(Recorder { tx })),
                event: None,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_only() {
        let network = SimNetwork::new();
        let alpha = network.create_host();
        let beta = network.create_host();
        let gamma = network.create_host();

        let (beta_handlers, mut beta_rx) = recording_handlers();
        let (gamma_handlers, mut gamma_rx) = recording_handlers();

        let topic = alpha.join("t", false, TopicHandlers::default()).await.unwrap();
        beta.join("t", true, beta_handlers).await.unwrap();
        // Publish-only member: must receive nothing and not be listed.
        gamma.join("t", false, gamma_handlers).await.unwrap();

        topic.publish(b"hello".to_vec()).await.unwrap();

        let (from, name, data) = beta_rx.recv().await.unwrap();
        assert_eq!(from, alpha.id());
        assert_eq!(name, "t");
        assert_eq!(data, b"hello");

        assert!(gamma_rx.try_recv().is_err());
        assert_eq!(alpha.list_peers("t"), vec![beta.id()]);
    }

    #[tokio::test]
    async fn test_rpc_push_requires_known_addrs() {
        let network = SimNetwork::new();
        let alpha = network.create_host();
        let beta = network.create_host();

        struct Echo;
        #[async_trait]
        impl RpcHandler for Echo {
            async fn handle(
                self: Arc<Self>,
                _from: PeerId,
                req: RpcRequest,
            ) -> Result<RpcReply, NetError> {
                match req {
                    RpcRequest::PushLog(_) => Ok(RpcReply::PushLog(Default::default())),
                    _ => Ok(RpcReply::GetLog(Default::default())),
                }
            }
        }
        beta.serve(Arc::new(Echo)).await.unwrap();

        let req = RpcRequest::GetLog(Default::default());
        assert!(matches!(
            alpha.push(beta.id(), req.clone()).await,
            Err(NetError::PeerUnreachable(_))
        ));

        alpha.add_addrs(beta.id(), vec!["sim://beta".into()]);
        assert!(alpha.push(beta.id(), req).await.is_ok());
    }

    #[tokio::test]
    async fn test_exchange_fetches_from_other_hosts() {
        let network = SimNetwork::new();
        let alpha = network.create_host();
        let beta = network.create_host();

        struct OneBlock {
            cid: Cid,
        }
        impl BlockSource for OneBlock {
            fn get_block(&self, cid: &Cid) -> Option<Vec<u8>> {
                (*cid == self.cid).then(|| b"data".to_vec())
            }
        }

        let cid = Cid::from_content(b"data");
        beta.provide_blocks(Arc::new(OneBlock { cid }));

        assert_eq!(alpha.fetch(cid).await.unwrap(), b"data");
        assert!(matches!(
            alpha.fetch(Cid::from_content(b"missing")).await,
            Err(NetError::BlockNotFound(_))
        ));
    }
}
