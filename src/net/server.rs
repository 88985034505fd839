//! Pubsub topic manager and inbound push-log handler.
//!
//! One `Server` per peer. It owns the topic table (with the subscribed /
//! publish-only distinction), receives every inbound `PushLogRequest`,
//! whether over direct RPC or a pubsub message, and runs the DAG walk plus
//! transactional merge under per-document serialization.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;

use super::guards::{CidVisitSet, DocQueue, VisitGuard};
use super::rpc::{self, PushLogReply, PushLogRequest, RpcReply, RpcRequest};
use super::transport::{
    Host, MessageHandler, RpcHandler, TopicEventHandler, TopicHandle, TopicHandlers,
};
use super::{NetError, PeerConfig, PubSubEvent, ReceivedPushLog};
use crate::clock::MerkleClock;
use crate::crdt::{CompositeRegister, Delta, LwwRegister};
use crate::dag::{Cid, CommitBlock, HEAD_LINK};
use crate::db::{Collection, Database};
use crate::events::Update;
use crate::keys::{self, DocKey, COMPOSITE_FIELD};
use crate::peers::PeerId;
use crate::store::{ReadStore, StoreError, Txn, WriteStore};

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

struct TopicEntry {
    handle: Arc<dyn TopicHandle>,
    subscribed: bool,
}

pub(crate) struct Server {
    /// Self-reference handed out as the pubsub and RPC callback target.
    weak: Weak<Server>,
    host: Arc<dyn Host>,
    db: Arc<Database>,
    config: PeerConfig,

    /// Held across handle creation so two callers cannot race the same
    /// topic into existence twice.
    topics: Mutex<HashMap<String, TopicEntry>>,

    doc_queue: DocQueue,
    /// Cids currently being fetched or merged anywhere in this server.
    queued_children: CidVisitSet,

    pubsub_emitter: broadcast::Sender<PubSubEvent>,
    pushlog_emitter: broadcast::Sender<ReceivedPushLog>,
}

impl Server {
    pub(crate) fn new(host: Arc<dyn Host>, db: Arc<Database>, config: PeerConfig) -> Arc<Self> {
        let (pubsub_emitter, _) = broadcast::channel(config.emitter_capacity);
        let (pushlog_emitter, _) = broadcast::channel(config.emitter_capacity);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            host,
            db,
            config,
            topics: Mutex::new(HashMap::new()),
            doc_queue: DocQueue::new(),
            queued_children: CidVisitSet::new(),
            pubsub_emitter,
            pushlog_emitter,
        })
    }

    /// Strong self-reference. None only while the server is being torn
    /// down, in which case the caller has nothing useful left to do.
    fn strong(&self) -> Option<Arc<Self>> {
        self.weak.upgrade()
    }

    pub(crate) fn subscribe_pubsub_events(&self) -> broadcast::Receiver<PubSubEvent> {
        self.pubsub_emitter.subscribe()
    }

    pub(crate) fn subscribe_push_log_events(&self) -> broadcast::Receiver<ReceivedPushLog> {
        self.pushlog_emitter.subscribe()
    }

    pub(crate) fn list_peers(&self, topic: &str) -> Vec<PeerId> {
        self.host.list_peers(topic)
    }

    // --- topic manager ----------------------------------------------------

    /// Join a topic, installing this server's message and event handlers.
    ///
    /// A publish-only handle is upgraded in place when `subscribe` is true;
    /// an already-subscribed topic is a no-op.
    pub(crate) async fn add_topic(&self, name: &str, subscribe: bool) -> Result<(), NetError> {
        let Some(this) = self.strong() else {
            return Ok(());
        };
        let mut topics = self.topics.lock().await;
        if let Some(entry) = topics.get(name) {
            if entry.subscribed || !subscribe {
                return Ok(());
            }
            entry.handle.close().await?;
            topics.remove(name);
        }

        let handlers = TopicHandlers {
            message: Some(this.clone() as Arc<dyn MessageHandler>),
            event: Some(this as Arc<dyn TopicEventHandler>),
        };
        let handle = self.host.join(name, subscribe, handlers).await?;
        topics.insert(
            name.to_string(),
            TopicEntry {
                handle,
                subscribed: subscribe,
            },
        );
        Ok(())
    }

    /// Whether we hold a full subscription to a topic. A publish-only
    /// handle does not count — it receives nothing.
    pub(crate) async fn has_subscribed_topic(&self, name: &str) -> bool {
        self.topics
            .lock()
            .await
            .get(name)
            .map_or(false, |entry| entry.subscribed)
    }

    pub(crate) async fn remove_topic(&self, name: &str) -> Result<(), NetError> {
        let entry = self.topics.lock().await.remove(name);
        match entry {
            Some(entry) => entry.handle.close().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn remove_all_topics(&self) -> Result<(), NetError> {
        let entries: Vec<TopicEntry> = {
            let mut topics = self.topics.lock().await;
            topics.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.handle.close().await?;
        }
        Ok(())
    }

    /// Publish a push-log request on a topic, transparently creating the
    /// topic publish-only when we are not in it yet.
    pub(crate) async fn publish_log(
        &self,
        topic: &str,
        req: &PushLogRequest,
    ) -> Result<(), NetError> {
        let existing = {
            let topics = self.topics.lock().await;
            topics.get(topic).map(|e| e.handle.clone())
        };
        let handle = match existing {
            Some(handle) => handle,
            None => {
                self.add_topic(topic, false).await.map_err(|e| NetError::Topic {
                    topic: topic.to_string(),
                    reason: format!("failed to create single-use topic: {e}"),
                })?;
                let topics = self.topics.lock().await;
                topics
                    .get(topic)
                    .map(|e| e.handle.clone())
                    .ok_or_else(|| NetError::Topic {
                        topic: topic.to_string(),
                        reason: "topic removed while publishing".to_string(),
                    })?
            }
        };

        handle.publish(rpc::encode_message(req)?).await?;
        log::debug!("published log {} on topic {:?}", req.cid, topic);
        Ok(())
    }

    // --- direct push ------------------------------------------------------

    /// Send one update directly to a peer over RPC.
    pub(crate) async fn push_log_to_peer(&self, to: PeerId, update: &Update) -> Result<(), NetError> {
        let req = PushLogRequest::from_update(update, self.host.id());
        match self.host.push(to, RpcRequest::PushLog(req)).await? {
            RpcReply::PushLog(_) => Ok(()),
            other => Err(NetError::WireDecode(format!(
                "unexpected reply to push log: {other:?}"
            ))),
        }
    }

    // --- inbound push handler ---------------------------------------------

    /// Apply one inbound push-log request. Serialized per doc key; duplicate
    /// deliveries of the same cid are suppressed and report success.
    pub(crate) async fn push_log(
        &self,
        from: PeerId,
        req: PushLogRequest,
    ) -> Result<PushLogReply, NetError> {
        log::debug!(
            "received push log from {} for doc {:?} (cid {})",
            from,
            req.doc_key,
            req.cid
        );

        self.doc_queue.acquire(req.doc_key.as_str()).await;
        let result = self.push_log_serialized(&req).await;
        self.doc_queue.release(req.doc_key.as_str());

        let applied = result?;
        if applied {
            let _ = self.pushlog_emitter.send(ReceivedPushLog {
                from_peer: from,
                by_peer: req.creator,
            });
        }
        Ok(PushLogReply {})
    }

    /// Runs with the doc-queue slot held. Returns whether the log was
    /// applied (false for duplicate-suppressed requests).
    async fn push_log_serialized(&self, req: &PushLogRequest) -> Result<bool, NetError> {
        if !self.queued_children.visit(req.cid) {
            return Ok(false);
        }
        let _visit = VisitGuard::new(self.queued_children.clone(), req.cid);

        if self.db.block_has(&req.cid) {
            log::debug!("already have block {} locally, skipping", req.cid);
            return Ok(false);
        }

        let retries = self.db.max_txn_retries();
        for _ in 0..retries {
            // A fresh transaction per attempt keeps a failed DAG walk from
            // deadlocking later ones.
            let txn = Arc::new(self.db.new_concurrent_txn(false));
            if let Err(e) = self.apply_push(&txn, req).await {
                txn.discard();
                return Err(NetError::ProcessLog {
                    doc_key: req.doc_key.clone(),
                    cid: req.cid,
                    source: Box::new(e),
                });
            }
            match txn.commit() {
                Ok(()) => {
                    // Follow this document on pubsub unless the collection
                    // topic already covers it.
                    if !self.has_subscribed_topic(&req.schema_id).await {
                        self.add_topic(req.doc_key.as_str(), true).await?;
                    }
                    return Ok(true);
                }
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(NetError::MaxTxnRetries { retries })
    }

    async fn apply_push(&self, txn: &Arc<Txn>, req: &PushLogRequest) -> Result<(), NetError> {
        let col = self.db.get_collection_by_schema_id_txn(txn.as_ref(), &req.schema_id)?;
        let block = CommitBlock::decode_verified(&req.block, req.cid)?;

        let children =
            self.process_log(txn.as_ref(), &col, &req.doc_key, req.cid, COMPOSITE_FIELD, &block)?;
        if !children.is_empty() {
            log::debug!("handling {} children for log {}", children.len(), req.cid);
            let Some(this) = self.strong() else {
                return Ok(());
            };
            let limiter = Arc::new(Semaphore::new(self.config.dag_worker_count.max(1)));
            this.handle_child_blocks(Arc::clone(txn), col, req.doc_key.clone(), children, limiter)
                .await;
        }
        Ok(())
    }

    /// Store one block, merge its delta, advance the heads, and report the
    /// linked blocks not yet present locally as `(field, cid)` pairs.
    fn process_log(
        &self,
        txn: &Txn,
        col: &Collection,
        doc_key: &DocKey,
        cid: Cid,
        field: &str,
        block: &CommitBlock,
    ) -> Result<Vec<(String, Cid)>, NetError> {
        txn.put(&keys::block_key(&cid), block.encode()?)?;

        let delta = Delta::decode(&block.delta)?;
        if field == COMPOSITE_FIELD {
            CompositeRegister::new(doc_key.clone(), col.schema_version_id())
                .merge(txn, &delta)?;
            // Remotely-received documents are enumerable like local ones.
            txn.put(&keys::doc_index_key(col.schema_id(), doc_key), Vec::new())?;
        } else {
            LwwRegister::new(doc_key.clone(), field, col.schema_version_id())
                .merge(txn, &delta)?;
        }

        let parents: Vec<Cid> = block.parents().collect();
        MerkleClock::new(doc_key.clone(), field).process_node(
            txn,
            &cid,
            delta.priority(),
            &parents,
        )?;

        let mut missing = Vec::new();
        for link in &block.links {
            if !txn.has(&keys::block_key(&link.cid))? {
                let child_field = if link.name == HEAD_LINK {
                    field.to_string()
                } else {
                    link.name.clone()
                };
                missing.push((child_field, link.cid));
            }
        }
        Ok(missing)
    }

    /// Fetch and merge missing child blocks with bounded parallelism,
    /// recursing into their own missing links. Failures are logged per
    /// child and never abort the parent merge; an absent ancestor will be
    /// re-requested when something else references it.
    fn handle_child_blocks(
        self: Arc<Self>,
        txn: Arc<Txn>,
        col: Collection,
        doc_key: DocKey,
        children: Vec<(String, Cid)>,
        limiter: Arc<Semaphore>,
    ) -> BoxFuture<()> {
        Box::pin(async move {
            let mut jobs = JoinSet::new();
            for (field, cid) in children {
                if !self.queued_children.visit(cid) {
                    continue;
                }
                let server = Arc::clone(&self);
                let txn = Arc::clone(&txn);
                let col = col.clone();
                let doc_key = doc_key.clone();
                let limiter = Arc::clone(&limiter);
                jobs.spawn(async move {
                    let _visit = VisitGuard::new(server.queued_children.clone(), cid);
                    let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                        return;
                    };
                    let bytes = match server.host.fetch(cid).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!(
                                "failed to fetch child block {} for doc {:?}: {}",
                                cid,
                                doc_key,
                                e
                            );
                            return;
                        }
                    };
                    drop(permit);

                    let block = match CommitBlock::decode_verified(&bytes, cid) {
                        Ok(block) => block,
                        Err(e) => {
                            log::warn!("fetched child block {} is invalid: {}", cid, e);
                            return;
                        }
                    };
                    let grandchildren =
                        match server.process_log(txn.as_ref(), &col, &doc_key, cid, &field, &block) {
                            Ok(grandchildren) => grandchildren,
                            Err(e) => {
                                log::error!(
                                    "failed to process child block {} for doc {:?}: {}",
                                    cid,
                                    doc_key,
                                    e
                                );
                                return;
                            }
                        };
                    if !grandchildren.is_empty() {
                        Arc::clone(&server)
                            .handle_child_blocks(txn, col, doc_key, grandchildren, limiter)
                            .await;
                    }
                });
            }
            while jobs.join_next().await.is_some() {}
        })
    }
}

#[async_trait]
impl MessageHandler for Server {
    /// Pubsub delivery path: decode the request and hand it to the same
    /// push handler the direct RPC uses.
    async fn on_message(
        self: Arc<Self>,
        from: PeerId,
        topic: &str,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, NetError> {
        log::debug!("handling pubsub message from {} on topic {:?}", from, topic);
        let req: PushLogRequest = rpc::decode_message(data)?;
        if let Err(e) = self.push_log(from, req).await {
            log::error!("failed pushing log from pubsub topic {:?}: {}", topic, e);
            return Err(e);
        }
        Ok(None)
    }
}

impl TopicEventHandler for Server {
    fn on_peer_joined(&self, peer: PeerId, topic: &str) {
        log::info!("peer {} joined topic {:?}", peer, topic);
        let _ = self.pubsub_emitter.send(PubSubEvent { peer });
    }
}

#[async_trait]
impl RpcHandler for Server {
    async fn handle(self: Arc<Self>, from: PeerId, req: RpcRequest) -> Result<RpcReply, NetError> {
        match req {
            RpcRequest::PushLog(req) => Ok(RpcReply::PushLog(self.push_log(from, req).await?)),
            // Reserved anti-entropy surface; intentionally inert.
            RpcRequest::GetDocGraph(_) => Ok(RpcReply::GetDocGraph(Default::default())),
            RpcRequest::PushDocGraph(_) => Ok(RpcReply::PushDocGraph(Default::default())),
            RpcRequest::GetLog(_) => Ok(RpcReply::GetLog(Default::default())),
            RpcRequest::GetHeadLog(_) => Ok(RpcReply::GetHeadLog(Default::default())),
        }
    }
}
