//! The peer node: replicator registry, outbound publisher, and lifecycle.
//!
//! `Peer` turns locally-committed updates into pubsub publishes and direct
//! replicator pushes, and manages which peers we push to regardless of
//! their subscription state. Inbound traffic lands in the internal
//! `Server`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::rpc::PushLogRequest;
use super::server::Server;
use super::transport::{Host, RpcHandler};
use super::{NetError, PeerConfig, PubSubEvent, ReceivedPushLog};
use crate::clock::MerkleClock;
use crate::db::{Collection, Database};
use crate::events::Update;
use crate::keys::{self, DocKey, SchemaId, COMPOSITE_FIELD};
use crate::peers::{PeerAddr, PeerId, Replicator};
use crate::store::{ReadStore, Txn};

/// A schema participating in pubsub replication, with its resolved
/// collection name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct P2PCollection {
    pub schema_id: SchemaId,
    pub name: String,
}

/// A peer-to-peer replication node bound to one database and one network
/// host.
pub struct Peer {
    db: Arc<Database>,
    host: Arc<dyn Host>,
    server: Arc<Server>,
    config: PeerConfig,

    /// schema id -> peers we push every commit of that schema to.
    replicators: Mutex<HashMap<SchemaId, HashSet<PeerId>>>,

    shutdown: watch::Sender<bool>,
    broadcast_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Build a peer and load its persisted replicator set. `start` must be
    /// called before the node participates in the network.
    pub fn new(
        db: Arc<Database>,
        host: Arc<dyn Host>,
        config: PeerConfig,
    ) -> Result<Arc<Self>, NetError> {
        let server = Server::new(host.clone(), db.clone(), config.clone());
        let (shutdown, _) = watch::channel(false);
        let peer = Arc::new(Self {
            db,
            host,
            server,
            config,
            replicators: Mutex::new(HashMap::new()),
            shutdown,
            broadcast_handle: Mutex::new(None),
        });
        peer.load_replicators()?;
        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.host.id()
    }

    /// Start all internal workers: collection topics, per-doc topics, the
    /// broadcast loop, and the RPC server.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetError> {
        let p2p: HashSet<SchemaId> = self.db.get_all_p2p_collections()?.into_iter().collect();
        for schema in &p2p {
            self.server.add_topic(schema, true).await?;
        }

        // Every document of a collection not covered by a collection topic
        // gets its own subscribed topic.
        let txn = self.db.new_txn(true);
        let result = self.register_existing_doc_topics(&txn, &p2p).await;
        txn.discard();
        result?;

        log::info!("starting internal broadcaster for pubsub network");
        let updates = self.db.events().subscribe();
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(Self::broadcast_loop(Arc::clone(self), updates, shutdown));
        *self.broadcast_handle.lock().unwrap() = Some(handle);

        self.host
            .serve(self.server.clone() as Arc<dyn RpcHandler>)
            .await?;
        Ok(())
    }

    async fn register_existing_doc_topics(
        &self,
        txn: &Txn,
        p2p: &HashSet<SchemaId>,
    ) -> Result<(), NetError> {
        let mut registered = 0usize;
        for col in self.db.get_all_collections_txn(txn)? {
            if p2p.contains(col.schema_id()) {
                continue;
            }
            for doc_key in col.get_all_doc_keys(txn)? {
                self.server.add_topic(doc_key.as_str(), true).await?;
                registered += 1;
            }
        }
        log::debug!("registered {} existing doc topics", registered);
        Ok(())
    }

    /// Shut the node down: close topics, drain the RPC server, stop the
    /// broadcast loop.
    pub async fn close(&self) {
        if let Err(e) = self.server.remove_all_topics().await {
            log::error!("error closing pubsub topics: {}", e);
        }
        self.host.stop(self.config.shutdown_timeout).await;

        let _ = self.shutdown.send(true);
        let handle = self.broadcast_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                log::warn!("broadcast loop did not stop within the shutdown deadline");
            }
        }
    }

    // --- outbound publisher -----------------------------------------------

    async fn broadcast_loop(
        peer: Arc<Peer>,
        mut updates: broadcast::Receiver<Update>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::debug!("waiting for messages on internal broadcaster");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                received = updates.recv() => match received {
                    Ok(update) => {
                        let result = match update.priority {
                            0 => {
                                log::warn!(
                                    "skipping log with invalid priority of 0 (cid {})",
                                    update.cid
                                );
                                Ok(())
                            }
                            1 => peer.handle_doc_create_log(&update).await,
                            _ => peer.handle_doc_update_log(&update).await,
                        };
                        if let Err(e) = result {
                            log::error!(
                                "error while handling broadcast log for doc {:?}: {}",
                                update.doc_key,
                                e
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("broadcast loop lagged; dropped {} updates", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Losing the update channel means local commits can
                        // no longer replicate. Nothing to do but stop.
                        log::error!("update event channel closed; stopping broadcaster");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_doc_create_log(&self, update: &Update) -> Result<(), NetError> {
        self.register_new_document(update).await?;
        self.push_log_to_replicators(update);
        Ok(())
    }

    async fn handle_doc_update_log(&self, update: &Update) -> Result<(), NetError> {
        log::debug!(
            "preparing pubsub push log from broadcast for doc {:?} (cid {})",
            update.doc_key,
            update.cid
        );
        let req = PushLogRequest::from_update(update, self.host.id());

        self.push_log_to_replicators(update);
        self.server
            .publish_log(update.doc_key.as_str(), &req)
            .await?;
        self.server.publish_log(&update.schema_id, &req).await?;
        Ok(())
    }

    /// Register a newly created document: subscribe its doc-key topic
    /// (unless the collection topic already covers it) and announce the
    /// create on the schema topic so collection subscribers see it.
    pub async fn register_new_document(&self, update: &Update) -> Result<(), NetError> {
        log::debug!("registering new document {:?}", update.doc_key);
        let covered = self.server.has_subscribed_topic(&update.schema_id).await;
        self.server
            .add_topic(update.doc_key.as_str(), !covered)
            .await?;

        let req = PushLogRequest::from_update(update, self.host.id());
        self.server.publish_log(&update.schema_id, &req).await
    }

    /// Push an update directly to every replicator of its schema, skipping
    /// peers the pubsub layer will already deliver to. Each push runs in
    /// its own task; failures are logged and never fatal.
    fn push_log_to_replicators(&self, update: &Update) {
        let mut subscribers: HashSet<PeerId> = HashSet::new();
        subscribers.extend(self.server.list_peers(update.doc_key.as_str()));
        subscribers.extend(self.server.list_peers(&update.schema_id));

        let targets: Vec<PeerId> = {
            let reps = self.replicators.lock().unwrap();
            match reps.get(&update.schema_id) {
                Some(peers) => peers
                    .iter()
                    .filter(|p| !subscribers.contains(p))
                    .copied()
                    .collect(),
                None => return,
            }
        };

        for pid in targets {
            let server = Arc::clone(&self.server);
            let update = update.clone();
            tokio::spawn(async move {
                if let Err(e) = server.push_log_to_peer(pid, &update).await {
                    log::error!(
                        "failed pushing log {} for doc {:?} to peer {}: {}",
                        update.cid,
                        update.doc_key,
                        pid,
                        e
                    );
                }
            });
        }
    }

    // --- replicator registry ----------------------------------------------

    /// Add a destination peer for the given collections (all collections
    /// when empty). Persists the entry and pushes the current head of every
    /// existing document to the new peer before returning.
    pub async fn set_replicator(
        &self,
        addr: PeerAddr,
        collection_names: &[&str],
    ) -> Result<PeerId, NetError> {
        let txn = Arc::new(self.db.new_txn(false));
        match self.set_replicator_txn(&txn, &addr, collection_names).await {
            Ok((pid, added)) => match txn.commit() {
                Ok(()) => Ok(pid),
                Err(e) => {
                    self.rollback_added(&added, addr.id);
                    Err(e.into())
                }
            },
            Err(e) => {
                txn.discard();
                Err(e)
            }
        }
    }

    async fn set_replicator_txn(
        &self,
        txn: &Arc<Txn>,
        addr: &PeerAddr,
        collection_names: &[&str],
    ) -> Result<(PeerId, Vec<SchemaId>), NetError> {
        let pid = addr.id;
        if pid == self.host.id() {
            return Err(NetError::SelfTarget);
        }
        let collections = self.resolve_collections(txn.as_ref(), collection_names)?;

        // Record the destination's addresses for dialing. Entries stay until
        // the replicator is removed from its last schema.
        self.host.add_addrs(pid, addr.addrs.clone());

        let mut added: Vec<SchemaId> = Vec::new();
        {
            let mut reps = self.replicators.lock().unwrap();
            for col in &collections {
                let duplicate = reps
                    .get(col.schema_id())
                    .map_or(false, |peers| peers.contains(&pid));
                if duplicate {
                    return Err(NetError::ReplicatorExists {
                        collection: col.name().to_string(),
                        peer: pid,
                    });
                }
            }
            for col in &collections {
                reps.entry(col.schema_id().to_string())
                    .or_default()
                    .insert(pid);
                added.push(col.schema_id().to_string());
            }
        }

        let schemas: Vec<SchemaId> = collections
            .iter()
            .map(|c| c.schema_id().to_string())
            .collect();
        if let Err(e) = self.db.set_replicator(
            txn.as_ref(),
            &Replicator {
                addr: addr.clone(),
                schemas,
            },
        ) {
            self.rollback_added(&added, pid);
            return Err(e.into());
        }

        for col in &collections {
            if let Err(e) = self.push_heads_to_replicator(txn, col, pid).await {
                self.rollback_added(&added, pid);
                return Err(e);
            }
        }
        Ok((pid, added))
    }

    /// Push the composite heads of every existing document in `col` to a
    /// freshly added replicator. Individual head or block failures are
    /// logged and skipped.
    async fn push_heads_to_replicator(
        &self,
        txn: &Arc<Txn>,
        col: &Collection,
        pid: PeerId,
    ) -> Result<(), NetError> {
        for doc_key in col.get_all_doc_keys(txn.as_ref())? {
            let clock = MerkleClock::new(doc_key.clone(), COMPOSITE_FIELD);
            let heads = match clock.heads(txn.as_ref()) {
                Ok(heads) => heads,
                Err(e) => {
                    log::error!(
                        "failed to get heads for doc {:?} on {:?} while bootstrapping {}: {}",
                        doc_key,
                        col.name(),
                        pid,
                        e
                    );
                    continue;
                }
            };
            for (cid, priority) in heads {
                let block = match txn.get(&keys::block_key(&cid)) {
                    Ok(Some(block)) => block,
                    Ok(None) => {
                        log::error!("missing head block {} for doc {:?}", cid, doc_key);
                        continue;
                    }
                    Err(e) => {
                        log::error!("failed to read head block {}: {}", cid, e);
                        continue;
                    }
                };
                let update = Update {
                    doc_key: doc_key.clone(),
                    cid,
                    schema_id: col.schema_id().to_string(),
                    block,
                    priority,
                };
                if let Err(e) = self.server.push_log_to_peer(pid, &update).await {
                    log::error!(
                        "failed to replicate log {} for doc {:?} to {}: {}",
                        cid,
                        doc_key,
                        pid,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Remove a peer from the given collections' replicator sets (all
    /// collections when empty). Clears its known addresses once it
    /// replicates nothing.
    pub async fn delete_replicator(
        &self,
        pid: PeerId,
        collection_names: &[&str],
    ) -> Result<(), NetError> {
        let txn = Arc::new(self.db.new_txn(false));
        match self.delete_replicator_txn(&txn, pid, collection_names).await {
            Ok(removed) => match txn.commit() {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.restore_removed(&removed, pid);
                    Err(e.into())
                }
            },
            Err(e) => {
                txn.discard();
                Err(e)
            }
        }
    }

    async fn delete_replicator_txn(
        &self,
        txn: &Arc<Txn>,
        pid: PeerId,
        collection_names: &[&str],
    ) -> Result<Vec<SchemaId>, NetError> {
        if pid == self.host.id() {
            return Err(NetError::SelfTarget);
        }
        let collections = self.resolve_collections(txn.as_ref(), collection_names)?;
        let schema_set: HashSet<&str> = collections.iter().map(|c| c.schema_id()).collect();

        let mut removed: Vec<SchemaId> = Vec::new();
        let mut remaining = 0usize;
        {
            let mut reps = self.replicators.lock().unwrap();
            for (schema, peers) in reps.iter_mut() {
                if peers.contains(&pid) {
                    if schema_set.contains(schema.as_str()) {
                        peers.remove(&pid);
                        removed.push(schema.clone());
                    } else {
                        remaining += 1;
                    }
                }
            }
            reps.retain(|_, peers| !peers.is_empty());
        }

        let saved_addrs = self.host.addrs(pid);
        if remaining == 0 {
            self.host.clear_addrs(pid);
        }

        let schemas: Vec<SchemaId> = collections
            .iter()
            .map(|c| c.schema_id().to_string())
            .collect();
        if let Err(e) = self.db.delete_replicator(txn.as_ref(), pid, &schemas) {
            self.restore_removed(&removed, pid);
            if remaining == 0 && !saved_addrs.is_empty() {
                self.host.add_addrs(pid, saved_addrs);
            }
            return Err(e.into());
        }
        Ok(removed)
    }

    pub fn get_all_replicators(&self) -> Result<Vec<Replicator>, NetError> {
        Ok(self.db.get_all_replicators()?)
    }

    fn load_replicators(&self) -> Result<(), NetError> {
        let records = self.db.get_all_replicators()?;
        let mut count = 0usize;
        let mut reps = self.replicators.lock().unwrap();
        for record in records {
            for schema in &record.schemas {
                reps.entry(schema.clone())
                    .or_default()
                    .insert(record.addr.id);
            }
            self.host
                .add_addrs(record.addr.id, record.addr.addrs.clone());
            count += 1;
        }
        drop(reps);
        log::info!("loaded {} replicators from datastore", count);
        Ok(())
    }

    fn rollback_added(&self, schemas: &[SchemaId], pid: PeerId) {
        let mut reps = self.replicators.lock().unwrap();
        for schema in schemas {
            if let Some(peers) = reps.get_mut(schema) {
                peers.remove(&pid);
                if peers.is_empty() {
                    reps.remove(schema);
                }
            }
        }
    }

    fn restore_removed(&self, schemas: &[SchemaId], pid: PeerId) {
        let mut reps = self.replicators.lock().unwrap();
        for schema in schemas {
            reps.entry(schema.clone()).or_default().insert(pid);
        }
    }

    fn resolve_collections(
        &self,
        txn: &Txn,
        collection_names: &[&str],
    ) -> Result<Vec<Collection>, NetError> {
        if collection_names.is_empty() {
            return Ok(self.db.get_all_collections_txn(txn)?);
        }
        collection_names
            .iter()
            .map(|name| {
                self.db
                    .get_collection_by_name_txn(txn, name)
                    .map_err(NetError::from)
            })
            .collect()
    }

    // --- p2p collection set -----------------------------------------------

    /// Subscribe to the given schemas' collection topics and persist the
    /// choice. Topics are joined before the set is persisted so a
    /// persistence failure can compensate by leaving no topic behind.
    pub async fn add_p2p_collections(&self, schema_ids: &[&str]) -> Result<(), NetError> {
        let txn = self.db.new_txn(false);

        let mut collections = Vec::new();
        for schema in schema_ids {
            match self.db.get_collection_by_schema_id_txn(&txn, schema) {
                Ok(col) => collections.push(col),
                Err(e) => {
                    txn.discard();
                    return Err(e.into());
                }
            }
        }
        let doc_keys = match self.all_doc_keys(&txn, &collections) {
            Ok(keys) => keys,
            Err(e) => {
                txn.discard();
                return Err(e);
            }
        };

        let mut added: Vec<String> = Vec::new();
        for schema in schema_ids {
            if let Err(e) = self.server.add_topic(schema, true).await {
                self.remove_topics_best_effort(&added).await;
                txn.discard();
                return Err(e);
            }
            added.push(schema.to_string());
        }

        let persisted = (|| -> Result<(), NetError> {
            for schema in schema_ids {
                self.db.add_p2p_collection(&txn, schema)?;
            }
            txn.commit()?;
            Ok(())
        })();
        if let Err(e) = persisted {
            self.remove_topics_best_effort(&added).await;
            txn.discard();
            return Err(e);
        }

        // The collection topics now cover these documents; drop their
        // individual topics to avoid duplicate deliveries.
        for doc_key in doc_keys {
            if let Err(e) = self.server.remove_topic(doc_key.as_str()).await {
                log::info!("failed to remove doc topic {:?}: {}", doc_key, e);
            }
        }
        Ok(())
    }

    /// Unsubscribe from the given schemas' collection topics, persist the
    /// removal, and re-subscribe each of their documents individually.
    pub async fn remove_p2p_collections(&self, schema_ids: &[&str]) -> Result<(), NetError> {
        let txn = self.db.new_txn(false);

        let mut collections = Vec::new();
        for schema in schema_ids {
            match self.db.get_collection_by_schema_id_txn(&txn, schema) {
                Ok(col) => collections.push(col),
                Err(e) => {
                    txn.discard();
                    return Err(e.into());
                }
            }
        }
        let doc_keys = match self.all_doc_keys(&txn, &collections) {
            Ok(keys) => keys,
            Err(e) => {
                txn.discard();
                return Err(e);
            }
        };

        let mut removed: Vec<String> = Vec::new();
        for schema in schema_ids {
            if let Err(e) = self.server.remove_topic(schema).await {
                self.add_topics_best_effort(&removed).await;
                txn.discard();
                return Err(e);
            }
            removed.push(schema.to_string());
        }

        let persisted = (|| -> Result<(), NetError> {
            for schema in schema_ids {
                self.db.remove_p2p_collection(&txn, schema)?;
            }
            txn.commit()?;
            Ok(())
        })();
        if let Err(e) = persisted {
            self.add_topics_best_effort(&removed).await;
            txn.discard();
            return Err(e);
        }

        for doc_key in doc_keys {
            if let Err(e) = self.server.add_topic(doc_key.as_str(), true).await {
                log::info!("failed to re-add doc topic {:?}: {}", doc_key, e);
            }
        }
        Ok(())
    }

    pub fn get_all_p2p_collections(&self) -> Result<Vec<P2PCollection>, NetError> {
        let txn = self.db.new_txn(true);
        let mut result = Vec::new();
        for schema_id in self.db.get_all_p2p_collections()? {
            match self.db.get_collection_by_schema_id_txn(&txn, &schema_id) {
                Ok(col) => result.push(P2PCollection {
                    schema_id,
                    name: col.name().to_string(),
                }),
                Err(e) => {
                    txn.discard();
                    return Err(e.into());
                }
            }
        }
        txn.discard();
        Ok(result)
    }

    fn all_doc_keys(
        &self,
        txn: &Txn,
        collections: &[Collection],
    ) -> Result<Vec<DocKey>, NetError> {
        let mut doc_keys = Vec::new();
        for col in collections {
            doc_keys.extend(col.get_all_doc_keys(txn)?);
        }
        Ok(doc_keys)
    }

    async fn remove_topics_best_effort(&self, topics: &[String]) {
        for topic in topics {
            if let Err(e) = self.server.remove_topic(topic).await {
                log::error!("failed to remove topic {:?} during rollback: {}", topic, e);
            }
        }
    }

    async fn add_topics_best_effort(&self, topics: &[String]) {
        for topic in topics {
            if let Err(e) = self.server.add_topic(topic, true).await {
                log::error!("failed to re-add topic {:?} during rollback: {}", topic, e);
            }
        }
    }

    // --- observability ----------------------------------------------------

    /// Events emitted when a peer joins a subscribed topic.
    pub fn subscribe_pubsub_events(&self) -> broadcast::Receiver<PubSubEvent> {
        self.server.subscribe_pubsub_events()
    }

    /// Events emitted after an inbound push log is applied.
    pub fn subscribe_push_log_events(&self) -> broadcast::Receiver<ReceivedPushLog> {
        self.server.subscribe_push_log_events()
    }
}
