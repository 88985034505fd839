//! Two-node replication scenarios over the simulated network.
//!
//! Each test assembles full nodes (database + host + peer) on one
//! `SimNetwork` and drives them through document creates, updates,
//! replicator changes, and duplicate/partition situations. Tests
//! synchronize on the peers' emitted events instead of polling.
//!
//! Run with:
//!   cargo test --test replication

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use tidemark::clock::MerkleClock;
use tidemark::db::{Collection, Database, DbConfig};
use tidemark::keys::{DocKey, COMPOSITE_FIELD};
use tidemark::net::{
    Host, NetError, Peer, PeerConfig, Peerstore, PushLogRequest, ReceivedPushLog, RpcNet,
    RpcRequest, SimHost, SimNetwork,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Node {
    db: Arc<Database>,
    host: Arc<SimHost>,
    peer: Arc<Peer>,
    users: Collection,
}

/// Assemble a full node: database with a `users{name}` collection, host on
/// the shared network, started peer.
async fn make_node(network: &Arc<SimNetwork>) -> Node {
    let db = Database::new(DbConfig::default());
    let users = db.create_collection("users", &["name"]).unwrap();
    let host = network.create_host();
    host.provide_blocks(db.clone());

    let peer = Peer::new(db.clone(), host.clone() as Arc<dyn Host>, PeerConfig::default())
        .unwrap();
    peer.start().await.unwrap();

    Node {
        db,
        host,
        peer,
        users,
    }
}

fn name_field(value: &str) -> Vec<(String, Vec<u8>)> {
    vec![("name".to_string(), value.as_bytes().to_vec())]
}

async fn expect_push_log(rx: &mut broadcast::Receiver<ReceivedPushLog>) -> ReceivedPushLog {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a push log event")
        .expect("push log emitter closed")
}

async fn expect_no_push_log(rx: &mut broadcast::Receiver<ReceivedPushLog>) {
    let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(result.is_err(), "unexpected push log event: {result:?}");
}

/// Let in-flight deliveries settle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn composite_heads(db: &Database, doc_key: &DocKey) -> Vec<(tidemark::dag::Cid, u64)> {
    let txn = db.new_txn(true);
    let heads = MerkleClock::new(doc_key.clone(), COMPOSITE_FIELD)
        .heads(&txn)
        .unwrap();
    txn.discard();
    heads
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A replicator set up before creation delivers the new document exactly
/// once; the destination's query state matches the source's.
#[tokio::test(start_paused = true)]
async fn test_create_reaches_replicator() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    let mut pushes = node2.peer.subscribe_push_log_events();
    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();

    let (doc, _) = node1.users.create_doc(name_field("a")).unwrap();

    let event = expect_push_log(&mut pushes).await;
    assert_eq!(event.by_peer, node1.peer.id());
    assert_eq!(event.from_peer, node1.peer.id());
    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"a".to_vec())
    );
}

/// Updates made after the create flow through as well.
#[tokio::test(start_paused = true)]
async fn test_update_reaches_replicator() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    let mut pushes = node2.peer.subscribe_push_log_events();
    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();

    let (doc, _) = node1.users.create_doc(name_field("a")).unwrap();
    expect_push_log(&mut pushes).await;

    node1.users.update_doc(&doc, name_field("b")).unwrap();
    expect_push_log(&mut pushes).await;

    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"b".to_vec())
    );
}

/// Concurrent updates at equal priority converge on both sides to the
/// lexicographically larger value.
#[tokio::test(start_paused = true)]
async fn test_concurrent_updates_converge() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    let mut pushes1 = node1.peer.subscribe_push_log_events();
    let mut pushes2 = node2.peer.subscribe_push_log_events();
    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();
    node2
        .peer
        .set_replicator(node1.host.addr(), &["users"])
        .await
        .unwrap();

    let (doc, _) = node1.users.create_doc(name_field("a")).unwrap();
    expect_push_log(&mut pushes2).await;

    // Partition moment: both sides update the same head without having
    // seen each other's commit.
    node1.users.update_doc(&doc, name_field("c")).unwrap();
    node2.users.update_doc(&doc, name_field("d")).unwrap();

    expect_push_log(&mut pushes1).await;
    expect_push_log(&mut pushes2).await;
    settle().await;

    // Lexicographic tiebreak at equal priority: "d" > "c".
    assert_eq!(
        node1.users.get_field(&doc, "name").unwrap(),
        Some(b"d".to_vec())
    );
    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"d".to_vec())
    );

    // Both concurrent commits remain heads on both sides.
    let mut heads1 = composite_heads(&node1.db, &doc);
    let mut heads2 = composite_heads(&node2.db, &doc);
    heads1.sort();
    heads2.sort();
    assert_eq!(heads1.len(), 2);
    assert_eq!(heads1, heads2);
}

/// The same request delivered twice concurrently merges once and emits one
/// event.
#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_is_idempotent() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    let mut pushes = node2.peer.subscribe_push_log_events();

    // Produce a commit without any replication hooked up.
    let (doc, cid) = node1.users.create_doc(name_field("a")).unwrap();
    let block = node1.db.block_get(&cid).unwrap();
    let req = RpcRequest::PushLog(PushLogRequest {
        doc_key: doc.clone(),
        cid,
        schema_id: node1.users.schema_id().to_string(),
        creator: node1.peer.id(),
        block,
    });

    node1
        .host
        .add_addrs(node2.peer.id(), vec!["sim://node2".to_string()]);
    let (first, second) = tokio::join!(
        node1.host.push(node2.peer.id(), req.clone()),
        node1.host.push(node2.peer.id(), req.clone()),
    );
    first.unwrap();
    second.unwrap();

    expect_push_log(&mut pushes).await;
    expect_no_push_log(&mut pushes).await;

    assert!(node2.db.block_has(&cid));
    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"a".to_vec())
    );

    // Re-delivery after the fact is also a no-op.
    node1.host.push(node2.peer.id(), req).await.unwrap();
    expect_no_push_log(&mut pushes).await;
}

/// A commit whose parents are unknown to the receiver pulls them through
/// the exchange inside the same merge; the final head priority matches the
/// sender's.
#[tokio::test(start_paused = true)]
async fn test_missing_parents_are_fetched() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    // Build history before any replication: node2 has neither commit.
    let (doc, _) = node1.users.create_doc(name_field("a")).unwrap();
    node1.users.update_doc(&doc, name_field("b")).unwrap();
    settle().await;

    let mut pushes = node2.peer.subscribe_push_log_events();
    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();

    expect_push_log(&mut pushes).await;
    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"b".to_vec())
    );

    let heads1 = composite_heads(&node1.db, &doc);
    let heads2 = composite_heads(&node2.db, &doc);
    assert_eq!(heads1, heads2);
    assert_eq!(heads2[0].1, 2);
}

/// After replicator removal the peer stops receiving new documents.
#[tokio::test(start_paused = true)]
async fn test_deleted_replicator_stops_receiving() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();
    node1
        .peer
        .delete_replicator(node2.peer.id(), &["users"])
        .await
        .unwrap();
    assert!(node1.peer.get_all_replicators().unwrap().is_empty());

    let mut pushes = node2.peer.subscribe_push_log_events();
    let (doc, _) = node1.users.create_doc(name_field("solo")).unwrap();

    expect_no_push_log(&mut pushes).await;
    assert_eq!(node2.users.get_field(&doc, "name").unwrap(), None);
}

// ---------------------------------------------------------------------------
// Registry validation & bootstrap
// ---------------------------------------------------------------------------

/// Targeting ourselves is a validation error and mutates nothing.
#[tokio::test(start_paused = true)]
async fn test_self_replicator_is_rejected() {
    let network = SimNetwork::new();
    let node = make_node(&network).await;

    let err = node
        .peer
        .set_replicator(node.host.addr(), &["users"])
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::SelfTarget));
    assert!(node.peer.get_all_replicators().unwrap().is_empty());
}

/// Duplicate (schema, peer) pairs and unknown collections are rejected.
#[tokio::test(start_paused = true)]
async fn test_replicator_validation_errors() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();
    let err = node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::ReplicatorExists { .. }));

    let err = node1
        .peer
        .set_replicator(node2.host.addr(), &["ghosts"])
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Db(_)));
}

/// Adding a replicator for a collection with existing documents pushes
/// every head before `set_replicator` returns.
#[tokio::test(start_paused = true)]
async fn test_replicator_bootstrap_pushes_existing_documents() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    let mut docs = Vec::new();
    for value in ["a", "b", "c"] {
        let (doc, _) = node1.users.create_doc(name_field(value)).unwrap();
        docs.push((doc, value));
    }
    settle().await;

    let mut pushes = node2.peer.subscribe_push_log_events();
    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();

    // All three heads were pushed and applied before set returned.
    for _ in 0..docs.len() {
        pushes.try_recv().unwrap();
    }
    for (doc, value) in &docs {
        assert_eq!(
            node2.users.get_field(doc, "name").unwrap(),
            Some(value.as_bytes().to_vec())
        );
    }
}

/// Replicators survive a peer restart through the persisted records.
#[tokio::test(start_paused = true)]
async fn test_replicators_reload_on_restart() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();
    node1.peer.close().await;

    // A fresh peer over the same database reloads the registry.
    let peer = Peer::new(
        node1.db.clone(),
        node1.host.clone() as Arc<dyn Host>,
        PeerConfig::default(),
    )
    .unwrap();
    peer.start().await.unwrap();

    let mut pushes = node2.peer.subscribe_push_log_events();
    let (doc, _) = node1.users.create_doc(name_field("later")).unwrap();

    expect_push_log(&mut pushes).await;
    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"later".to_vec())
    );
    peer.close().await;
}

// ---------------------------------------------------------------------------
// Pubsub collection topics
// ---------------------------------------------------------------------------

/// A peer subscribed to the collection topic receives a create exactly
/// once, even when it is also configured as a replicator.
#[tokio::test(start_paused = true)]
async fn test_collection_subscriber_receives_create_once() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;
    let schema_id = node1.users.schema_id().to_string();

    node2.peer
        .add_p2p_collections(&[schema_id.as_str()])
        .await
        .unwrap();
    node1
        .peer
        .set_replicator(node2.host.addr(), &["users"])
        .await
        .unwrap();

    let mut pushes = node2.peer.subscribe_push_log_events();
    let (doc, _) = node1.users.create_doc(name_field("once")).unwrap();

    expect_push_log(&mut pushes).await;
    expect_no_push_log(&mut pushes).await;
    assert_eq!(
        node2.users.get_field(&doc, "name").unwrap(),
        Some(b"once".to_vec())
    );
}

/// The p2p collection set is persisted and enumerable, and removal takes a
/// collection back out of pubsub fan-in.
#[tokio::test(start_paused = true)]
async fn test_p2p_collection_set_round_trip() {
    let network = SimNetwork::new();
    let node = make_node(&network).await;
    let schema_id = node.users.schema_id().to_string();

    node.peer
        .add_p2p_collections(&[schema_id.as_str()])
        .await
        .unwrap();
    let listed = node.peer.get_all_p2p_collections().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].schema_id, schema_id);
    assert_eq!(listed[0].name, "users");

    node.peer
        .remove_p2p_collections(&[schema_id.as_str()])
        .await
        .unwrap();
    assert!(node.peer.get_all_p2p_collections().unwrap().is_empty());
}

/// Pushing a log for an unknown schema fails the request without touching
/// other documents.
#[tokio::test(start_paused = true)]
async fn test_push_log_for_unknown_schema_errors() {
    let network = SimNetwork::new();
    let node1 = make_node(&network).await;
    let node2 = make_node(&network).await;

    let (doc, cid) = node1.users.create_doc(name_field("a")).unwrap();
    let block = node1.db.block_get(&cid).unwrap();
    let req = RpcRequest::PushLog(PushLogRequest {
        doc_key: doc,
        cid,
        schema_id: "no-such-schema".to_string(),
        creator: node1.peer.id(),
        block,
    });

    node1
        .host
        .add_addrs(node2.peer.id(), vec!["sim://node2".to_string()]);
    let err = node1.host.push(node2.peer.id(), req).await.unwrap_err();
    assert!(matches!(err, NetError::ProcessLog { .. }));
    assert!(!node2.db.block_has(&cid));
}
