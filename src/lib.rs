//! Tidemark — peer-to-peer replication engine for a Merkle-DAG document
//! store.
//!
//! Documents are content-addressed commit chains (one CRDT log per field
//! plus a composite head per document). Nodes exchange new commits over
//! pubsub topics and over direct replicator pushes; receiving nodes walk
//! unknown parent links, fetch missing blocks, and merge deltas under
//! transactional retry.

pub mod clock;
pub mod crdt;
pub mod dag;
pub mod db;
pub mod events;
pub mod keys;
pub mod net;
pub mod peers;
pub mod store;
