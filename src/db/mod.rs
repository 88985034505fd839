//! Store facade: collections, documents, and the persisted replication
//! metadata the net layer depends on.
//!
//! This is deliberately the thin end of the system — queries, schemas-as-a-
//! language, and migration live elsewhere. What the replication core needs
//! from a database is here: transactional access, collection lookup,
//! replicator and p2p-collection records, the block store, and the update
//! event bus.

mod collection;

pub use collection::Collection;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::CrdtError;
use crate::clock::ClockError;
use crate::dag::{Cid, DagError};
use crate::events::EventBus;
use crate::keys::{self, DocKey, SchemaId};
use crate::peers::{PeerId, Replicator};
use crate::store::{MemoryStore, ReadStore, StoreError, Txn, WriteStore};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("collection {0:?} already exists")]
    CollectionExists(String),

    #[error("no collection named {0:?}")]
    UnknownCollection(String),

    #[error("no collection with schema id {0:?}")]
    UnknownSchema(SchemaId),

    #[error("collection {collection:?} has no field {field:?}")]
    UnknownField { collection: String, field: String },

    #[error("document {0} already exists")]
    DocumentExists(DocKey),

    #[error("no document {0} in collection {1:?}")]
    UnknownDocument(DocKey, String),

    #[error("no replicator record for peer {0}")]
    ReplicatorNotFound(PeerId),

    #[error("failed to decode record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Dag(#[from] DagError),
}

/// Store facade configuration.
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// How many times an optimistic transaction is retried on write
    /// conflict before giving up.
    pub max_txn_retries: usize,
    /// Buffer size of the update event channel.
    pub update_channel_capacity: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_txn_retries: 5,
            update_channel_capacity: 64,
        }
    }
}

/// Persisted shape of a collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    pub schema_id: SchemaId,
    pub schema_version_id: String,
    pub fields: Vec<String>,
}

/// The document database, reduced to what replication consumes.
pub struct Database {
    store: MemoryStore,
    config: DbConfig,
    events: EventBus,
}

impl Database {
    pub fn new(config: DbConfig) -> Arc<Self> {
        let events = EventBus::new(config.update_channel_capacity);
        Arc::new(Self {
            store: MemoryStore::new(),
            config,
            events,
        })
    }

    pub fn max_txn_retries(&self) -> usize {
        self.config.max_txn_retries
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn new_txn(&self, read_only: bool) -> Txn {
        self.store.new_txn(read_only)
    }

    pub fn new_concurrent_txn(&self, read_only: bool) -> Txn {
        self.store.new_concurrent_txn(read_only)
    }

    // --- collections -----------------------------------------------------

    /// Create a collection. The schema id is derived from the collection
    /// name and field set, so identical schemas agree across nodes.
    pub fn create_collection(&self, name: &str, fields: &[&str]) -> Result<Collection, DbError> {
        use sha2::{Digest, Sha256};

        let txn = self.new_txn(false);
        let key = keys::collection_key(name);
        if txn.has(&key)? {
            txn.discard();
            return Err(DbError::CollectionExists(name.to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        let mut sorted: Vec<&str> = fields.to_vec();
        sorted.sort_unstable();
        for field in &sorted {
            hasher.update(field.as_bytes());
        }
        let schema_id = hex::encode(hasher.finalize());

        let desc = CollectionDescriptor {
            name: name.to_string(),
            schema_id: schema_id.clone(),
            schema_version_id: schema_id,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        };
        txn.put(&key, encode_record(&key, &desc)?)?;
        txn.commit()?;

        Ok(self.collection_from(desc))
    }

    pub fn get_all_collections_txn(&self, txn: &Txn) -> Result<Vec<Collection>, DbError> {
        let mut collections = Vec::new();
        for (key, value) in txn.iter_prefix(keys::COLLECTION_PREFIX)? {
            let desc: CollectionDescriptor = decode_record(&key, &value)?;
            collections.push(self.collection_from(desc));
        }
        Ok(collections)
    }

    pub fn get_collection_by_name_txn(&self, txn: &Txn, name: &str) -> Result<Collection, DbError> {
        let key = keys::collection_key(name);
        let raw = txn
            .get(&key)?
            .ok_or_else(|| DbError::UnknownCollection(name.to_string()))?;
        Ok(self.collection_from(decode_record(&key, &raw)?))
    }

    pub fn get_collection_by_schema_id_txn(
        &self,
        txn: &Txn,
        schema_id: &str,
    ) -> Result<Collection, DbError> {
        self.get_all_collections_txn(txn)?
            .into_iter()
            .find(|c| c.schema_id() == schema_id)
            .ok_or_else(|| DbError::UnknownSchema(schema_id.to_string()))
    }

    pub fn get_all_collections(&self) -> Result<Vec<Collection>, DbError> {
        let txn = self.new_txn(true);
        let result = self.get_all_collections_txn(&txn);
        txn.discard();
        result
    }

    pub fn get_collection_by_name(&self, name: &str) -> Result<Collection, DbError> {
        let txn = self.new_txn(true);
        let result = self.get_collection_by_name_txn(&txn, name);
        txn.discard();
        result
    }

    fn collection_from(&self, desc: CollectionDescriptor) -> Collection {
        Collection::new(desc, self.store.clone(), self.events.clone())
    }

    // --- block store ------------------------------------------------------

    pub fn block_has(&self, cid: &Cid) -> bool {
        self.store.get_committed(&keys::block_key(cid)).is_some()
    }

    pub fn block_get(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.store.get_committed(&keys::block_key(cid))
    }

    // --- replicator records ----------------------------------------------

    /// Persist a replicator, merging schemas into any existing record for
    /// the same peer.
    pub fn set_replicator(&self, txn: &Txn, rep: &Replicator) -> Result<(), DbError> {
        let key = keys::replicator_key(&rep.addr.id.to_string());
        let merged = match txn.get(&key)? {
            Some(raw) => {
                let mut existing: Replicator = decode_record(&key, &raw)?;
                existing.addr = rep.addr.clone();
                for schema in &rep.schemas {
                    if !existing.schemas.contains(schema) {
                        existing.schemas.push(schema.clone());
                    }
                }
                existing
            }
            None => rep.clone(),
        };
        txn.put(&key, encode_record(&key, &merged)?)?;
        Ok(())
    }

    /// Remove schemas from a peer's replicator record; drop the record
    /// entirely once no schemas remain.
    pub fn delete_replicator(
        &self,
        txn: &Txn,
        peer: PeerId,
        schemas: &[SchemaId],
    ) -> Result<(), DbError> {
        let key = keys::replicator_key(&peer.to_string());
        let raw = txn
            .get(&key)?
            .ok_or(DbError::ReplicatorNotFound(peer))?;
        let mut record: Replicator = decode_record(&key, &raw)?;
        record.schemas.retain(|s| !schemas.contains(s));
        if record.schemas.is_empty() {
            txn.delete(&key)?;
        } else {
            txn.put(&key, encode_record(&key, &record)?)?;
        }
        Ok(())
    }

    pub fn get_all_replicators(&self) -> Result<Vec<Replicator>, DbError> {
        let txn = self.new_txn(true);
        let mut reps = Vec::new();
        for (key, value) in txn.iter_prefix(keys::REPLICATOR_PREFIX)? {
            reps.push(decode_record(&key, &value)?);
        }
        txn.discard();
        Ok(reps)
    }

    // --- p2p collection set ----------------------------------------------

    pub fn add_p2p_collection(&self, txn: &Txn, schema_id: &str) -> Result<(), DbError> {
        txn.put(&keys::p2p_collection_key(schema_id), Vec::new())?;
        Ok(())
    }

    pub fn remove_p2p_collection(&self, txn: &Txn, schema_id: &str) -> Result<(), DbError> {
        txn.delete(&keys::p2p_collection_key(schema_id))?;
        Ok(())
    }

    pub fn get_all_p2p_collections(&self) -> Result<Vec<SchemaId>, DbError> {
        let txn = self.new_txn(true);
        let prefix = keys::P2P_COLLECTION_PREFIX;
        let schemas = txn
            .iter_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect();
        txn.discard();
        Ok(schemas)
    }
}

fn encode_record<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, DbError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| DbError::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(buf)
}

fn decode_record<T: for<'de> Deserialize<'de>>(key: &str, raw: &[u8]) -> Result<T, DbError> {
    ciborium::from_reader(raw).map_err(|e| DbError::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerAddr;

    #[test]
    fn test_collection_lookup_by_name_and_schema() {
        let db = Database::new(DbConfig::default());
        let col = db.create_collection("users", &["name"]).unwrap();

        let txn = db.new_txn(true);
        let by_name = db.get_collection_by_name_txn(&txn, "users").unwrap();
        let by_schema = db
            .get_collection_by_schema_id_txn(&txn, col.schema_id())
            .unwrap();
        assert_eq!(by_name.schema_id(), by_schema.schema_id());

        assert!(matches!(
            db.get_collection_by_name_txn(&txn, "missing"),
            Err(DbError::UnknownCollection(_))
        ));
    }

    #[test]
    fn test_replicator_records_merge_and_empty_out() {
        let db = Database::new(DbConfig::default());
        let peer = PeerId::random();
        let addr = PeerAddr::new(peer, "sim://other");

        let txn = db.new_txn(false);
        db.set_replicator(
            &txn,
            &Replicator {
                addr: addr.clone(),
                schemas: vec!["s1".into()],
            },
        )
        .unwrap();
        db.set_replicator(
            &txn,
            &Replicator {
                addr,
                schemas: vec!["s2".into()],
            },
        )
        .unwrap();
        txn.commit().unwrap();

        let reps = db.get_all_replicators().unwrap();
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].schemas, vec!["s1".to_string(), "s2".to_string()]);

        let txn = db.new_txn(false);
        db.delete_replicator(&txn, peer, &["s1".into(), "s2".into()])
            .unwrap();
        txn.commit().unwrap();
        assert!(db.get_all_replicators().unwrap().is_empty());
    }

    #[test]
    fn test_p2p_collection_set_round_trip() {
        let db = Database::new(DbConfig::default());
        let txn = db.new_txn(false);
        db.add_p2p_collection(&txn, "schema-a").unwrap();
        db.add_p2p_collection(&txn, "schema-b").unwrap();
        db.remove_p2p_collection(&txn, "schema-a").unwrap();
        txn.commit().unwrap();

        assert_eq!(
            db.get_all_p2p_collections().unwrap(),
            vec!["schema-b".to_string()]
        );
    }
}
