//! Collection handle: document writes and reads over the CRDT tables.
//!
//! Every write produces one commit block per touched field plus a composite
//! commit linking them, all inside a single transaction. The update event
//! for the composite commit is emitted only after the commit succeeds.

use crate::clock::MerkleClock;
use crate::crdt::{CompositeRegister, Delta, LwwRegister};
use crate::dag::{BlockLink, Cid};
use crate::events::{EventBus, Update};
use crate::keys::{self, DocKey};
use crate::store::{MemoryStore, ReadStore, Txn, WriteStore};

use super::{CollectionDescriptor, DbError};

/// A handle to one collection. Cheap to clone.
#[derive(Clone)]
pub struct Collection {
    desc: CollectionDescriptor,
    store: MemoryStore,
    events: EventBus,
}

impl Collection {
    pub(super) fn new(desc: CollectionDescriptor, store: MemoryStore, events: EventBus) -> Self {
        Self {
            desc,
            store,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn schema_id(&self) -> &str {
        &self.desc.schema_id
    }

    pub fn schema_version_id(&self) -> &str {
        &self.desc.schema_version_id
    }

    /// All doc keys known to this collection, in key order.
    pub fn get_all_doc_keys(&self, txn: &Txn) -> Result<Vec<DocKey>, DbError> {
        let prefix = keys::doc_index_prefix(&self.desc.schema_id);
        Ok(txn
            .iter_prefix(&prefix)?
            .into_iter()
            .map(|(key, _)| DocKey::from_string(&key[prefix.len()..]))
            .collect())
    }

    /// Create a document. Returns its content-derived key and the cid of the
    /// initial composite commit.
    pub fn create_doc(&self, fields: Vec<(String, Vec<u8>)>) -> Result<(DocKey, Cid), DbError> {
        self.validate_fields(&fields)?;
        let doc_key = DocKey::generate(&self.desc.schema_id, &fields);

        let txn = self.store.new_txn(false);
        if txn.has(&keys::primary_key(&doc_key))? {
            txn.discard();
            return Err(DbError::DocumentExists(doc_key));
        }
        let update = match self.write_fields(&txn, &doc_key, fields) {
            Ok(update) => update,
            Err(e) => {
                txn.discard();
                return Err(e);
            }
        };
        txn.commit()?;

        let cid = update.cid;
        self.events.publish(update);
        Ok((doc_key, cid))
    }

    /// Apply new field values to an existing document. Returns the cid of
    /// the new composite commit.
    pub fn update_doc(
        &self,
        doc_key: &DocKey,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<Cid, DbError> {
        self.validate_fields(&fields)?;

        let txn = self.store.new_txn(false);
        if !txn.has(&keys::primary_key(doc_key))? {
            txn.discard();
            return Err(DbError::UnknownDocument(
                doc_key.clone(),
                self.desc.name.clone(),
            ));
        }
        let update = match self.write_fields(&txn, doc_key, fields) {
            Ok(update) => update,
            Err(e) => {
                txn.discard();
                return Err(e);
            }
        };
        txn.commit()?;

        let cid = update.cid;
        self.events.publish(update);
        Ok(cid)
    }

    /// Read one field's current value.
    pub fn get_field(&self, doc_key: &DocKey, field: &str) -> Result<Option<Vec<u8>>, DbError> {
        let txn = self.store.new_txn(true);
        let reg = LwwRegister::new(doc_key.clone(), field, &self.desc.schema_version_id);
        let value = reg.value(&txn)?;
        txn.discard();
        Ok(value)
    }

    fn validate_fields(&self, fields: &[(String, Vec<u8>)]) -> Result<(), DbError> {
        for (name, _) in fields {
            if !self.desc.fields.contains(name) {
                return Err(DbError::UnknownField {
                    collection: self.desc.name.clone(),
                    field: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Write field deltas plus the composite commit into `txn` and build the
    /// update event for the composite block. Emission is the caller's job,
    /// after commit.
    fn write_fields(
        &self,
        txn: &Txn,
        doc_key: &DocKey,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<Update, DbError> {
        let svid = &self.desc.schema_version_id;

        let mut field_links = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            let reg = LwwRegister::new(doc_key.clone(), &field, svid);
            let mut delta = Delta::Lww(reg.set(value));
            let clock = MerkleClock::new(doc_key.clone(), &field);
            let (cid, _) = clock.add_delta(txn, &mut delta, vec![])?;
            reg.merge(txn, &delta)?;
            field_links.push(BlockLink { name: field, cid });
        }

        let composite = CompositeRegister::new(doc_key.clone(), svid);
        let mut delta = Delta::Composite(composite.set());
        let clock = MerkleClock::new(doc_key.clone(), keys::COMPOSITE_FIELD);
        let (cid, block) = clock.add_delta(txn, &mut delta, field_links)?;
        composite.merge(txn, &delta)?;

        txn.put(
            &keys::doc_index_key(&self.desc.schema_id, doc_key),
            Vec::new(),
        )?;

        Ok(Update {
            doc_key: doc_key.clone(),
            cid,
            schema_id: self.desc.schema_id.clone(),
            block: block.encode()?,
            priority: delta.priority(),
        })
    }
}
