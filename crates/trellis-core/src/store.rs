//! Change persistence.
//!
//! The core is storage-agnostic: anything that can persist change blobs
//! and return an entity's changes in timestamp order can back it. The
//! bundled [`MemStore`] is the in-memory implementation used by tests
//! and by hosts that manage durability themselves.

use std::collections::HashMap;

use crate::change::{Change, ChangeId, EntityId};
use crate::clock::Timestamp;
use crate::entity::Entity;
use crate::error::Result;

/// Backing storage for change blobs.
pub trait ChangeStore {
    /// Persist one change. Persisting the same ID twice is a no-op.
    fn persist(&mut self, id: &ChangeId, change: &Change) -> Result<()>;

    /// All changes of one entity, ascending by `(timestamp, id)`.
    fn load_changes(&self, entity: &EntityId) -> Result<Vec<(ChangeId, Change)>>;
}

/// Reconstruct an entity from a store, or `None` when the store holds no
/// changes for it.
///
/// # Errors
///
/// Propagates store and [`Entity::apply_change`] failures.
pub fn load_entity(id: &EntityId, store: &impl ChangeStore) -> Result<Option<Entity>> {
    let changes = store.load_changes(id)?;
    if changes.is_empty() {
        return Ok(None);
    }
    let mut entity = Entity::new(id.clone());
    for (cid, ch) in changes {
        entity.apply_change(cid, ch)?;
    }
    Ok(Some(entity))
}

/// In-memory [`ChangeStore`].
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    entities: HashMap<EntityId, std::collections::BTreeMap<(Timestamp, ChangeId), Change>>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeStore for MemStore {
    fn persist(&mut self, id: &ChangeId, change: &Change) -> Result<()> {
        self.entities
            .entry(change.entity.clone())
            .or_default()
            .insert((change.ts, id.clone()), change.clone());
        Ok(())
    }

    fn load_changes(&self, entity: &EntityId) -> Result<Vec<(ChangeId, Change)>> {
        Ok(self.entities.get(entity).map_or_else(Vec::new, |m| {
            m.iter()
                .map(|((_, id), ch)| (id.clone(), ch.clone()))
                .collect()
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Keypair;
    use serde_json::json;

    #[test]
    fn roundtrip_through_store() {
        let alice = Keypair::from_seed([1u8; 32]);
        let id = EntityId::new("hm://doc/stored");
        let mut store = MemStore::new();

        let mut e = Entity::new(id.clone());
        let (c1, ch1) = e
            .create_change("Create", json!({"title": "hello"}), &alice)
            .expect("create");
        let (c2, ch2) = e
            .create_change("Update", json!({"title": "world"}), &alice)
            .expect("create");
        store.persist(&c1, &ch1).expect("persist");
        store.persist(&c2, &ch2).expect("persist");

        let loaded = load_entity(&id, &store).expect("load").expect("present");
        assert_eq!(loaded.version(), e.version());
        assert_eq!(loaded.get(&["title".to_owned()]), Some(&json!("world")));
    }

    #[test]
    fn missing_entity_loads_as_none() {
        let store = MemStore::new();
        let out = load_entity(&EntityId::new("hm://doc/none"), &store).expect("load");
        assert!(out.is_none());
    }

    #[test]
    fn persist_is_idempotent() {
        let alice = Keypair::from_seed([1u8; 32]);
        let id = EntityId::new("hm://doc/dup");
        let mut store = MemStore::new();
        let mut e = Entity::new(id.clone());
        let (c1, ch1) = e
            .create_change("Create", json!({"a": 1}), &alice)
            .expect("create");
        store.persist(&c1, &ch1).expect("persist");
        store.persist(&c1, &ch1).expect("persist");
        assert_eq!(store.load_changes(&id).expect("load").len(), 1);
    }
}
