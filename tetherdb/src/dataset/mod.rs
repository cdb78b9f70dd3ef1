//! The in-memory state of every collection.
//!
//! Entities keep insertion order (the default query order). Lookups by id go
//! through a position map. Each collection owns its secondary indexes so a
//! cloned `Dataset` is a complete snapshot, indexes included.

use crate::entity::Entity;
use crate::error::{Result, TetherError};
use crate::index::IndexManager;
use crate::schema::Schema;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct CollectionState {
    entities: Vec<Entity>,
    positions: HashMap<String, usize>,
    indexes: IndexManager,
}

impl CollectionState {
    pub fn new(index_specs: &[Vec<String>]) -> Self {
        CollectionState {
            entities: Vec::new(),
            positions: HashMap::new(),
            indexes: IndexManager::new(index_specs),
        }
    }

    /// Seed from loaded entities, rejecting missing or repeated ids.
    pub fn seed(name: &str, index_specs: &[Vec<String>], entities: Vec<Entity>) -> Result<Self> {
        let mut state = CollectionState::new(index_specs);
        for entity in entities {
            let id = entity
                .id()
                .ok_or_else(|| TetherError::validation(name, "id", "loaded entity has no id"))?
                .to_string();
            if state.contains(&id) {
                return Err(TetherError::DuplicateKey {
                    collection: name.to_string(),
                    id,
                });
            }
            state.insert(entity);
        }
        Ok(state)
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.positions.get(id).map(|&pos| &self.entities[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter_map(|e| e.id().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Append an entity. The caller guarantees the id is new.
    pub(crate) fn insert(&mut self, entity: Entity) {
        let Some(id) = entity.id().map(str::to_string) else {
            return;
        };
        self.indexes.on_insert(&entity);
        self.positions.insert(id, self.entities.len());
        self.entities.push(entity);
    }

    /// Replace the entity with the same id, returning the previous version.
    pub(crate) fn replace(&mut self, entity: Entity) -> Option<Entity> {
        let pos = *self.positions.get(entity.id()?)?;
        self.indexes.on_update(&self.entities[pos], &entity);
        Some(std::mem::replace(&mut self.entities[pos], entity))
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Entity> {
        let pos = self.positions.remove(id)?;
        let entity = self.entities.remove(pos);
        self.indexes.on_remove(&entity);
        for later in &self.entities[pos..] {
            if let Some(later_id) = later.id() {
                if let Some(p) = self.positions.get_mut(later_id) {
                    *p -= 1;
                }
            }
        }
        Some(entity)
    }
}

/// All collection states, keyed by collection name
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    collections: HashMap<String, CollectionState>,
}

impl Dataset {
    /// An empty dataset with one collection state per declared collection.
    pub fn for_schema(schema: &Schema) -> Result<Self> {
        let mut collections = HashMap::new();
        for name in schema.collection_names() {
            let specs = &schema.collection(&name)?.indexes;
            collections.insert(name, CollectionState::new(specs));
        }
        Ok(Dataset { collections })
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionState> {
        self.collections
            .get(name)
            .ok_or_else(|| TetherError::CollectionNotFound(name.to_string()))
    }

    pub(crate) fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionState> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| TetherError::CollectionNotFound(name.to_string()))
    }

    pub(crate) fn set_collection(&mut self, name: &str, state: CollectionState) {
        self.collections.insert(name.to_string(), state);
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Entity> {
        self.collections.get(collection)?.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str, role: &str) -> Entity {
        Entity::from_value("users", json!({"id": id, "role": role})).unwrap()
    }

    #[test]
    fn test_insert_get_and_order() {
        let mut state = CollectionState::new(&[]);
        state.insert(entity("a", "admin"));
        state.insert(entity("b", "member"));
        state.insert(entity("c", "guest"));
        assert_eq!(state.ids(), vec!["a", "b", "c"]);
        assert_eq!(state.get("b").unwrap().get("role"), Some(&json!("member")));
    }

    #[test]
    fn test_remove_keeps_positions_consistent() {
        let mut state = CollectionState::new(&[vec!["role".to_string()]]);
        state.insert(entity("a", "admin"));
        state.insert(entity("b", "member"));
        state.insert(entity("c", "guest"));

        let removed = state.remove("a").unwrap();
        assert_eq!(removed.id(), Some("a"));
        assert_eq!(state.get("c").unwrap().id(), Some("c"));
        assert_eq!(state.get("b").unwrap().id(), Some("b"));
        assert!(state.get("a").is_none());

        let role = state.indexes().find(&["role".to_string()]).unwrap();
        assert!(role.lookup(&[&json!("admin")]).is_none());
    }

    #[test]
    fn test_replace_updates_index() {
        let mut state = CollectionState::new(&[vec!["role".to_string()]]);
        state.insert(entity("a", "admin"));
        let old = state.replace(entity("a", "guest")).unwrap();
        assert_eq!(old.get("role"), Some(&json!("admin")));

        let role = state.indexes().find(&["role".to_string()]).unwrap();
        assert!(role.lookup(&[&json!("guest")]).unwrap().contains("a"));
    }

    #[test]
    fn test_seed_rejects_duplicates() {
        let result = CollectionState::seed(
            "users",
            &[],
            vec![entity("a", "admin"), entity("a", "member")],
        );
        assert!(matches!(result, Err(TetherError::DuplicateKey { .. })));
    }
}
