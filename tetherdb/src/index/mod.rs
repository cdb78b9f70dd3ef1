//! Secondary indexes over declared (possibly compound) field tuples.
//!
//! Each index maps the canonical key of an entity's tuple to the set of ids
//! holding that tuple. Entities with any null or missing component are left
//! out. The CRUD engine keeps indexes in step with every insert, update and
//! hard delete; queries use them only to narrow candidates, so a missing index
//! never changes results.

use crate::entity::{canonical_key, Entity};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct Index {
    fields: Vec<String>,
    entries: HashMap<String, HashSet<String>>,
}

impl Index {
    pub fn new(fields: Vec<String>) -> Self {
        Index {
            fields,
            entries: HashMap::new(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn key_for(&self, entity: &Entity) -> Option<String> {
        let values: Vec<Option<&Value>> = self.fields.iter().map(|f| entity.get(f)).collect();
        canonical_key(&values)
    }

    pub fn insert(&mut self, entity: &Entity) {
        let (Some(id), Some(key)) = (entity.id(), self.key_for(entity)) else {
            return;
        };
        self.entries.entry(key).or_default().insert(id.to_string());
    }

    pub fn remove(&mut self, entity: &Entity) {
        let (Some(id), Some(key)) = (entity.id(), self.key_for(entity)) else {
            return;
        };
        if let Some(ids) = self.entries.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Ids whose tuple equals `values` (given in index field order).
    pub fn lookup(&self, values: &[&Value]) -> Option<&HashSet<String>> {
        let values: Vec<Option<&Value>> = values.iter().map(|v| Some(*v)).collect();
        let key = canonical_key(&values)?;
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All indexes declared for one collection
#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: Vec<Index>,
}

impl IndexManager {
    pub fn new(specs: &[Vec<String>]) -> Self {
        IndexManager {
            indexes: specs.iter().cloned().map(Index::new).collect(),
        }
    }

    /// Build indexes from scratch over existing entities.
    pub fn build<'a>(
        specs: &[Vec<String>],
        entities: impl IntoIterator<Item = &'a Entity>,
    ) -> Self {
        let mut manager = IndexManager::new(specs);
        for entity in entities {
            manager.on_insert(entity);
        }
        manager
    }

    pub fn on_insert(&mut self, entity: &Entity) {
        for index in &mut self.indexes {
            index.insert(entity);
        }
    }

    pub fn on_remove(&mut self, entity: &Entity) {
        for index in &mut self.indexes {
            index.remove(entity);
        }
    }

    pub fn on_update(&mut self, old: &Entity, new: &Entity) {
        for index in &mut self.indexes {
            index.remove(old);
            index.insert(new);
        }
    }

    /// The index declared over exactly these fields, if any.
    pub fn find(&self, fields: &[String]) -> Option<&Index> {
        self.indexes.iter().find(|i| i.fields == fields)
    }

    /// Narrow candidates using equality predicates. Picks the index covering
    /// the most predicate fields; `None` when no index applies.
    pub fn candidates(&self, equalities: &BTreeMap<String, Value>) -> Option<HashSet<String>> {
        let index = self
            .indexes
            .iter()
            .filter(|i| i.fields.iter().all(|f| equalities.contains_key(f)))
            .max_by_key(|i| i.fields.len())?;

        let values: Vec<&Value> = index
            .fields
            .iter()
            .filter_map(|f| equalities.get(f))
            .collect();

        if values.iter().any(|v| v.is_null()) {
            return None;
        }

        log::debug!("index fast path on {:?}", index.fields);
        Some(index.lookup(&values).cloned().unwrap_or_default())
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        Entity::from_value("test", value).unwrap()
    }

    fn specs() -> Vec<Vec<String>> {
        vec![
            vec!["role".to_string()],
            vec!["tenantId".to_string(), "slug".to_string()],
        ]
    }

    #[test]
    fn test_insert_and_lookup() {
        let a = entity(json!({"id": "a", "role": "admin", "tenantId": "t1", "slug": "x"}));
        let b = entity(json!({"id": "b", "role": "admin"}));
        let manager = IndexManager::build(&specs(), [&a, &b]);

        let role = manager.find(&["role".to_string()]).unwrap();
        let ids = role.lookup(&[&json!("admin")]).unwrap();
        assert_eq!(ids.len(), 2);

        let compound = manager
            .find(&["tenantId".to_string(), "slug".to_string()])
            .unwrap();
        // b has no tenantId/slug so it contributes no entry
        assert_eq!(compound.len(), 1);
        assert!(compound.lookup(&[&json!("t1"), &json!("x")]).unwrap().contains("a"));
    }

    #[test]
    fn test_update_moves_entry() {
        let old = entity(json!({"id": "a", "role": "admin"}));
        let new = entity(json!({"id": "a", "role": "member"}));
        let mut manager = IndexManager::build(&specs(), [&old]);
        manager.on_update(&old, &new);

        let role = manager.find(&["role".to_string()]).unwrap();
        assert!(role.lookup(&[&json!("admin")]).is_none());
        assert!(role.lookup(&[&json!("member")]).unwrap().contains("a"));
    }

    #[test]
    fn test_remove_and_null_components() {
        let a = entity(json!({"id": "a", "role": null}));
        let b = entity(json!({"id": "b", "role": "guest"}));
        let mut manager = IndexManager::build(&specs(), [&a, &b]);
        assert_eq!(manager.find(&["role".to_string()]).unwrap().len(), 1);

        manager.on_remove(&b);
        assert!(manager.find(&["role".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_candidates_prefers_widest_index() {
        let a = entity(json!({"id": "a", "role": "admin", "tenantId": "t1", "slug": "x"}));
        let b = entity(json!({"id": "b", "role": "admin", "tenantId": "t1", "slug": "y"}));
        let manager = IndexManager::build(&specs(), [&a, &b]);

        let mut eq = BTreeMap::new();
        eq.insert("tenantId".to_string(), json!("t1"));
        eq.insert("slug".to_string(), json!("y"));
        let ids = manager.candidates(&eq).unwrap();
        assert_eq!(ids, HashSet::from(["b".to_string()]));

        let mut unindexed = BTreeMap::new();
        unindexed.insert("name".to_string(), json!("x"));
        assert!(manager.candidates(&unindexed).is_none());
    }
}
