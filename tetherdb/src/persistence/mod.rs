//! Persistence collaborators.
//!
//! The store calls [`Persistence::save`] after every committed mutation of a
//! collection declared with `persist: true`, and [`Persistence::load`] once per
//! such collection when it is built. What happens in between (batching,
//! debouncing, I/O) belongs to the collaborator.

use crate::error::{Result, TetherError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait Persistence: Send + Sync {
    /// Store the full encoded contents of a collection.
    fn save(&self, collection: &str, entities: Vec<Value>) -> Result<()>;

    /// Previously saved contents, or `None` if nothing was ever saved.
    fn load(&self, collection: &str) -> Result<Option<Vec<Value>>>;
}

/// Keeps saved collections in memory and counts saves.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    saves: Mutex<HashMap<String, usize>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        MemoryPersistence::default()
    }

    /// Pre-populate a collection so the store seeds from it.
    pub fn with_collection(self, collection: &str, entities: Vec<Value>) -> Self {
        self.collections.lock().insert(collection.to_string(), entities);
        self
    }

    pub fn saved(&self, collection: &str) -> Option<Vec<Value>> {
        self.collections.lock().get(collection).cloned()
    }

    pub fn save_count(&self, collection: &str) -> usize {
        self.saves.lock().get(collection).copied().unwrap_or(0)
    }
}

impl Persistence for MemoryPersistence {
    fn save(&self, collection: &str, entities: Vec<Value>) -> Result<()> {
        self.collections.lock().insert(collection.to_string(), entities);
        *self.saves.lock().entry(collection.to_string()).or_default() += 1;
        Ok(())
    }

    fn load(&self, collection: &str) -> Result<Option<Vec<Value>>> {
        Ok(self.collections.lock().get(collection).cloned())
    }
}

/// One pretty-printed `<collection>.json` array per collection in a directory.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    /// Use `dir` for collection files, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(JsonFilePersistence { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }
}

impl Persistence for JsonFilePersistence {
    fn save(&self, collection: &str, entities: Vec<Value>) -> Result<()> {
        let body = serde_json::to_vec_pretty(&Value::Array(entities))?;

        // Write then rename so readers never see a partial file
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&body)?;
        temp.as_file().sync_all()?;
        temp.persist(self.path_for(collection)).map_err(|e| e.error)?;

        log::debug!("saved {} to {}", collection, self.dir.display());
        Ok(())
    }

    fn load(&self, collection: &str) -> Result<Option<Vec<Value>>> {
        let path = self.path_for(collection);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Array(items) => Ok(Some(items)),
            other => Err(TetherError::Operation(format!(
                "{} does not hold a JSON array (found {})",
                path.display(),
                crate::entity::kind_name(&other)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_memory_save_and_load() {
        let persistence = MemoryPersistence::new();
        assert_eq!(persistence.load("users").unwrap(), None);

        persistence.save("users", vec![json!({"id": "u1"})]).unwrap();
        persistence.save("users", vec![json!({"id": "u1"}), json!({"id": "u2"})]).unwrap();

        assert_eq!(persistence.save_count("users"), 2);
        assert_eq!(persistence.load("users").unwrap().unwrap().len(), 2);
        assert_eq!(persistence.save_count("posts"), 0);
    }

    #[test]
    fn test_json_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let persistence = JsonFilePersistence::open(tmp.path().join("data")).unwrap();

        assert_eq!(persistence.load("users").unwrap(), None);
        let entities = vec![json!({"id": "u1", "name": "Ada"}), json!({"id": "u2", "name": "Bob"})];
        persistence.save("users", entities.clone()).unwrap();

        assert!(tmp.path().join("data/users.json").exists());
        assert_eq!(persistence.load("users").unwrap(), Some(entities));

        // only the collection file remains, no temp files
        let files: Vec<_> = std::fs::read_dir(persistence.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_json_file_rejects_non_array() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("users.json"), "{\"id\": 1}").unwrap();
        let persistence = JsonFilePersistence::open(tmp.path()).unwrap();
        assert!(matches!(
            persistence.load("users").unwrap_err(),
            TetherError::Operation(_)
        ));
    }
}
