// Entity model - a field map with an id and implicit timestamps

mod value;

pub use value::{canonical_key, compare_values, is_missing, kind_name, values_equal};

use crate::error::{Result, TetherError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ID: &str = "id";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const DELETED_AT: &str = "deletedAt";

/// Fields that can never be patched after creation
pub const IMMUTABLE_FIELDS: [&str; 2] = [ID, CREATED_AT];

/// A stored record: a field-name to JSON value mapping with a string `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    pub fn new() -> Self {
        Entity(Map::new())
    }

    /// Build an entity from a JSON object. Anything else is rejected.
    pub fn from_value(collection: &str, value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Entity(map)),
            other => Err(TetherError::validation(
                collection,
                "<root>",
                format!("expected object, got {}", kind_name(&other)),
            )),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID).and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Resolve a dotted path (`author.name`) through nested objects.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_deleted(&self) -> bool {
        !is_missing(self.0.get(DELETED_AT))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(CREATED_AT)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(UPDATED_AT)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(DELETED_AT)
    }

    fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        let raw = self.0.get(field)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Deserialize the entity into a typed document.
    pub fn to_document<T: DeserializeOwned>(&self) -> Result<Document<T>> {
        let data: T = serde_json::from_value(Value::Object(self.0.clone()))?;
        Ok(Document {
            id: self.id().unwrap_or_default().to_string(),
            created_at: self.created_at(),
            updated_at: self.updated_at(),
            deleted_at: self.deleted_at(),
            data,
        })
    }
}

impl From<Map<String, Value>> for Entity {
    fn from(map: Map<String, Value>) -> Self {
        Entity(map)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        entity.into_value()
    }
}

/// A loaded entity with implicit fields and typed data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document<T> {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub data: T,
}

/// Current time as an RFC 3339 UTC string with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
