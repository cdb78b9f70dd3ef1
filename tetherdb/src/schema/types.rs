use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Top-level schema definition, usually parsed from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub collections: HashMap<String, CollectionDefinition>,
}

/// Definition of a single collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDefinition {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipDefinition>,
    #[serde(default)]
    pub unique: Vec<FieldSet>,
    #[serde(default)]
    pub indexes: Vec<FieldSet>,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub persist: bool,
    #[serde(default = "default_true")]
    pub additional_properties: bool,
    #[serde(default = "default_true")]
    pub strict: bool,
    #[serde(default)]
    pub id: Option<IdConfig>,
}

impl Default for CollectionDefinition {
    fn default() -> Self {
        CollectionDefinition {
            fields: BTreeMap::new(),
            relationships: BTreeMap::new(),
            unique: Vec::new(),
            indexes: Vec::new(),
            soft_delete: false,
            persist: false,
            additional_properties: true,
            strict: true,
            id: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Configuration for entity ID generation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdConfig {
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    #[default]
    Uuid,
    Ulid,
    Nanoid,
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub items: Option<FieldType>,
}

impl FieldDefinition {
    pub fn of(field_type: FieldType) -> Self {
        FieldDefinition {
            field_type,
            required: false,
            enum_values: None,
            default: None,
            items: None,
        }
    }
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Datetime,
    List,
    Object,
}

/// A declared relationship from one collection to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    #[serde(rename = "type")]
    pub kind: RelationshipKind,
    pub target: String,
    #[serde(default)]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub on_delete: Option<OnDeletePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Ref,
    Inverse,
}

/// What happens to dependents when the entity they reference is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDeletePolicy {
    Cascade,
    #[serde(alias = "error")]
    Restrict,
    #[serde(alias = "nullify")]
    SetNull,
}

/// A single field or a compound tuple of fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSet {
    Single(String),
    Compound(Vec<String>),
}

impl FieldSet {
    pub fn fields(&self) -> Vec<String> {
        match self {
            FieldSet::Single(f) => vec![f.clone()],
            FieldSet::Compound(fs) => fs.clone(),
        }
    }
}
