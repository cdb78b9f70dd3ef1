//! Collection declarations and their compiled, cross-checked form.
//!
//! A [`SchemaDefinition`] is what users write (YAML or code). [`Schema`] is the
//! validated view the engine works with: relationships have resolved foreign
//! keys, unique constraints have canonical names, and every collection knows
//! which other collections hold refs pointing at it.

mod parser;
mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use types::*;

use crate::error::{Result, TetherError};
use std::collections::{BTreeMap, HashMap};

/// A relationship with its foreign key resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: String,
    /// For `ref`: field on this collection. For `inverse`: field on `target`.
    pub foreign_key: String,
    pub on_delete: Option<OnDeletePolicy>,
}

/// A unique constraint normalized to a canonical field tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: String,
    pub fields: Vec<String>,
}

impl UniqueConstraint {
    pub fn new(fields: Vec<String>) -> Self {
        UniqueConstraint {
            name: format!("unique_{}", fields.join("_")),
            fields,
        }
    }
}

/// A ref relationship in some collection that points at a given target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub collection: String,
    pub relationship: String,
    pub foreign_key: String,
    pub on_delete: Option<OnDeletePolicy>,
}

/// Compiled declarations for one collection
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub name: String,
    pub definition: CollectionDefinition,
    pub relationships: BTreeMap<String, Relationship>,
    pub unique: Vec<UniqueConstraint>,
    pub indexes: Vec<Vec<String>>,
}

impl CollectionSchema {
    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    pub fn refs(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships
            .values()
            .filter(|r| r.kind == RelationshipKind::Ref)
    }

    pub fn inverses(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships
            .values()
            .filter(|r| r.kind == RelationshipKind::Inverse)
    }

    pub fn is_foreign_key(&self, field: &str) -> bool {
        self.refs().any(|r| r.foreign_key == field)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.definition.fields.get(name)
    }

    pub fn soft_delete(&self) -> bool {
        self.definition.soft_delete
    }

    pub fn auto_id(&self) -> AutoIdStrategy {
        self.definition
            .id
            .as_ref()
            .and_then(|c| c.auto)
            .unwrap_or_default()
    }
}

/// The compiled schema for a whole store
#[derive(Debug, Clone)]
pub struct Schema {
    collections: HashMap<String, CollectionSchema>,
    dependents: HashMap<String, Vec<Dependent>>,
}

impl Schema {
    /// Validate declarations and resolve relationships.
    pub fn compile(definition: SchemaDefinition) -> Result<Self> {
        let mut collections = HashMap::new();

        for (name, def) in &definition.collections {
            let mut relationships = BTreeMap::new();
            for (rel_name, rel) in &def.relationships {
                let target = definition.collections.get(&rel.target).ok_or_else(|| {
                    TetherError::Schema(format!(
                        "Relationship '{name}.{rel_name}' targets unknown collection '{}'",
                        rel.target
                    ))
                })?;

                let foreign_key = match (&rel.kind, &rel.foreign_key) {
                    (_, Some(fk)) => fk.clone(),
                    (RelationshipKind::Ref, None) => format!("{rel_name}Id"),
                    (RelationshipKind::Inverse, None) => {
                        infer_inverse_foreign_key(name, rel_name, &rel.target, target)?
                    }
                };

                let shadows_key = rel.kind == RelationshipKind::Ref && *rel_name == foreign_key;
                if def.fields.contains_key(rel_name) || shadows_key {
                    return Err(TetherError::Schema(format!(
                        "Relationship '{name}.{rel_name}' collides with a field of the same name"
                    )));
                }

                relationships.insert(
                    rel_name.clone(),
                    Relationship {
                        name: rel_name.clone(),
                        kind: rel.kind,
                        target: rel.target.clone(),
                        foreign_key,
                        on_delete: rel.on_delete,
                    },
                );
            }

            let mut unique = Vec::new();
            for spec in &def.unique {
                let fields = spec.fields();
                if fields.is_empty() {
                    return Err(TetherError::Schema(format!(
                        "Collection '{name}' declares an empty unique constraint"
                    )));
                }
                let constraint = UniqueConstraint::new(fields);
                if !unique.contains(&constraint) {
                    unique.push(constraint);
                }
            }

            let mut indexes = Vec::new();
            for spec in &def.indexes {
                let fields = spec.fields();
                if fields.is_empty() {
                    return Err(TetherError::Schema(format!(
                        "Collection '{name}' declares an empty index"
                    )));
                }
                if !indexes.contains(&fields) {
                    indexes.push(fields);
                }
            }

            collections.insert(
                name.clone(),
                CollectionSchema {
                    name: name.clone(),
                    definition: def.clone(),
                    relationships,
                    unique,
                    indexes,
                },
            );
        }

        let mut dependents: HashMap<String, Vec<Dependent>> = HashMap::new();
        for collection in collections.values() {
            for rel in collection.refs() {
                dependents
                    .entry(rel.target.clone())
                    .or_default()
                    .push(Dependent {
                        collection: collection.name.clone(),
                        relationship: rel.name.clone(),
                        foreign_key: rel.foreign_key.clone(),
                        on_delete: rel.on_delete,
                    });
            }
        }
        for list in dependents.values_mut() {
            list.sort_by(|a, b| {
                (&a.collection, &a.relationship).cmp(&(&b.collection, &b.relationship))
            });
        }

        Ok(Schema {
            collections,
            dependents,
        })
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(name)
            .ok_or_else(|| TetherError::CollectionNotFound(name.to_string()))
    }

    /// Collection names in sorted order
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ref relationships in any collection that point at `target`
    pub fn dependents_of(&self, target: &str) -> &[Dependent] {
        self.dependents
            .get(target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// An inverse without an explicit foreign key mirrors the single ref on the
/// target collection that points back at us.
fn infer_inverse_foreign_key(
    owner: &str,
    rel_name: &str,
    target_name: &str,
    target: &CollectionDefinition,
) -> Result<String> {
    let candidates: Vec<String> = target
        .relationships
        .iter()
        .filter(|(_, r)| r.kind == RelationshipKind::Ref && r.target == owner)
        .map(|(name, r)| r.foreign_key.clone().unwrap_or_else(|| format!("{name}Id")))
        .collect();

    match candidates.as_slice() {
        [fk] => Ok(fk.clone()),
        [] => Err(TetherError::Schema(format!(
            "Inverse relationship '{owner}.{rel_name}' needs a foreign_key: '{target_name}' has no ref back to '{owner}'"
        ))),
        _ => Err(TetherError::Schema(format!(
            "Inverse relationship '{owner}.{rel_name}' is ambiguous: '{target_name}' has several refs back to '{owner}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(yaml: &str) -> Result<Schema> {
        Schema::compile(parse_schema_str(yaml)?)
    }

    #[test]
    fn test_inverse_foreign_key_is_inferred() {
        let schema = compile(
            r#"
collections:
  users:
    relationships:
      posts: { type: inverse, target: posts }
  posts:
    relationships:
      author: { type: ref, target: users }
"#,
        )
        .unwrap();

        let users = schema.collection("users").unwrap();
        assert_eq!(users.relationship("posts").unwrap().foreign_key, "authorId");
        let posts = schema.collection("posts").unwrap();
        assert_eq!(posts.relationship("author").unwrap().foreign_key, "authorId");
        assert!(posts.is_foreign_key("authorId"));

        let deps = schema.dependents_of("users");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].collection, "posts");
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = compile(
            r#"
collections:
  posts:
    relationships:
      author: { type: ref, target: people }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, TetherError::Schema(_)));
    }

    #[test]
    fn test_ambiguous_inverse_rejected() {
        let err = compile(
            r#"
collections:
  users:
    relationships:
      messages: { type: inverse, target: messages }
  messages:
    relationships:
      sender: { type: ref, target: users }
      recipient: { type: ref, target: users }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_unique_constraint_names() {
        let schema = compile(
            r#"
collections:
  pages:
    unique: [slug, [tenantId, slug], slug]
"#,
        )
        .unwrap();
        let pages = schema.collection("pages").unwrap();
        let names: Vec<&str> = pages.unique.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["unique_slug", "unique_tenantId_slug"]);
    }

    #[test]
    fn test_missing_collection() {
        let schema = compile("collections: {}").unwrap();
        assert!(matches!(
            schema.collection("nope"),
            Err(TetherError::CollectionNotFound(_))
        ));
    }
}
