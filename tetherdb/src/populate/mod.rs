//! Relationship resolution.
//!
//! Relationships are id-keyed lookups into the dataset, resolved at populate
//! time. Recursion depth is exactly the depth of the caller's populate spec,
//! so a self-referential graph is walked only as far as it is asked to be.

use crate::entity::{Entity, ID};
use crate::error::{Result, TetherError};
use crate::filter::{matches, FilterContext};
use crate::query::{run_pipeline, QueryOptions};
use crate::schema::{CollectionSchema, RelationshipKind, Schema};
use crate::select::project;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum PopulateEntry {
    /// Resolve the relationship with default options
    Shallow,
    /// Resolve and apply nested where/sort/offset/limit/select/populate
    Nested(Box<QueryOptions>),
}

/// Relationships to resolve, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateSpec(Vec<(String, PopulateEntry)>);

impl PopulateSpec {
    pub fn new() -> Self {
        PopulateSpec::default()
    }

    pub fn with(mut self, relationship: impl Into<String>) -> Self {
        self.0.push((relationship.into(), PopulateEntry::Shallow));
        self
    }

    pub fn with_options(mut self, relationship: impl Into<String>, options: QueryOptions) -> Self {
        self.0
            .push((relationship.into(), PopulateEntry::Nested(Box::new(options))));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Accepts `["author"]` or `{"author": true, "posts": {"limit": 5}}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut spec = PopulateSpec::new();
        match value {
            Value::Array(items) => {
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        let message = format!("expected relationship name, got {item}");
                        TetherError::validation("<query>", "populate", message)
                    })?;
                    spec = spec.with(name);
                }
            }
            Value::Object(map) => {
                for (name, entry) in map {
                    match entry {
                        Value::Bool(true) => spec = spec.with(name.as_str()),
                        Value::Bool(false) => {}
                        Value::Object(_) => {
                            spec = spec.with_options(name.as_str(), QueryOptions::from_json(entry)?)
                        }
                        other => {
                            return Err(TetherError::validation(
                                "<query>",
                                format!("populate.{name}"),
                                format!("expected boolean or options object, got {other}"),
                            ))
                        }
                    }
                }
            }
            other => {
                return Err(TetherError::validation(
                    "<query>",
                    "populate",
                    format!("expected array or object, got {other}"),
                ))
            }
        }
        Ok(spec)
    }
}

impl<'de> Deserialize<'de> for PopulateSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        PopulateSpec::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Check every name in a populate spec, at every depth, is a declared relationship.
pub fn validate_spec(
    schema: &Schema,
    collection: &CollectionSchema,
    spec: &PopulateSpec,
) -> Result<()> {
    for (name, entry) in &spec.0 {
        let rel = collection.relationship(name).ok_or_else(|| {
            TetherError::validation(
                collection.name.as_str(),
                name.as_str(),
                format!("'{name}' is not a relationship of '{}'", collection.name),
            )
        })?;
        if let PopulateEntry::Nested(options) = entry {
            if let Some(nested) = &options.populate {
                validate_spec(schema, schema.collection(&rel.target)?, nested)?;
            }
        }
    }
    Ok(())
}

/// Resolve the relationships named in `spec` onto a copy of `entity`.
/// The populate spec must already have passed [`validate_spec`]; unknown names are skipped.
pub fn populate(
    entity: &Entity,
    collection: &CollectionSchema,
    spec: &PopulateSpec,
    ctx: &FilterContext<'_>,
) -> Entity {
    let mut out = entity.clone();
    for (name, entry) in &spec.0 {
        let Some(rel) = collection.relationship(name) else {
            continue;
        };
        let Ok(target) = ctx.schema.collection(&rel.target) else {
            continue;
        };
        let options = match entry {
            PopulateEntry::Shallow => None,
            PopulateEntry::Nested(options) => Some(options.as_ref()),
        };

        match rel.kind {
            RelationshipKind::Ref => {
                match resolve_ref(entity, &rel.foreign_key, target, options, ctx) {
                    Some(value) => {
                        out.insert(name.clone(), value);
                    }
                    None => {
                        out.remove(name);
                    }
                }
            }
            RelationshipKind::Inverse => {
                let related = resolve_inverse(entity, &rel.foreign_key, target, options, ctx);
                out.insert(name.clone(), Value::Array(related));
            }
        }
    }
    out
}

fn resolve_ref(
    entity: &Entity,
    foreign_key: &str,
    target: &CollectionSchema,
    options: Option<&QueryOptions>,
    ctx: &FilterContext<'_>,
) -> Option<Value> {
    let fk = entity.get(foreign_key)?.as_str()?;
    let related = ctx.dataset.get(&target.name, fk)?;

    let include_deleted = options.map(|o| o.include_deleted).unwrap_or(false);
    if related.is_deleted() && !include_deleted {
        return None;
    }

    let Some(options) = options else {
        return Some(related.clone().into_value());
    };

    if let Some(filter) = &options.filter {
        if !matches(related, filter, target, ctx) {
            return None;
        }
    }

    let mut resolved = match &options.populate {
        Some(nested) => populate(related, target, nested, ctx),
        None => related.clone(),
    };
    if let Some(selection) = &options.select {
        resolved = project(&resolved, selection);
    }
    Some(resolved.into_value())
}

fn resolve_inverse(
    entity: &Entity,
    foreign_key: &str,
    target: &CollectionSchema,
    options: Option<&QueryOptions>,
    ctx: &FilterContext<'_>,
) -> Vec<Value> {
    let Some(id) = entity.get(ID).and_then(Value::as_str) else {
        return Vec::new();
    };
    let Ok(state) = ctx.dataset.collection(&target.name) else {
        return Vec::new();
    };

    let candidates = state
        .iter()
        .filter(|e| e.get(foreign_key).and_then(Value::as_str) == Some(id))
        .cloned()
        .collect();

    let default_options = QueryOptions::default();
    let options = options.unwrap_or(&default_options);
    run_pipeline(candidates, target, options, ctx)
        .into_iter()
        .map(Entity::into_value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        schema: Schema,
        dataset: Dataset,
    }

    impl Fixture {
        fn new() -> Self {
            let schema = Schema::compile(
                parse_schema_str(
                    r#"
collections:
  users:
    relationships:
      posts: { type: inverse, target: posts }
      manager: { type: ref, target: users }
  posts:
    relationships:
      author: { type: ref, target: users }
"#,
                )
                .unwrap(),
            )
            .unwrap();
            let mut dataset = Dataset::for_schema(&schema).unwrap();
            let users = dataset.collection_mut("users").unwrap();
            for user in [
                json!({"id": "u1", "name": "Ada"}),
                json!({"id": "u2", "name": "Bob", "managerId": "u1"}),
                json!({"id": "u3", "name": "Cy", "managerId": "ghost"}),
            ] {
                users.insert(Entity::from_value("users", user).unwrap());
            }
            let posts = dataset.collection_mut("posts").unwrap();
            for post in [
                json!({"id": "p1", "title": "B", "authorId": "u1", "views": 1}),
                json!({"id": "p2", "title": "A", "authorId": "u1", "views": 7}),
                json!({
                    "id": "p3",
                    "title": "C",
                    "authorId": "u1",
                    "views": 3,
                    "deletedAt": "2026-01-01T00:00:00.000Z"
                }),
                json!({"id": "p4", "title": "D", "authorId": "u2", "views": 2}),
            ] {
                posts.insert(Entity::from_value("posts", post).unwrap());
            }
            Fixture { schema, dataset }
        }

        fn populate(&self, collection: &str, id: &str, spec: Value) -> Value {
            let spec = PopulateSpec::from_json(&spec).unwrap();
            let schema = self.schema.collection(collection).unwrap();
            validate_spec(&self.schema, schema, &spec).unwrap();
            let entity = self.dataset.get(collection, id).unwrap();
            let ctx = FilterContext::new(&self.schema, &self.dataset);
            populate(entity, schema, &spec, &ctx).into_value()
        }
    }

    #[test]
    fn test_ref_populate_reproduces_foreign_key() {
        let f = Fixture::new();
        let post = f.populate("posts", "p4", json!(["author"]));
        assert_eq!(post["author"]["id"], post["authorId"]);
        assert_eq!(post["author"]["name"], json!("Bob"));
    }

    #[test]
    fn test_dangling_ref_is_omitted() {
        let f = Fixture::new();
        let user = f.populate("users", "u3", json!({"manager": true}));
        assert!(user.get("manager").is_none());
        let user = f.populate("users", "u1", json!({"manager": true}));
        assert!(user.get("manager").is_none());
    }

    #[test]
    fn test_inverse_populate_skips_soft_deleted() {
        let f = Fixture::new();
        let user = f.populate("users", "u1", json!({"posts": true}));
        let ids: Vec<&str> = user["posts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["p1", "p2"]);

        let lonely = f.populate("users", "u3", json!({"posts": true}));
        assert_eq!(lonely["posts"], json!([]));
    }

    #[test]
    fn test_nested_options_on_inverse() {
        let f = Fixture::new();
        let user = f.populate(
            "users",
            "u1",
            json!({"posts": {
                "where": {"views": {"$gt": 0}},
                "sort": {"title": "asc"},
                "limit": 1,
                "select": ["title"]
            }}),
        );
        assert_eq!(user["posts"], json!([{"title": "A"}]));
    }

    #[test]
    fn test_recursion_follows_spec_depth() {
        let f = Fixture::new();
        let post = f.populate(
            "posts",
            "p4",
            json!({
                "author": {"populate": {"manager": {"populate": {"posts": {"select": ["id"]}}}}}
            }),
        );
        assert_eq!(post["author"]["manager"]["name"], json!("Ada"));
        assert_eq!(
            post["author"]["manager"]["posts"],
            json!([{"id": "p1"}, {"id": "p2"}])
        );
        // one level deeper was never requested
        assert!(post["author"]["manager"].get("manager").is_none());
        assert!(post["author"].get("posts").is_none());
    }

    #[test]
    fn test_ref_with_non_matching_where_is_omitted() {
        let f = Fixture::new();
        let post = f.populate("posts", "p4", json!({"author": {"where": {"name": "Ada"}}}));
        assert!(post.get("author").is_none());
    }

    #[test]
    fn test_unknown_relationship_rejected() {
        let f = Fixture::new();
        let spec = PopulateSpec::from_json(&json!(["comments"])).unwrap();
        let schema = f.schema.collection("posts").unwrap();
        let err = validate_spec(&f.schema, schema, &spec).unwrap_err();
        assert!(matches!(err, TetherError::Validation { .. }));
    }
}
