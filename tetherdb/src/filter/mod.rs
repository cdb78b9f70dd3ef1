//! Where-clause evaluation.
//!
//! Clauses arrive as JSON (`{"age": {"$gte": 18}, "$or": [...]}`) and are
//! parsed once into a [`Filter`] tree. Parsing never fails: anything the
//! parser does not understand becomes a condition that matches nothing, so
//! unknown operators and malformed clauses fail closed at evaluation time.

use crate::dataset::Dataset;
use crate::entity::{compare_values, is_missing, values_equal, Entity};
use crate::schema::{CollectionSchema, RelationshipKind, Schema};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Field { path: String, condition: Condition },
    /// Matches nothing. Produced for malformed clauses.
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Operators on one field, ANDed together
    Ops(Vec<Op>),
    /// A clause evaluated against a ref target or a nested object
    Nested(Box<Filter>),
    /// `$some` / `$every` / `$none` over an inverse relationship or array of objects
    Quantified(Quantifier, Box<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Some,
    Every,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Contains(Value),
    StartsWith(String),
    EndsWith(String),
    All(Vec<Value>),
    Size(usize),
    Unknown(String),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::And(Vec::new())
    }
}

impl Filter {
    /// A filter that matches every entity.
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::op(path, Op::Eq(value.into()))
    }

    pub fn op(path: impl Into<String>, op: Op) -> Self {
        Filter::Field {
            path: path.into(),
            condition: Condition::Ops(vec![op]),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Negation of `filter`. A malformed filter stays closed instead of
    /// inverting into a match-everything clause.
    pub fn negate(filter: Filter) -> Self {
        if filter.fails_closed() {
            Filter::Never
        } else {
            Filter::Not(Box::new(filter))
        }
    }

    /// Whether any part of the tree is a malformed clause or unknown operator.
    pub fn fails_closed(&self) -> bool {
        match self {
            Filter::Never => true,
            Filter::And(parts) | Filter::Or(parts) => parts.iter().any(Filter::fails_closed),
            Filter::Not(inner) => inner.fails_closed(),
            Filter::Field { condition, .. } => match condition {
                Condition::Ops(ops) => ops.iter().any(|op| matches!(op, Op::Unknown(_))),
                Condition::Nested(inner) | Condition::Quantified(_, inner) => inner.fails_closed(),
            },
        }
    }

    /// Parse a JSON where-clause.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => parse_clause(map),
            _ => Filter::Never,
        }
    }

    /// Top-level scalar equalities that every match must satisfy. Used to
    /// narrow candidates through an index.
    pub fn required_equalities(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        collect_equalities(self, &mut out);
        out
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Filter::from_json(&value))
    }
}

fn parse_clause(map: &Map<String, Value>) -> Filter {
    let mut parts = Vec::with_capacity(map.len());
    for (key, value) in map {
        let part = match key.as_str() {
            "$and" => parse_list(value).map(Filter::And).unwrap_or(Filter::Never),
            "$or" => parse_list(value).map(Filter::Or).unwrap_or(Filter::Never),
            "$not" => match value {
                Value::Object(inner) => Filter::negate(parse_clause(inner)),
                _ => Filter::Never,
            },
            k if k.starts_with('$') => Filter::Never,
            path => parse_field(path, value),
        };
        parts.push(part);
    }
    if parts.len() == 1 {
        parts.pop().unwrap_or_default()
    } else {
        Filter::And(parts)
    }
}

fn parse_list(value: &Value) -> Option<Vec<Filter>> {
    Some(value.as_array()?.iter().map(Filter::from_json).collect())
}

fn parse_field(path: &str, value: &Value) -> Filter {
    let field = |condition| Filter::Field {
        path: path.to_string(),
        condition,
    };

    let Value::Object(map) = value else {
        return field(Condition::Ops(vec![Op::Eq(value.clone())]));
    };

    let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        return field(Condition::Nested(Box::new(parse_clause(map))));
    }
    if operator_keys != map.len() {
        return Filter::Never;
    }

    let quantifier = |key: &str| match key {
        "$some" => Some(Quantifier::Some),
        "$every" => Some(Quantifier::Every),
        "$none" => Some(Quantifier::None),
        _ => None,
    };

    if map.keys().all(|k| quantifier(k).is_some()) {
        let mut parts: Vec<Filter> = map
            .iter()
            .filter_map(|(k, v)| {
                let q = quantifier(k)?;
                let inner = Filter::from_json(v);
                if inner.fails_closed() {
                    return Some(Filter::Never);
                }
                Some(field(Condition::Quantified(q, Box::new(inner))))
            })
            .collect();
        return if parts.len() == 1 {
            parts.pop().unwrap_or(Filter::Never)
        } else {
            Filter::And(parts)
        };
    }

    field(Condition::Ops(map.iter().map(|(k, v)| parse_op(k, v)).collect()))
}

fn parse_op(key: &str, value: &Value) -> Op {
    let list = |v: &Value| v.as_array().cloned();
    match key {
        "$eq" => Op::Eq(value.clone()),
        "$ne" => Op::Ne(value.clone()),
        "$gt" => Op::Gt(value.clone()),
        "$gte" => Op::Gte(value.clone()),
        "$lt" => Op::Lt(value.clone()),
        "$lte" => Op::Lte(value.clone()),
        "$in" => list(value).map(Op::In).unwrap_or_else(|| Op::Unknown(key.into())),
        "$nin" => list(value).map(Op::Nin).unwrap_or_else(|| Op::Unknown(key.into())),
        "$all" => list(value).map(Op::All).unwrap_or_else(|| Op::Unknown(key.into())),
        "$contains" => Op::Contains(value.clone()),
        "$startsWith" => match value.as_str() {
            Some(s) => Op::StartsWith(s.to_string()),
            None => Op::Unknown(key.into()),
        },
        "$endsWith" => match value.as_str() {
            Some(s) => Op::EndsWith(s.to_string()),
            None => Op::Unknown(key.into()),
        },
        "$size" => match value.as_u64() {
            Some(n) => Op::Size(n as usize),
            None => Op::Unknown(key.into()),
        },
        other => Op::Unknown(other.to_string()),
    }
}

fn collect_equalities(filter: &Filter, out: &mut BTreeMap<String, Value>) {
    match filter {
        Filter::And(parts) => {
            for part in parts {
                collect_equalities(part, out);
            }
        }
        Filter::Field {
            path,
            condition: Condition::Ops(ops),
        } if !path.contains('.') => {
            for op in ops {
                if let Op::Eq(v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) = op {
                    out.insert(path.clone(), v.clone());
                }
            }
        }
        _ => {}
    }
}

// ── Evaluation ─────────────────────────────────────────────────

/// Read-only view used to resolve relationships while filtering.
#[derive(Clone, Copy)]
pub struct FilterContext<'a> {
    pub schema: &'a Schema,
    pub dataset: &'a Dataset,
}

impl<'a> FilterContext<'a> {
    pub fn new(schema: &'a Schema, dataset: &'a Dataset) -> Self {
        FilterContext { schema, dataset }
    }
}

/// Does `entity` (a member of `collection`) satisfy `filter`?
pub fn matches(
    entity: &Entity,
    filter: &Filter,
    collection: &CollectionSchema,
    ctx: &FilterContext<'_>,
) -> bool {
    eval(entity.as_map(), filter, Some(collection), ctx)
}

fn eval(
    record: &Map<String, Value>,
    filter: &Filter,
    collection: Option<&CollectionSchema>,
    ctx: &FilterContext<'_>,
) -> bool {
    match filter {
        Filter::And(parts) => parts.iter().all(|f| eval(record, f, collection, ctx)),
        Filter::Or(parts) => parts.iter().any(|f| eval(record, f, collection, ctx)),
        Filter::Not(inner) => !eval(record, inner, collection, ctx),
        Filter::Never => false,
        Filter::Field { path, condition } => {
            let relationship = collection.and_then(|c| c.relationship(path));
            match relationship {
                Some(rel) => eval_relationship(
                    record,
                    rel.kind,
                    &rel.target,
                    &rel.foreign_key,
                    condition,
                    ctx,
                ),
                None => eval_field(lookup_path(record, path), condition, ctx),
            }
        }
    }
}

fn lookup_path<'v>(record: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn eval_relationship(
    record: &Map<String, Value>,
    kind: RelationshipKind,
    target: &str,
    foreign_key: &str,
    condition: &Condition,
    ctx: &FilterContext<'_>,
) -> bool {
    let Ok(target_schema) = ctx.schema.collection(target) else {
        return false;
    };
    let Ok(target_state) = ctx.dataset.collection(target) else {
        return false;
    };

    match (kind, condition) {
        (RelationshipKind::Ref, Condition::Nested(inner)) => {
            let Some(fk) = record.get(foreign_key).and_then(Value::as_str) else {
                return false;
            };
            match target_state.get(fk) {
                Some(related) if !related.is_deleted() => {
                    eval(related.as_map(), inner, Some(target_schema), ctx)
                }
                _ => false,
            }
        }
        (RelationshipKind::Inverse, Condition::Quantified(q, inner)) => {
            let Some(id) = record.get("id").and_then(Value::as_str) else {
                return false;
            };
            let mut related = target_state.iter().filter(|e| {
                !e.is_deleted() && e.get(foreign_key).and_then(Value::as_str) == Some(id)
            });
            let check = |e: &Entity| eval(e.as_map(), inner, Some(target_schema), ctx);
            match q {
                Quantifier::Some => related.any(check),
                Quantifier::Every => related.all(check),
                Quantifier::None => !related.any(check),
            }
        }
        _ => false,
    }
}

fn eval_field(value: Option<&Value>, condition: &Condition, ctx: &FilterContext<'_>) -> bool {
    match condition {
        Condition::Ops(ops) => ops.iter().all(|op| eval_op(value, op)),
        Condition::Nested(inner) => match value {
            Some(Value::Object(map)) => eval(map, inner, None, ctx),
            _ => false,
        },
        Condition::Quantified(q, inner) => {
            let Some(Value::Array(items)) = value else {
                return false;
            };
            let check = |item: &Value| match item {
                Value::Object(map) => eval(map, inner, None, ctx),
                _ => false,
            };
            match q {
                Quantifier::Some => items.iter().any(check),
                Quantifier::Every => items.iter().all(check),
                Quantifier::None => !items.iter().any(check),
            }
        }
    }
}

fn eval_op(value: Option<&Value>, op: &Op) -> bool {
    if is_missing(value) {
        return matches!(op, Op::Eq(Value::Null));
    }
    let Some(value) = value else {
        return false;
    };

    match op {
        Op::Eq(expected) => values_equal(value, expected),
        Op::Ne(expected) => !values_equal(value, expected),
        Op::Gt(bound) => ordered(value, bound).map(Ordering::is_gt).unwrap_or(false),
        Op::Gte(bound) => ordered(value, bound).map(Ordering::is_ge).unwrap_or(false),
        Op::Lt(bound) => ordered(value, bound).map(Ordering::is_lt).unwrap_or(false),
        Op::Lte(bound) => ordered(value, bound).map(Ordering::is_le).unwrap_or(false),
        Op::In(options) => options.iter().any(|o| values_equal(value, o)),
        Op::Nin(options) => !options.iter().any(|o| values_equal(value, o)),
        Op::Contains(needle) => match (value, needle) {
            (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
            (Value::Array(items), n) => items.iter().any(|i| values_equal(i, n)),
            _ => false,
        },
        Op::StartsWith(prefix) => value
            .as_str()
            .map(|s| s.starts_with(prefix.as_str()))
            .unwrap_or(false),
        Op::EndsWith(suffix) => value
            .as_str()
            .map(|s| s.ends_with(suffix.as_str()))
            .unwrap_or(false),
        Op::All(required) => match value {
            Value::Array(items) => required
                .iter()
                .all(|r| items.iter().any(|i| values_equal(i, r))),
            _ => false,
        },
        Op::Size(n) => value.as_array().map(|a| a.len() == *n).unwrap_or(false),
        Op::Unknown(_) => false,
    }
}

/// Range comparison only between two numbers or two strings.
fn ordered(value: &Value, bound: &Value) -> Option<Ordering> {
    match (value, bound) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            Some(compare_values(value, bound))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
  posts:
    relationships:
      author: { type: ref, target: users }
"#,
                )
                .unwrap(),
            )
            .unwrap();
            let mut dataset = Dataset::for_schema(&schema).unwrap();
            {
                let users = dataset.collection_mut("users").unwrap();
                for user in [
                    json!({
                        "id": "u1",
                        "name": "Ada",
                        "age": 36,
                        "admin": true,
                        "tags": ["math", "code"]
                    }),
                    json!({"id": "u2", "name": "Bob", "age": 25, "admin": false, "tags": []}),
                    json!({"id": "u3", "name": "Cy", "address": {"city": "Paris"}}),
                ] {
                    users.insert(Entity::from_value("users", user).unwrap());
                }
            }
            {
                let posts = dataset.collection_mut("posts").unwrap();
                for post in [
                    json!({"id": "p1", "title": "Engines", "authorId": "u1", "views": 10}),
                    json!({"id": "p2", "title": "Notes", "authorId": "u1", "views": 300}),
                    json!({"id": "p3", "title": "Hello", "authorId": "u2", "views": 5}),
                    json!({"id": "p4", "title": "Orphan", "authorId": "gone"}),
                ] {
                    posts.insert(Entity::from_value("posts", post).unwrap());
                }
            }
            Fixture { schema, dataset }
        }

        fn ids(&self, collection: &str, clause: Value) -> Vec<String> {
            let filter = Filter::from_json(&clause);
            let ctx = FilterContext::new(&self.schema, &self.dataset);
            let schema = self.schema.collection(collection).unwrap();
            self.dataset
                .collection(collection)
                .unwrap()
                .iter()
                .filter(|e| matches(e, &filter, schema, &ctx))
                .map(|e| e.id().unwrap().to_string())
                .collect()
        }
    }

    #[test]
    fn test_empty_and_or() {
        let f = Fixture::new();
        assert_eq!(f.ids("users", json!({"$and": []})).len(), 3);
        assert!(f.ids("users", json!({"$or": []})).is_empty());
        assert_eq!(f.ids("users", json!({})).len(), 3);
    }

    #[test]
    fn test_literal_and_operators() {
        let f = Fixture::new();
        assert_eq!(f.ids("users", json!({"name": "Bob"})), vec!["u2"]);
        assert_eq!(f.ids("users", json!({"age": {"$gte": 25, "$lt": 36}})), vec!["u2"]);
        assert_eq!(f.ids("users", json!({"name": {"$in": ["Ada", "Cy"]}})), vec!["u1", "u3"]);
        assert_eq!(f.ids("users", json!({"name": {"$nin": ["Ada"]}})), vec!["u2", "u3"]);
        assert_eq!(f.ids("users", json!({"name": {"$startsWith": "A"}})), vec!["u1"]);
        assert_eq!(f.ids("users", json!({"name": {"$endsWith": "b"}})), vec!["u2"]);
        assert_eq!(f.ids("users", json!({"name": {"$contains": "d"}})), vec!["u1"]);
        assert_eq!(f.ids("users", json!({"admin": {"$ne": true}})), vec!["u2"]);
        assert_eq!(f.ids("users", json!({"age": 36.0})), vec!["u1"]);
    }

    #[test]
    fn test_array_operators() {
        let f = Fixture::new();
        assert_eq!(f.ids("users", json!({"tags": {"$contains": "code"}})), vec!["u1"]);
        assert_eq!(f.ids("users", json!({"tags": {"$all": ["code", "math"]}})), vec!["u1"]);
        assert_eq!(f.ids("users", json!({"tags": {"$size": 0}})), vec!["u2"]);
    }

    #[test]
    fn test_missing_fields_and_unknown_operators_fail_closed() {
        let f = Fixture::new();
        assert!(f.ids("users", json!({"nickname": "x"})).is_empty());
        assert_eq!(f.ids("users", json!({"age": null})), vec!["u3"]);
        assert!(f.ids("users", json!({"age": {"$ne": 1}})).iter().all(|id| id != "u3"));
        assert!(f.ids("users", json!({"age": {"$regex": ".*"}})).is_empty());
        assert!(f.ids("users", json!({"$xor": []})).is_empty());
        assert!(f.ids("users", json!({"age": {"$gt": "10"}})).is_empty());
        assert!(f.ids("users", json!({"$not": {"age": {"$bogus": 1}}})).is_empty());
        assert!(f.ids("users", json!({"$not": {"$xor": []}})).is_empty());
        assert!(f.ids("users", json!({"$not": {"$not": {"age": {"$bogus": 1}}}})).is_empty());
        assert!(f
            .ids("users", json!({"posts": {"$none": {"views": {"$bogus": 1}}}}))
            .is_empty());
        assert!(f
            .ids("users", json!({"posts": {"$every": {"views": {"$bogus": 1}}}}))
            .is_empty());
        assert_eq!(Filter::negate(Filter::op("age", Op::Unknown("$bogus".into()))), Filter::Never);
    }

    #[test]
    fn test_not_and_nested_object() {
        let f = Fixture::new();
        assert_eq!(f.ids("users", json!({"$not": {"name": "Ada"}})), vec!["u2", "u3"]);
        assert_eq!(f.ids("users", json!({"address": {"city": "Paris"}})), vec!["u3"]);
        assert_eq!(f.ids("users", json!({"address.city": {"$startsWith": "Pa"}})), vec!["u3"]);
    }

    #[test]
    fn test_ref_relationship_clause() {
        let f = Fixture::new();
        assert_eq!(f.ids("posts", json!({"author": {"name": "Ada"}})), vec!["p1", "p2"]);
        // dangling FK never matches, even an always-true clause
        assert_eq!(f.ids("posts", json!({"author": {}})), vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_inverse_quantifiers() {
        let f = Fixture::new();
        assert_eq!(
            f.ids("users", json!({"posts": {"$some": {"views": {"$gt": 100}}}})),
            vec!["u1"]
        );
        // u3 has no posts, so $every is vacuously true
        assert_eq!(
            f.ids("users", json!({"posts": {"$every": {"views": {"$lt": 50}}}})),
            vec!["u2", "u3"]
        );
        assert_eq!(
            f.ids("users", json!({"posts": {"$none": {"title": "Hello"}}})),
            vec!["u1", "u3"]
        );
    }

    #[test]
    fn test_required_equalities() {
        let filter = Filter::from_json(&json!({
            "role": "admin",
            "$and": [{"tenant": "t1"}],
            "$or": [{"x": 1}],
            "age": {"$gt": 3}
        }));
        let eq = filter.required_equalities();
        assert_eq!(eq.get("role"), Some(&json!("admin")));
        assert_eq!(eq.get("tenant"), Some(&json!("t1")));
        assert!(!eq.contains_key("x"));
        assert!(!eq.contains_key("age"));
    }
}
