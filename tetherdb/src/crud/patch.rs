//! Update patches.
//!
//! A patch maps field names to a literal or an operator. Operators are parsed
//! without knowing the field, then resolved against the declared field type
//! (or the current value's kind for undeclared fields) into one of the typed
//! patch families below. An operator that does not fit the field's type is a
//! validation issue.

use crate::entity::{kind_name, values_equal, Entity, IMMUTABLE_FIELDS};
use crate::error::{FieldIssue, Result, TetherError};
use crate::schema::{CollectionSchema, FieldType};
use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Set,
    Increment,
    Decrement,
    Multiply,
    Append,
    Prepend,
    Remove,
    Toggle,
}

impl PatchOp {
    fn parse(key: &str) -> Option<Self> {
        Some(match key {
            "$set" => PatchOp::Set,
            "$increment" => PatchOp::Increment,
            "$decrement" => PatchOp::Decrement,
            "$multiply" => PatchOp::Multiply,
            "$append" => PatchOp::Append,
            "$prepend" => PatchOp::Prepend,
            "$remove" => PatchOp::Remove,
            "$toggle" => PatchOp::Toggle,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            PatchOp::Set => "$set",
            PatchOp::Increment => "$increment",
            PatchOp::Decrement => "$decrement",
            PatchOp::Multiply => "$multiply",
            PatchOp::Append => "$append",
            PatchOp::Prepend => "$prepend",
            PatchOp::Remove => "$remove",
            PatchOp::Toggle => "$toggle",
        }
    }
}

/// Element predicate for `$remove`
#[derive(Clone)]
pub struct ElementPredicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl fmt::Debug for ElementPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ElementPredicate(..)")
    }
}

/// One field's change, before type resolution
#[derive(Debug, Clone)]
pub enum FieldPatch {
    Literal(Value),
    Op(PatchOp, Value),
    RemoveWhere(ElementPredicate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumberPatch {
    Set(Number),
    Increment(Number),
    Decrement(Number),
    Multiply(Number),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringPatch {
    Set(String),
    Append(String),
    Prepend(String),
}

#[derive(Debug, Clone)]
pub enum ArrayPatch {
    Set(Vec<Value>),
    Append(Vec<Value>),
    Prepend(Vec<Value>),
    RemoveValue(Value),
    RemoveWhere(ElementPredicate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanPatch {
    Set(bool),
    Toggle,
}

/// A field patch resolved against the field's type
#[derive(Debug, Clone)]
pub enum TypedPatch {
    Literal(Value),
    Number(NumberPatch),
    String(StringPatch),
    Array(ArrayPatch),
    Boolean(BooleanPatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Number,
    String,
    Array,
    Boolean,
}

/// Field changes, applied in the order given
#[derive(Debug, Clone, Default)]
pub struct Patch(Vec<(String, FieldPatch)>);

impl Patch {
    pub fn new() -> Self {
        Patch::default()
    }

    pub fn set(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Literal(value.into()))
    }

    pub fn increment(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Increment, by.into()))
    }

    pub fn decrement(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Decrement, by.into()))
    }

    pub fn multiply(self, field: impl Into<String>, by: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Multiply, by.into()))
    }

    pub fn append(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Append, value.into()))
    }

    pub fn prepend(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Prepend, value.into()))
    }

    pub fn toggle(self, field: impl Into<String>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Toggle, Value::Bool(true)))
    }

    /// Remove every array element equal to `value`.
    pub fn remove(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, FieldPatch::Op(PatchOp::Remove, value.into()))
    }

    /// Remove every array element the predicate accepts.
    pub fn remove_where<F>(self, field: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.with(field, FieldPatch::RemoveWhere(ElementPredicate(Arc::new(predicate))))
    }

    pub fn with(mut self, field: impl Into<String>, patch: FieldPatch) -> Self {
        self.0.push((field.into(), patch));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `{"name": "x", "score": {"$increment": 1}}`. An object whose keys
    /// all start with `$` is an operator; any other object is a literal.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            let message = format!("expected object, got {}", kind_name(value));
            TetherError::validation("<patch>", "<root>", message)
        })?;

        let mut patch = Patch::new();
        for (field, entry) in map {
            patch = patch.with(field.as_str(), parse_field(field, entry)?);
        }
        Ok(patch)
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Patch::from_json(&value).map_err(serde::de::Error::custom)
    }
}

fn parse_field(field: &str, entry: &Value) -> Result<FieldPatch> {
    let Value::Object(obj) = entry else {
        return Ok(FieldPatch::Literal(entry.clone()));
    };
    let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        return Ok(FieldPatch::Literal(entry.clone()));
    }
    if operator_keys != obj.len() || obj.len() != 1 {
        return Err(TetherError::validation(
            "<patch>",
            field,
            "an operator object must hold exactly one operator",
        ));
    }
    let (key, operand) = obj
        .iter()
        .next()
        .ok_or_else(|| TetherError::validation("<patch>", field, "empty operator object"))?;
    let op = PatchOp::parse(key).ok_or_else(|| {
        TetherError::validation("<patch>", field, format!("unknown patch operator '{key}'"))
    })?;
    Ok(FieldPatch::Op(op, operand.clone()))
}

// ── Resolution ─────────────────────────────────────────────────

fn declared_kind(field_type: FieldType) -> Option<Kind> {
    match field_type {
        FieldType::Number => Some(Kind::Number),
        FieldType::String | FieldType::Date | FieldType::Datetime => Some(Kind::String),
        FieldType::List => Some(Kind::Array),
        FieldType::Boolean => Some(Kind::Boolean),
        FieldType::Object => None,
    }
}

fn value_kind(value: &Value) -> Option<Kind> {
    match value {
        Value::Number(_) => Some(Kind::Number),
        Value::String(_) => Some(Kind::String),
        Value::Array(_) => Some(Kind::Array),
        Value::Bool(_) => Some(Kind::Boolean),
        _ => None,
    }
}

/// Best guess for a field with no declaration and no current value.
fn operator_kind(op: PatchOp, operand: &Value) -> Option<Kind> {
    match op {
        PatchOp::Increment | PatchOp::Decrement | PatchOp::Multiply => Some(Kind::Number),
        PatchOp::Toggle => Some(Kind::Boolean),
        PatchOp::Remove => Some(Kind::Array),
        PatchOp::Append | PatchOp::Prepend => match operand {
            Value::String(_) => Some(Kind::String),
            _ => Some(Kind::Array),
        },
        PatchOp::Set => value_kind(operand),
    }
}

fn kind_label(kind: Kind) -> &'static str {
    match kind {
        Kind::Number => "number",
        Kind::String => "string",
        Kind::Array => "array",
        Kind::Boolean => "boolean",
    }
}

/// Resolve one field's patch into its typed form.
pub fn resolve(
    collection: &CollectionSchema,
    field: &str,
    patch: &FieldPatch,
    current: Option<&Value>,
) -> std::result::Result<TypedPatch, FieldIssue> {
    let (op, operand) = match patch {
        FieldPatch::Literal(value) => return Ok(TypedPatch::Literal(value.clone())),
        FieldPatch::RemoveWhere(predicate) => {
            return match field_kind(collection, field, current, PatchOp::Remove, &Value::Null) {
                Some(Kind::Array) => {
                    Ok(TypedPatch::Array(ArrayPatch::RemoveWhere(predicate.clone())))
                }
                other => Err(mismatch(field, PatchOp::Remove, other)),
            };
        }
        FieldPatch::Op(op, operand) => (*op, operand),
    };

    if op == PatchOp::Set && operand.is_null() {
        return Ok(TypedPatch::Literal(Value::Null));
    }

    let kind = field_kind(collection, field, current, op, operand);
    let bad_operand = |expected: &str| {
        FieldIssue::new(
            field,
            format!("{} expects {expected}, got {}", op.name(), kind_name(operand)),
        )
    };

    match (kind, op) {
        (
            Some(Kind::Number),
            PatchOp::Set | PatchOp::Increment | PatchOp::Decrement | PatchOp::Multiply,
        ) => {
            let n = match operand {
                Value::Number(n) => n.clone(),
                _ => return Err(bad_operand("a number")),
            };
            Ok(TypedPatch::Number(match op {
                PatchOp::Set => NumberPatch::Set(n),
                PatchOp::Increment => NumberPatch::Increment(n),
                PatchOp::Decrement => NumberPatch::Decrement(n),
                _ => NumberPatch::Multiply(n),
            }))
        }
        (Some(Kind::String), PatchOp::Set | PatchOp::Append | PatchOp::Prepend) => {
            let s = operand.as_str().ok_or_else(|| bad_operand("a string"))?.to_string();
            Ok(TypedPatch::String(match op {
                PatchOp::Set => StringPatch::Set(s),
                PatchOp::Append => StringPatch::Append(s),
                _ => StringPatch::Prepend(s),
            }))
        }
        (Some(Kind::Array), PatchOp::Set) => match operand {
            Value::Array(items) => Ok(TypedPatch::Array(ArrayPatch::Set(items.clone()))),
            _ => Err(bad_operand("an array")),
        },
        (Some(Kind::Array), PatchOp::Append | PatchOp::Prepend) => {
            let items = match operand {
                Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            Ok(TypedPatch::Array(if op == PatchOp::Append {
                ArrayPatch::Append(items)
            } else {
                ArrayPatch::Prepend(items)
            }))
        }
        (Some(Kind::Array), PatchOp::Remove) => {
            Ok(TypedPatch::Array(ArrayPatch::RemoveValue(operand.clone())))
        }
        (Some(Kind::Boolean), PatchOp::Set) => operand
            .as_bool()
            .map(|b| TypedPatch::Boolean(BooleanPatch::Set(b)))
            .ok_or_else(|| bad_operand("a boolean")),
        (Some(Kind::Boolean), PatchOp::Toggle) => Ok(TypedPatch::Boolean(BooleanPatch::Toggle)),
        (None, PatchOp::Set) => Ok(TypedPatch::Literal(operand.clone())),
        (other, _) => Err(mismatch(field, op, other)),
    }
}

fn field_kind(
    collection: &CollectionSchema,
    field: &str,
    current: Option<&Value>,
    op: PatchOp,
    operand: &Value,
) -> Option<Kind> {
    if let Some(def) = collection.field(field) {
        if let Some(kind) = declared_kind(def.field_type) {
            return Some(kind);
        }
    }
    match current {
        Some(value) if !value.is_null() => value_kind(value),
        _ => operator_kind(op, operand),
    }
}

fn mismatch(field: &str, op: PatchOp, kind: Option<Kind>) -> FieldIssue {
    let target = kind.map(kind_label).unwrap_or("object");
    FieldIssue::new(field, format!("{} cannot be applied to a {target} field", op.name()))
}

// ── Application ────────────────────────────────────────────────

fn arithmetic(
    current: Option<&Value>,
    operand: &Number,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> std::result::Result<Value, String> {
    let base = match current {
        Some(Value::Number(n)) => n.clone(),
        _ => Number::from(0),
    };
    if let (Some(a), Some(b)) = (base.as_i64(), operand.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
    }
    let a = base.as_f64().unwrap_or_default();
    let b = operand.as_f64().unwrap_or_default();
    Number::from_f64(float_op(a, b))
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

/// Compute the new value of a field.
pub fn apply(typed: &TypedPatch, current: Option<&Value>) -> std::result::Result<Value, String> {
    Ok(match typed {
        TypedPatch::Literal(value) => value.clone(),
        TypedPatch::Number(patch) => match patch {
            NumberPatch::Set(n) => Value::Number(n.clone()),
            NumberPatch::Increment(n) => arithmetic(current, n, i64::checked_add, |a, b| a + b)?,
            NumberPatch::Decrement(n) => arithmetic(current, n, i64::checked_sub, |a, b| a - b)?,
            NumberPatch::Multiply(n) => arithmetic(current, n, i64::checked_mul, |a, b| a * b)?,
        },
        TypedPatch::String(patch) => {
            let base = current.and_then(Value::as_str).unwrap_or_default();
            Value::String(match patch {
                StringPatch::Set(s) => s.clone(),
                StringPatch::Append(s) => format!("{base}{s}"),
                StringPatch::Prepend(s) => format!("{s}{base}"),
            })
        }
        TypedPatch::Array(patch) => {
            let base = current.and_then(Value::as_array).cloned().unwrap_or_default();
            Value::Array(match patch {
                ArrayPatch::Set(items) => items.clone(),
                ArrayPatch::Append(items) => {
                    base.into_iter().chain(items.iter().cloned()).collect()
                }
                ArrayPatch::Prepend(items) => items.iter().cloned().chain(base).collect(),
                ArrayPatch::RemoveValue(target) => {
                    base.into_iter().filter(|v| !values_equal(v, target)).collect()
                }
                ArrayPatch::RemoveWhere(predicate) => {
                    base.into_iter().filter(|v| !(predicate.0)(v)).collect()
                }
            })
        }
        TypedPatch::Boolean(patch) => Value::Bool(match patch {
            BooleanPatch::Set(b) => *b,
            BooleanPatch::Toggle => !current.and_then(Value::as_bool).unwrap_or(false),
        }),
    })
}

/// Apply a whole patch to a copy of `current`. Returns the patched entity and
/// the fields whose value actually changed. Every problem is reported at once.
pub fn apply_patch(
    collection: &CollectionSchema,
    current: &Entity,
    patch: &Patch,
) -> Result<(Entity, HashSet<String>)> {
    let mut next = current.clone();
    let mut changed = HashSet::new();
    let mut issues = Vec::new();

    for (field, field_patch) in &patch.0 {
        if IMMUTABLE_FIELDS.contains(&field.as_str()) {
            issues.push(FieldIssue::new(field.as_str(), "field is immutable"));
            continue;
        }
        if let Some(rel) = collection.relationship(field) {
            issues.push(FieldIssue::new(
                field.as_str(),
                format!("relationships cannot be patched; set '{}' instead", rel.foreign_key),
            ));
            continue;
        }

        let before = next.get(field).cloned();
        let outcome = resolve(collection, field, field_patch, before.as_ref()).and_then(|typed| {
            apply(&typed, before.as_ref()).map_err(|msg| FieldIssue::new(field.as_str(), msg))
        });
        match outcome {
            Ok(after) => {
                // absent and null are the same value
                let same = match before.as_ref() {
                    Some(b) => values_equal(b, &after),
                    None => after.is_null(),
                };
                if !same {
                    changed.insert(field.clone());
                    next.insert(field.clone(), after);
                }
            }
            Err(issue) => issues.push(issue),
        }
    }

    if !issues.is_empty() {
        return Err(TetherError::Validation {
            collection: collection.name.clone(),
            issues,
        });
    }
    Ok((next, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema_str, Schema};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::compile(
            parse_schema_str(
                r#"
collections:
  users:
    fields:
      name: { type: string }
      score: { type: number }
      active: { type: boolean }
      tags: { type: list, items: string }
      meta: { type: object }
    relationships:
      team: { type: ref, target: teams }
  teams: {}
"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn user() -> Entity {
        Entity::from_value(
            "users",
            json!({
                "id": "u1",
                "createdAt": "2026-01-01T00:00:00.000Z",
                "name": "Ada",
                "score": 10,
                "active": true,
                "tags": ["a", "b", "a"]
            }),
        )
        .unwrap()
    }

    fn run(patch: Value) -> Result<(Entity, HashSet<String>)> {
        let schema = schema();
        let patch = Patch::from_json(&patch).unwrap();
        apply_patch(schema.collection("users").unwrap(), &user(), &patch)
    }

    #[test]
    fn test_number_operators() {
        let (next, _) = run(json!({"score": {"$increment": 5}})).unwrap();
        assert_eq!(next.get("score"), Some(&json!(15)));
        let (next, _) = run(json!({"score": {"$decrement": 2.5}})).unwrap();
        assert_eq!(next.get("score"), Some(&json!(7.5)));
        let (next, _) = run(json!({"score": {"$multiply": 3}})).unwrap();
        assert_eq!(next.get("score"), Some(&json!(30)));
    }

    #[test]
    fn test_missing_fields_start_from_identity() {
        let schema = schema();
        let users = schema.collection("users").unwrap();
        let bare = Entity::from_value("users", json!({"id": "u2"})).unwrap();
        let patch = Patch::new()
            .increment("score", 4)
            .append("name", "!")
            .prepend("tags", "z")
            .toggle("active")
            .multiply("visits", 3);
        let (next, changed) = apply_patch(users, &bare, &patch).unwrap();
        assert_eq!(
            next.into_value(),
            json!({"id": "u2", "score": 4, "name": "!", "tags": ["z"], "active": true, "visits": 0})
        );
        assert_eq!(changed.len(), 5);
    }

    #[test]
    fn test_string_and_array_operators() {
        let (next, _) = run(json!({
            "name": {"$prepend": "Lady "},
            "tags": {"$remove": "a"}
        }))
        .unwrap();
        assert_eq!(next.get("name"), Some(&json!("Lady Ada")));
        assert_eq!(next.get("tags"), Some(&json!(["b"])));

        let (next, _) = run(json!({"tags": {"$append": ["c", "d"]}})).unwrap();
        assert_eq!(next.get("tags"), Some(&json!(["a", "b", "a", "c", "d"])));
    }

    #[test]
    fn test_remove_with_predicate() {
        let schema = schema();
        let patch = Patch::new().remove_where("tags", |v| v.as_str() == Some("b"));
        let (next, _) = apply_patch(schema.collection("users").unwrap(), &user(), &patch).unwrap();
        assert_eq!(next.get("tags"), Some(&json!(["a", "a"])));
    }

    #[test]
    fn test_operator_type_mismatch_is_validation_error() {
        let err = run(json!({"name": {"$increment": 1}, "active": {"$append": "x"}})).unwrap_err();
        match err {
            TetherError::Validation { issues, .. } => {
                let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
                assert_eq!(fields, vec!["name", "active"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(run(json!({"score": {"$increment": "1"}})).is_err());
    }

    #[test]
    fn test_immutable_and_relationship_fields_rejected() {
        assert!(run(json!({"id": "other"})).is_err());
        assert!(run(json!({"createdAt": "2020-01-01T00:00:00.000Z"})).is_err());
        assert!(run(json!({"team": {"id": "t1"}})).is_err());
    }

    #[test]
    fn test_changed_set_excludes_no_ops() {
        let (_, changed) =
            run(json!({"name": "Ada", "score": {"$set": 10.0}, "active": false})).unwrap();
        assert_eq!(changed, HashSet::from(["active".to_string()]));
    }

    #[test]
    fn test_null_on_absent_field_is_not_a_change() {
        let (next, changed) = run(json!({"meta": null, "name": null})).unwrap();
        assert_eq!(changed, HashSet::from(["name".to_string()]));
        assert_eq!(next.get("meta"), None);
        assert_eq!(next.get("name"), Some(&Value::Null));
    }

    #[test]
    fn test_parse_rejects_unknown_and_mixed_operators() {
        assert!(Patch::from_json(&json!({"score": {"$pow": 2}})).is_err());
        assert!(Patch::from_json(&json!({"score": {"$set": 1, "$increment": 1}})).is_err());
        assert!(Patch::from_json(&json!([1])).is_err());
        // plain nested objects are literals
        let (next, _) = run(json!({"meta": {"color": "red"}})).unwrap();
        assert_eq!(next.get("meta"), Some(&json!({"color": "red"})));
    }
}
