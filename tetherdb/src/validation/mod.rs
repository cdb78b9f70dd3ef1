use crate::entity::{kind_name, Entity, CREATED_AT, DELETED_AT, ID, UPDATED_AT};
use crate::error::FieldIssue;
use crate::schema::{CollectionSchema, FieldDefinition, FieldType};
use chrono::{DateTime, NaiveDate};
use serde_json::Value;

/// Shape validation and encoding, supplied to the store at build time.
pub trait SchemaValidator: Send + Sync {
    /// Check a candidate against the collection's shape. May return a
    /// normalized entity (defaults applied, for example).
    fn validate(
        &self,
        collection: &CollectionSchema,
        candidate: Entity,
    ) -> Result<Entity, Vec<FieldIssue>>;

    /// Encode an entity to the plain value handed to persistence.
    fn encode(&self, _collection: &CollectionSchema, entity: &Entity) -> Value {
        entity.clone().into_value()
    }
}

/// Result of validating an entity
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<FieldIssue>,
    pub warnings: Vec<FieldIssue>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validates entities against the field declarations in the schema.
///
/// Strict collections reject on any issue. Non-strict collections accept the
/// entity and log each issue as a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredSchemaValidator;

impl SchemaValidator for DeclaredSchemaValidator {
    fn validate(
        &self,
        collection: &CollectionSchema,
        mut candidate: Entity,
    ) -> Result<Entity, Vec<FieldIssue>> {
        apply_defaults(collection, &mut candidate);
        let result = validate_entity(collection, &candidate);

        for warning in &result.warnings {
            log::warn!("{}: {}", collection.name, warning);
        }
        if !result.is_ok() {
            return Err(result.errors);
        }
        Ok(candidate)
    }
}

/// Accepts everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveValidator;

impl SchemaValidator for PermissiveValidator {
    fn validate(
        &self,
        _collection: &CollectionSchema,
        candidate: Entity,
    ) -> Result<Entity, Vec<FieldIssue>> {
        Ok(candidate)
    }
}

/// Validate an entity's fields against its collection's declarations.
pub fn validate_entity(collection: &CollectionSchema, entity: &Entity) -> ValidationResult {
    let strict = collection.definition.strict;
    let mut result = ValidationResult::default();

    for (field_name, field_def) in &collection.definition.fields {
        let value = entity.get(field_name);

        if matches!(value, None | Some(Value::Null)) {
            if field_def.required {
                add_issue(&mut result, strict, field_name, "required field is missing");
            }
            continue;
        }

        if let Some(value) = value {
            validate_field_value(field_name, field_def, value, strict, &mut result);
        }
    }

    if !collection.definition.additional_properties {
        for (key, _) in entity.fields() {
            if !collection.definition.fields.contains_key(key)
                && !is_system_field(collection, key)
            {
                add_issue(
                    &mut result,
                    strict,
                    key,
                    "unexpected field (additional_properties is false)",
                );
            }
        }
    }

    result
}

/// Fill missing or null fields that declare a default.
pub fn apply_defaults(collection: &CollectionSchema, entity: &mut Entity) {
    for (field_name, field_def) in &collection.definition.fields {
        let has_value = entity
            .get(field_name)
            .map(|v| !v.is_null())
            .unwrap_or(false);

        if !has_value {
            if let Some(default) = &field_def.default {
                entity.insert(field_name.clone(), default.clone());
            }
        }
    }
}

fn is_system_field(collection: &CollectionSchema, key: &str) -> bool {
    matches!(key, ID | CREATED_AT | UPDATED_AT | DELETED_AT) || collection.is_foreign_key(key)
}

fn validate_field_value(
    field_name: &str,
    field_def: &FieldDefinition,
    value: &Value,
    strict: bool,
    result: &mut ValidationResult,
) {
    if let Some(problem) = type_problem(field_def.field_type, value) {
        add_issue(result, strict, field_name, problem);
        return;
    }

    if let (Some(enum_values), Some(s)) = (&field_def.enum_values, value.as_str()) {
        if !enum_values.iter().any(|allowed| allowed == s) {
            add_issue(
                result,
                strict,
                field_name,
                format!("value '{s}' is not in enum: {enum_values:?}"),
            );
        }
    }

    if let (FieldType::List, Some(item_type), Some(items)) =
        (field_def.field_type, field_def.items, value.as_array())
    {
        for (i, item) in items.iter().enumerate() {
            if let Some(problem) = type_problem(item_type, item) {
                add_issue(result, strict, format!("{field_name}[{i}]"), problem);
            }
        }
    }
}

fn type_problem(expected: FieldType, value: &Value) -> Option<String> {
    let ok = match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::List => value.is_array(),
        FieldType::Object => value.is_object(),
        FieldType::Date => match value.as_str() {
            Some(s) => {
                if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                    return Some(format!("'{s}' is not a date (YYYY-MM-DD)"));
                }
                true
            }
            None => false,
        },
        FieldType::Datetime => match value.as_str() {
            Some(s) => {
                if DateTime::parse_from_rfc3339(s).is_err() {
                    return Some(format!("'{s}' is not an RFC 3339 datetime"));
                }
                true
            }
            None => false,
        },
    };

    if ok {
        None
    } else {
        Some(format!("expected {}, got {}", type_label(expected), kind_name(value)))
    }
}

fn type_label(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "string",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::Date => "date string",
        FieldType::Datetime => "datetime string",
        FieldType::List => "list",
        FieldType::Object => "object",
    }
}

fn add_issue(
    result: &mut ValidationResult,
    strict: bool,
    field: impl Into<String>,
    message: impl Into<String>,
) {
    let issue = FieldIssue::new(field, message);
    if strict {
        result.errors.push(issue);
    } else {
        result.warnings.push(issue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema_str, Schema};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::compile(
            parse_schema_str(
                r#"
collections:
  users:
    fields:
      name: { type: string, required: true }
      email: { type: string, required: true }
      role: { type: string, enum: [admin, member, guest], default: member }
      address: { type: object }
    additional_properties: false
    strict: true

  posts:
    fields:
      title: { type: string, required: true }
      date: { type: date, required: true }
      publishedAt: { type: datetime }
      tags: { type: list, items: string }
    relationships:
      author: { type: ref, target: users }
    additional_properties: false

  events:
    id: { auto: ulid }
    fields:
      type: { type: string, required: true }
      payload: { type: object }
    strict: false
"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn entity(value: Value) -> Entity {
        Entity::from_value("test", value).unwrap()
    }

    #[test]
    fn test_valid_user() {
        let schema = test_schema();
        let users = schema.collection("users").unwrap();
        let result = validate_entity(
            users,
            &entity(
                json!({"id": "u1", "name": "Alice", "email": "alice@test.com", "role": "admin"}),
            ),
        );
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_required_field() {
        let schema = test_schema();
        let users = schema.collection("users").unwrap();
        let result = validate_entity(users, &entity(json!({"name": "Alice"})));
        assert!(!result.is_ok());
        assert!(result.errors.iter().any(|e| e.field == "email"));
    }

    #[test]
    fn test_invalid_enum_value() {
        let schema = test_schema();
        let users = schema.collection("users").unwrap();
        let result = validate_entity(
            users,
            &entity(json!({"name": "Alice", "email": "a@b.c", "role": "superadmin"})),
        );
        assert!(result.errors.iter().any(|e| e.message.contains("superadmin")));
    }

    #[test]
    fn test_type_mismatch() {
        let schema = test_schema();
        let users = schema.collection("users").unwrap();
        let result = validate_entity(users, &entity(json!({"name": 42, "email": "a@b.c"})));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "name");
        assert_eq!(result.errors[0].message, "expected string, got number");
    }

    #[test]
    fn test_additional_properties_rejected_but_system_fields_allowed() {
        let schema = test_schema();
        let posts = schema.collection("posts").unwrap();
        let result = validate_entity(
            posts,
            &entity(json!({
                "id": "p1",
                "createdAt": "2026-01-01T00:00:00.000Z",
                "title": "T",
                "date": "2026-01-01",
                "authorId": "u1",
                "extra": true
            })),
        );
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["extra"]);
    }

    #[test]
    fn test_dates_and_list_items() {
        let schema = test_schema();
        let posts = schema.collection("posts").unwrap();
        let result = validate_entity(
            posts,
            &entity(json!({
                "title": "T",
                "date": "01/02/2026",
                "publishedAt": "yesterday",
                "tags": ["ok", 3]
            })),
        );
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["date", "publishedAt", "tags[1]"]);
    }

    #[test]
    fn test_non_strict_mode_warnings() {
        let schema = test_schema();
        let events = schema.collection("events").unwrap();
        let result = validate_entity(events, &entity(json!({"type": 123, "extra": "data"})));
        assert!(result.is_ok());
        assert!(result.has_warnings());

        let accepted = DeclaredSchemaValidator
            .validate(events, entity(json!({"type": 123})))
            .unwrap();
        assert_eq!(accepted.get("type"), Some(&json!(123)));
    }

    #[test]
    fn test_defaults_applied_without_overwriting() {
        let schema = test_schema();
        let users = schema.collection("users").unwrap();

        let filled = DeclaredSchemaValidator
            .validate(users, entity(json!({"name": "A", "email": "a@b.c"})))
            .unwrap();
        assert_eq!(filled.get("role"), Some(&json!("member")));

        let kept = DeclaredSchemaValidator
            .validate(users, entity(json!({"name": "A", "email": "a@b.c", "role": "admin"})))
            .unwrap();
        assert_eq!(kept.get("role"), Some(&json!("admin")));
    }

    #[test]
    fn test_declared_validator_reports_every_issue() {
        let schema = test_schema();
        let users = schema.collection("users").unwrap();
        let issues = DeclaredSchemaValidator
            .validate(users, entity(json!({"name": 1, "address": "nowhere"})))
            .unwrap_err();
        let mut fields: Vec<&str> = issues.iter().map(|e| e.field.as_str()).collect();
        fields.sort();
        assert_eq!(fields, vec!["address", "email", "name"]);
    }
}
