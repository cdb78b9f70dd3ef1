use crate::error::Result;
use super::types::SchemaDefinition;
use std::path::Path;

/// Parse a schema YAML file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AutoIdStrategy, FieldSet, FieldType, OnDeletePolicy, RelationshipKind};

    #[test]
    fn test_parse_full_collection() {
        let schema = parse_schema_str(
            r#"
collections:
  users:
    fields:
      email: { type: string, required: true }
      role: { type: string, enum: [admin, member], default: member }
    relationships:
      posts: { type: inverse, target: posts, foreign_key: authorId }
    unique: [email, [tenantId, handle]]
    indexes: [role]
    soft_delete: true
    persist: true
    id: { auto: ulid }
  posts:
    relationships:
      author: { type: ref, target: users, foreign_key: authorId, on_delete: nullify }
"#,
        )
        .unwrap();

        let users = &schema.collections["users"];
        assert_eq!(users.fields["email"].field_type, FieldType::String);
        assert!(users.fields["email"].required);
        assert_eq!(users.fields["role"].default, Some(serde_json::json!("member")));
        assert_eq!(users.relationships["posts"].kind, RelationshipKind::Inverse);
        assert_eq!(
            users.unique,
            vec![
                FieldSet::Single("email".into()),
                FieldSet::Compound(vec!["tenantId".into(), "handle".into()])
            ]
        );
        assert!(users.soft_delete);
        assert!(users.persist);
        assert!(users.strict);
        assert_eq!(users.id.as_ref().unwrap().auto, Some(AutoIdStrategy::Ulid));

        let posts = &schema.collections["posts"];
        assert_eq!(
            posts.relationships["author"].on_delete,
            Some(OnDeletePolicy::SetNull)
        );
        assert!(posts.additional_properties);
    }

    #[test]
    fn test_parse_rejects_unknown_field_type() {
        let result = parse_schema_str(
            r#"
collections:
  users:
    fields:
      age: { type: integer-ish }
"#,
        );
        assert!(result.is_err());
    }
}
