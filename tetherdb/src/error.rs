use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A single field-level problem reported by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldIssue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error in '{collection}': {}", join_issues(.issues))]
    Validation {
        collection: String,
        issues: Vec<FieldIssue>,
    },

    #[error("Entity not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Duplicate key: {collection}/{id} already exists")]
    DuplicateKey { collection: String, id: String },

    #[error("Foreign key violation: {collection}.{field} = '{value}' has no match in '{target}'")]
    ForeignKey {
        collection: String,
        field: String,
        target: String,
        value: String,
    },

    #[error("Unique constraint '{constraint}' violated in '{collection}': conflicts with {conflicting_id} on {values:?}")]
    UniqueConstraint {
        collection: String,
        constraint: String,
        fields: Vec<String>,
        values: Vec<Value>,
        conflicting_id: String,
    },

    #[error("Operation error: {0}")]
    Operation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TetherError {
    /// Shorthand for a validation error with a single issue.
    pub fn validation(
        collection: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TetherError::Validation {
            collection: collection.into(),
            issues: vec![FieldIssue::new(field, message)],
        }
    }

    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        TetherError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Whether this error is a duplicate id or unique-constraint collision.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            TetherError::DuplicateKey { .. } | TetherError::UniqueConstraint { .. }
        )
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_issue() {
        let err = TetherError::Validation {
            collection: "users".into(),
            issues: vec![
                FieldIssue::new("email", "is required"),
                FieldIssue::new("age", "expected number, got string"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("email: is required"));
        assert!(msg.contains("age: expected number"));
    }

    #[test]
    fn test_is_duplicate() {
        assert!(TetherError::DuplicateKey {
            collection: "users".into(),
            id: "u1".into()
        }
        .is_duplicate());
        assert!(!TetherError::not_found("users", "u1").is_duplicate());
    }
}
