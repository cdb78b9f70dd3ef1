//! Unique constraint enforcement.
//!
//! A candidate whose tuple has any null or missing component is exempt from
//! that constraint. Soft-deleted entities still occupy their tuples.

use crate::dataset::CollectionState;
use crate::entity::{canonical_key, values_equal, Entity};
use crate::error::{Result, TetherError};
use crate::schema::{CollectionSchema, UniqueConstraint};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

fn tuple<'a>(constraint: &UniqueConstraint, entity: &'a Entity) -> Vec<Option<&'a Value>> {
    constraint.fields.iter().map(|f| entity.get(f)).collect()
}

fn violation(
    collection: &str,
    constraint: &UniqueConstraint,
    candidate: &Entity,
    conflicting_id: &str,
) -> TetherError {
    TetherError::UniqueConstraint {
        collection: collection.to_string(),
        constraint: constraint.name.clone(),
        fields: constraint.fields.clone(),
        values: tuple(constraint, candidate)
            .into_iter()
            .map(|v| v.cloned().unwrap_or(Value::Null))
            .collect(),
        conflicting_id: conflicting_id.to_string(),
    }
}

/// Check a candidate against the stored entities. When `changed` is given,
/// only constraints touching one of those fields are checked.
pub fn check(
    schema: &CollectionSchema,
    state: &CollectionState,
    candidate: &Entity,
    changed: Option<&HashSet<String>>,
) -> Result<()> {
    let own_id = candidate.id();

    for constraint in &schema.unique {
        if let Some(changed) = changed {
            if !constraint.fields.iter().any(|f| changed.contains(f)) {
                continue;
            }
        }

        let values = tuple(constraint, candidate);
        if canonical_key(&values).is_none() {
            continue;
        }

        let conflict = match state.indexes().find(&constraint.fields) {
            Some(index) => {
                let present: Vec<&Value> = values.iter().flatten().copied().collect();
                index
                    .lookup(&present)
                    .and_then(|ids| ids.iter().find(|id| Some(id.as_str()) != own_id).cloned())
            }
            None => state
                .iter()
                .filter(|other| other.id() != own_id)
                .find(|other| {
                    tuple(constraint, other)
                        .iter()
                        .zip(&values)
                        .all(|(a, b)| match (a, b) {
                            (Some(a), Some(b)) => values_equal(a, b),
                            _ => false,
                        })
                })
                .and_then(|other| other.id().map(str::to_string)),
        };

        if let Some(conflicting_id) = conflict {
            return Err(violation(&schema.name, constraint, candidate, &conflicting_id));
        }
    }

    Ok(())
}

/// Tracks tuples claimed by earlier members of a batch.
#[derive(Debug, Default)]
pub struct BatchClaims {
    claimed: HashMap<String, HashMap<String, String>>,
}

impl BatchClaims {
    pub fn new() -> Self {
        BatchClaims::default()
    }

    /// Fail if the candidate collides with an earlier batch member.
    pub fn check(&self, schema: &CollectionSchema, candidate: &Entity) -> Result<()> {
        for constraint in &schema.unique {
            let Some(key) = canonical_key(&tuple(constraint, candidate)) else {
                continue;
            };
            if let Some(id) = self
                .claimed
                .get(&constraint.name)
                .and_then(|keys| keys.get(&key))
            {
                return Err(violation(&schema.name, constraint, candidate, id));
            }
        }
        Ok(())
    }

    pub fn claim(&mut self, schema: &CollectionSchema, candidate: &Entity) {
        let id = candidate.id().unwrap_or_default().to_string();
        for constraint in &schema.unique {
            if let Some(key) = canonical_key(&tuple(constraint, candidate)) {
                self.claimed
                    .entry(constraint.name.clone())
                    .or_default()
                    .insert(key, id.clone());
            }
        }
    }
}
