use crate::entity::Entity;
use crate::error::{Result, TetherError};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Fields to keep in query output. A key may carry a nested selection that is
/// applied to a populated relationship (or any nested object / array of objects).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection(Vec<(String, Option<Selection>)>);

impl Selection {
    pub fn new() -> Self {
        Selection::default()
    }

    /// Flat selection from field names.
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection(fields.into_iter().map(|f| (f.into(), None)).collect())
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.0.push((name.into(), None));
        self
    }

    pub fn nested(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.0.push((name.into(), Some(selection)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Accepts `["a", "b"]` or `{"a": true, "author": {"name": true}}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let mut fields = Vec::with_capacity(items.len());
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        let message = format!("expected field name, got {item}");
                        TetherError::validation("<query>", "select", message)
                    })?;
                    fields.push((name.to_string(), None));
                }
                Ok(Selection(fields))
            }
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, entry) in map {
                    match entry {
                        Value::Bool(true) => fields.push((key.clone(), None)),
                        Value::Bool(false) => {}
                        Value::Object(_) | Value::Array(_) => {
                            fields.push((key.clone(), Some(Selection::from_json(entry)?)))
                        }
                        other => {
                            return Err(TetherError::validation(
                                "<query>",
                                format!("select.{key}"),
                                format!("expected boolean or nested selection, got {other}"),
                            ))
                        }
                    }
                }
                Ok(Selection(fields))
            }
            other => Err(TetherError::validation(
                "<query>",
                "select",
                format!("expected array or object, got {other}"),
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Selection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Selection::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Project an entity down to the selected fields. An empty selection yields
/// an empty entity.
pub fn project(entity: &Entity, selection: &Selection) -> Entity {
    Entity::from(project_map(entity.as_map(), selection))
}

fn project_map(source: &Map<String, Value>, selection: &Selection) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, nested) in &selection.0 {
        let Some(value) = source.get(key) else {
            continue;
        };
        let projected = match nested {
            None => value.clone(),
            Some(sub) => project_value(value, sub),
        };
        out.insert(key.clone(), projected);
    }
    out
}

fn project_value(value: &Value, selection: &Selection) -> Value {
    match value {
        Value::Object(map) => Value::Object(project_map(map, selection)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project_value(item, selection))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn post() -> Entity {
        Entity::from_value(
            "posts",
            json!({
                "id": "p1",
                "title": "Engines",
                "views": 10,
                "author": {"id": "u1", "name": "Ada", "email": "ada@x.io"},
                "comments": [
                    {"id": "c1", "body": "nice", "score": 3},
                    {"id": "c2", "body": "meh", "score": 1}
                ]
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_flat_selection() {
        let out = project(&post(), &Selection::fields(["id", "title", "missing"]));
        assert_eq!(out.into_value(), json!({"id": "p1", "title": "Engines"}));
    }

    #[test]
    fn test_empty_selection_is_empty_object() {
        let out = project(&post(), &Selection::new());
        assert_eq!(out.into_value(), json!({}));
    }

    #[test]
    fn test_nested_selection_on_populated_values() {
        let selection = Selection::from_json(&json!({
            "title": true,
            "views": false,
            "author": {"name": true},
            "comments": ["body"]
        }))
        .unwrap();
        let out = project(&post(), &selection);
        assert_eq!(
            out.into_value(),
            json!({
                "title": "Engines",
                "author": {"name": "Ada"},
                "comments": [{"body": "nice"}, {"body": "meh"}]
            })
        );
    }

    #[test]
    fn test_selected_relationship_without_nested_spec_keeps_value() {
        let out = project(&post(), &Selection::new().field("author"));
        assert_eq!(
            out.into_value(),
            json!({"author": {"id": "u1", "name": "Ada", "email": "ada@x.io"}})
        );
    }

    #[test]
    fn test_invalid_selection() {
        assert!(Selection::from_json(&json!({"title": 1})).is_err());
        assert!(Selection::from_json(&json!("title")).is_err());
    }
}
