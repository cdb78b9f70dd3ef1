use crate::entity::{compare_values, is_missing, Entity};
use crate::error::{Result, TetherError};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s.eq_ignore_ascii_case("asc") => Some(SortDirection::Asc),
            Value::String(s) if s.eq_ignore_ascii_case("desc") => Some(SortDirection::Desc),
            Value::Number(n) if n.as_i64() == Some(1) => Some(SortDirection::Asc),
            Value::Number(n) if n.as_i64() == Some(-1) => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// Ordered sort keys; earlier keys win, later keys break ties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec(Vec<(String, SortDirection)>);

impl SortSpec {
    pub fn new() -> Self {
        SortSpec::default()
    }

    pub fn asc(mut self, path: impl Into<String>) -> Self {
        self.0.push((path.into(), SortDirection::Asc));
        self
    }

    pub fn desc(mut self, path: impl Into<String>) -> Self {
        self.0.push((path.into(), SortDirection::Desc));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.0
    }

    /// Accepts `{"age": "asc", "name": "desc"}` (key order preserved) or
    /// `[{"age": "asc"}, {"name": "desc"}]`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut spec = SortSpec::new();
        let mut push = |key: &str, dir: &Value| -> Result<()> {
            let direction = SortDirection::parse(dir).ok_or_else(|| {
                let message = format!("invalid sort direction {dir}");
                TetherError::validation("<query>", format!("sort.{key}"), message)
            })?;
            spec.0.push((key.to_string(), direction));
            Ok(())
        };

        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (key, dir) in map {
                    push(key, dir)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    let map = item.as_object().ok_or_else(|| {
                        TetherError::validation("<query>", "sort", "array entries must be objects")
                    })?;
                    for (key, dir) in map {
                        push(key, dir)?;
                    }
                }
            }
            other => {
                return Err(TetherError::validation(
                    "<query>",
                    "sort",
                    format!("expected object or array, got {other}"),
                ))
            }
        }
        Ok(spec)
    }
}

impl<'de> Deserialize<'de> for SortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SortSpec::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Compare two entities under a sort spec. Missing or null values sort last
/// in either direction.
pub fn compare(a: &Entity, b: &Entity, spec: &SortSpec) -> Ordering {
    for (path, direction) in &spec.0 {
        let (x, y) = (a.get_path(path), b.get_path(path));
        let ord = match (is_missing(x), is_missing(y)) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match (x, y) {
                (Some(x), Some(y)) => {
                    let ord = compare_values(x, y);
                    match direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    }
                }
                _ => Ordering::Equal,
            },
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable sort in place.
pub fn sort(entities: &mut [Entity], spec: &SortSpec) {
    if spec.is_empty() {
        return;
    }
    entities.sort_by(|a, b| compare(a, b, spec));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entities(values: Vec<Value>) -> Vec<Entity> {
        values
            .into_iter()
            .map(|v| Entity::from_value("people", v).unwrap())
            .collect()
    }

    fn names(entities: &[Entity]) -> Vec<&str> {
        entities
            .iter()
            .map(|e| e.get("name").and_then(Value::as_str).unwrap())
            .collect()
    }

    #[test]
    fn test_multi_key_tie_break() {
        let mut people = entities(vec![
            json!({"age": 30, "name": "X"}),
            json!({"age": 25, "name": "Frank"}),
            json!({"age": 25, "name": "Bob"}),
        ]);
        let spec = SortSpec::from_json(&json!({"age": "asc", "name": "asc"})).unwrap();
        sort(&mut people, &spec);
        assert_eq!(names(&people), vec!["Bob", "Frank", "X"]);
    }

    #[test]
    fn test_missing_values_sort_last_both_directions() {
        let base = vec![
            json!({"name": "none"}),
            json!({"name": "low", "score": 1}),
            json!({"name": "null", "score": null}),
            json!({"name": "high", "score": 9}),
        ];

        let mut asc = entities(base.clone());
        sort(&mut asc, &SortSpec::new().asc("score"));
        assert_eq!(names(&asc), vec!["low", "high", "none", "null"]);

        let mut desc = entities(base);
        sort(&mut desc, &SortSpec::new().desc("score"));
        assert_eq!(names(&desc), vec!["high", "low", "none", "null"]);
    }

    #[test]
    fn test_stable_for_equal_keys() {
        let mut people = entities(vec![
            json!({"name": "a", "team": 1}),
            json!({"name": "b", "team": 2}),
            json!({"name": "c", "team": 1}),
            json!({"name": "d", "team": 2}),
        ]);
        sort(&mut people, &SortSpec::new().desc("team"));
        assert_eq!(names(&people), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_dotted_path_on_populated_value() {
        let mut posts = entities(vec![
            json!({"name": "p1", "author": {"name": "Zed"}}),
            json!({"name": "p2"}),
            json!({"name": "p3", "author": {"name": "Amy"}}),
        ]);
        sort(&mut posts, &SortSpec::new().asc("author.name"));
        assert_eq!(names(&posts), vec!["p3", "p1", "p2"]);
    }

    #[test]
    fn test_parse_forms() {
        let from_array = SortSpec::from_json(&json!([{"b": "desc"}, {"a": 1}])).unwrap();
        assert_eq!(
            from_array.keys(),
            &[
                ("b".to_string(), SortDirection::Desc),
                ("a".to_string(), SortDirection::Asc)
            ]
        );
        assert!(SortSpec::from_json(&json!({"a": "sideways"})).is_err());
        assert!(SortSpec::from_json(&Value::Null).unwrap().is_empty());
    }
}
