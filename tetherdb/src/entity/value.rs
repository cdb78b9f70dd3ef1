use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// `None` and JSON `null` both count as "no value".
pub fn is_missing(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Equality with numbers compared by value, so `1` equals `1.0`. Integers
/// compare exactly; a float equals an integer only when it is integral and
/// names the same integer.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| values_equal(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// The integer an integral float names, if it fits the JSON integer range.
fn integral(f: f64) -> Option<i128> {
    let bound = 2f64.powi(64);
    if f.is_finite() && f.fract() == 0.0 && f > -bound && f < bound {
        Some(f as i128)
    } else {
        None
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    match (integer(x), integer(y)) {
        (Some(a), Some(b)) => a == b,
        (Some(a), None) => y.as_f64().and_then(integral) == Some(a),
        (None, Some(b)) => x.as_f64().and_then(integral) == Some(b),
        (None, None) => x.as_f64() == y.as_f64(),
    }
}

/// Total order used by sorting: values of different kinds order by kind,
/// same-kind scalars by value. Arrays and objects compare equal to their kin.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (integer(x), integer(y)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Canonical key for a tuple of values. Any missing component yields `None`.
pub fn canonical_key(values: &[Option<&Value>]) -> Option<String> {
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        if is_missing(*value) {
            return None;
        }
        parts.push(normalize((*value)?));
    }
    serde_json::to_string(&parts).ok()
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64().and_then(integral) {
            Some(i) if i >= 0 => u64::try_from(i)
                .map(Value::from)
                .unwrap_or_else(|_| value.clone()),
            Some(i) => i64::try_from(i)
                .map(Value::from)
                .unwrap_or_else(|_| value.clone()),
            None => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, normalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        _ => value.clone(),
    }
}
