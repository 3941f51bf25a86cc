//! Dynamic data aliases shared across every module.
//!
//! Configuration, request parameters, session payloads and method results all
//! flow through loosely-typed maps. `Value`/`Map` are the crate-wide currency
//! for that data; the helpers here are the accessors the configure paths use
//! to read them leniently (a numeric field may arrive as an integer, a float
//! or a string depending on the config source).

use std::time::Duration;

pub use serde_json::Value;

/// A string-keyed dynamic map, the unit of configuration and request data.
pub type Map = serde_json::Map<String, Value>;

use crate::utils::parse_duration;

/// Build a `Map` from key/value pairs.
#[macro_export]
macro_rules! map {
    () => { $crate::defs::Map::new() };
    ($($key:expr => $val:expr),+ $(,)?) => {{
        let mut m = $crate::defs::Map::new();
        $( m.insert($key.to_string(), ::serde_json::json!($val)); )+
        m
    }};
}

pub fn get_str(map: &Map, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

pub fn get_bool(map: &Map, key: &str) -> Option<bool> {
    map.get(key).and_then(Value::as_bool)
}

pub fn get_i64(map: &Map, key: &str) -> Option<i64> {
    match map.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

pub fn get_f64(map: &Map, key: &str) -> Option<f64> {
    match map.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

pub fn get_map<'a>(map: &'a Map, key: &str) -> Option<&'a Map> {
    map.get(key).and_then(Value::as_object)
}

/// Read a list that may be configured as a single string (`host = "a"`) or a
/// list of strings (`hosts = ["a", "b"]`). The singular key wins when both
/// are absent-or-present asymmetrically; list entries that are not strings
/// are skipped.
pub fn get_str_list(map: &Map, singular: &str, plural: &str) -> Option<Vec<String>> {
    if let Some(list) = map.get(plural).and_then(Value::as_array) {
        return Some(
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        );
    }
    map.get(singular)
        .and_then(Value::as_str)
        .map(|s| vec![s.to_string()])
}

/// Read a duration that may be configured as seconds (integer or float) or a
/// human-readable string such as `"90s"`, `"5m"`, `"24h"`.
pub fn get_duration(map: &Map, key: &str) -> Option<Duration> {
    match map.get(key) {
        Some(Value::Number(n)) => {
            if let Some(secs) = n.as_i64() {
                (secs >= 0).then(|| Duration::from_secs(secs as u64))
            } else {
                n.as_f64().map(Duration::from_secs_f64)
            }
        }
        Some(Value::String(s)) => parse_duration(s),
        _ => None,
    }
}

/// Shallow-merge `from` into `into`; later writers win.
pub fn merge(into: &mut Map, from: &Map) {
    for (k, v) in from {
        into.insert(k.clone(), v.clone());
    }
}

/// Stringify a value the way request parameters read: strings verbatim,
/// scalars rendered, null empty, containers as their JSON text.
pub fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Whether a field value counts as empty for mapping purposes.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_numeric_reads() {
        let m = map! { "a" => 7, "b" => "42", "c" => 1.5 };
        assert_eq!(get_i64(&m, "a"), Some(7));
        assert_eq!(get_i64(&m, "b"), Some(42));
        assert_eq!(get_f64(&m, "c"), Some(1.5));
        assert_eq!(get_i64(&m, "missing"), None);
    }

    #[test]
    fn singular_or_plural_lists() {
        let m = map! { "host" => "a.example.com" };
        assert_eq!(get_str_list(&m, "host", "hosts"), Some(vec!["a.example.com".into()]));

        let m = map! { "hosts" => ["x", "y"] };
        assert_eq!(
            get_str_list(&m, "host", "hosts"),
            Some(vec!["x".to_string(), "y".to_string()])
        );
    }

    #[test]
    fn durations_from_numbers_and_strings() {
        let m = map! { "a" => 30, "b" => "5m" };
        assert_eq!(get_duration(&m, "a"), Some(Duration::from_secs(30)));
        assert_eq!(get_duration(&m, "b"), Some(Duration::from_secs(300)));
    }

    #[test]
    fn emptiness() {
        assert!(is_empty(&Value::Null));
        assert!(is_empty(&json!("")));
        assert!(!is_empty(&json!(0)));
        assert!(!is_empty(&json!("x")));
    }
}
