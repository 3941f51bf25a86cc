//! Builtin parameter types, regulars and MIME entries.
//!
//! Registered with `override = false` so applications can replace any of
//! them before initialization.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::json;

use crate::basic::{Kind, BASIC};
use crate::defs::{self, Value};

pub fn builtin() {
    register_kinds();
    register_regulars();
    register_mimes();
}

fn kind(name: &str, alias: &[&str], valid: fn(&Value) -> bool, value: fn(&Value) -> Value) -> (String, Kind) {
    (
        name.to_string(),
        Kind {
            name: name.to_string(),
            alias: alias.iter().map(|s| s.to_string()).collect(),
            valid: Some(Arc::new(move |v, _| valid(v))),
            value: Some(Arc::new(move |v, _| value(v))),
            ..Kind::default()
        },
    )
}

fn register_kinds() {
    let kinds = [
        kind("any", &[], |_| true, Value::clone),
        kind(
            "string",
            &["text"],
            |v| !defs::text_of(v).is_empty(),
            |v| Value::String(defs::text_of(v)),
        ),
        kind(
            "int",
            &["integer"],
            |v| as_i64(v).is_some(),
            |v| as_i64(v).map(|n| json!(n)).unwrap_or(Value::Null),
        ),
        kind(
            "float",
            &["double", "number"],
            |v| as_f64(v).is_some(),
            |v| as_f64(v).map(|n| json!(n)).unwrap_or(Value::Null),
        ),
        kind(
            "bool",
            &["boolean"],
            |v| as_bool(v).is_some(),
            |v| as_bool(v).map(Value::Bool).unwrap_or(Value::Null),
        ),
        kind(
            "date",
            &[],
            |v| parse_date(&defs::text_of(v)).is_some(),
            |v| {
                parse_date(&defs::text_of(v))
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Value::Null)
            },
        ),
        kind(
            "datetime",
            &["time"],
            |v| parse_datetime(v).is_some(),
            |v| {
                parse_datetime(v)
                    .map(|dt| Value::String(dt.to_rfc3339()))
                    .unwrap_or(Value::Null)
            },
        ),
        kind("json", &["map", "object"], Value::is_object, Value::clone),
        kind("[json]", &["[map]", "array"], Value::is_array, Value::clone),
        kind(
            "[int]",
            &[],
            |v| match v {
                Value::Array(items) => items.iter().all(|i| as_i64(i).is_some()),
                other => as_i64(other).is_some(),
            },
            |v| match v {
                Value::Array(items) => {
                    json!(items.iter().filter_map(as_i64).collect::<Vec<_>>())
                }
                other => json!([as_i64(other).unwrap_or_default()]),
            },
        ),
    ];

    for (name, config) in kinds {
        BASIC.kind(&name, config, false);
    }
}

fn register_regulars() {
    let entries = [
        ("string", vec![r"^[\s\S]+$"]),
        ("int", vec![r"^-?\d+$"]),
        ("float", vec![r"^-?\d+(\.\d+)?$"]),
        ("bool", vec![r"^(true|false|0|1)$"]),
        ("email", vec![r"^[^@\s]+@[^@\s]+\.[^@\s]+$"]),
        ("mobile", vec![r"^1\d{10}$", r"^\+\d{7,15}$"]),
        ("url", vec![r"^https?://\S+$"]),
        ("date", vec![r"^\d{4}-\d{2}-\d{2}$"]),
        ("datetime", vec![r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}"]),
    ];

    let mut regulars = HashMap::new();
    for (name, patterns) in entries {
        regulars.insert(
            name.to_string(),
            patterns.iter().map(|s| s.to_string()).collect(),
        );
    }
    BASIC.regular(&regulars, false);
}

fn register_mimes() {
    let entries = [
        ("text", "text/plain"),
        ("txt", "text/plain"),
        ("html", "text/html"),
        ("htm", "text/html"),
        ("script", "text/javascript"),
        ("js", "text/javascript"),
        ("jsonp", "text/javascript"),
        ("json", "application/json"),
        ("xml", "text/xml"),
        ("css", "text/css"),
        ("file", "application/octet-stream"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("webp", "image/webp"),
        ("svg", "image/svg+xml"),
        ("ico", "image/x-icon"),
        ("pdf", "application/pdf"),
        ("zip", "application/zip"),
        ("mp4", "video/mp4"),
        ("mp3", "audio/mpeg"),
        ("woff", "font/woff"),
        ("woff2", "font/woff2"),
    ];

    let mut mimes = HashMap::new();
    for (ext, mime) in entries {
        mimes.insert(ext.to_string(), mime.to_string());
    }
    BASIC.mime(&mimes, false);
}

fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(&Value::String(s.to_string())).map(|dt| dt.date_naive()))
}

fn parse_datetime(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            })
            .or_else(|| s.parse::<i64>().ok().and_then(|secs| Utc.timestamp_opt(secs, 0).single())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::mapping::Var;

    #[test]
    fn int_kind_accepts_numbers_and_digit_strings() {
        builtin();
        let valid = BASIC.kind_valid("int");
        let coerce = BASIC.kind_value("int");
        let var = Var::new("int");

        assert!(valid(&json!(5), &var));
        assert!(valid(&json!("12"), &var));
        assert!(!valid(&json!("12.5x"), &var));
        assert_eq!(coerce(&json!("12"), &var), json!(12));
    }

    #[test]
    fn datetime_kind_normalizes_epochs() {
        builtin();
        let coerce = BASIC.kind_value("datetime");
        let var = Var::new("datetime");
        let out = coerce(&json!(0), &var);
        assert_eq!(out, json!("1970-01-01T00:00:00+00:00"));
    }

    #[test]
    fn bool_kind_reads_common_spellings() {
        builtin();
        let coerce = BASIC.kind_value("bool");
        let var = Var::new("bool");
        assert_eq!(coerce(&json!("1"), &var), json!(true));
        assert_eq!(coerce(&json!("false"), &var), json!(false));
    }
}
