//! The declarative validate/coerce/encrypt walker.
//!
//! Every external boundary funnels its loose input through [`mapping`]: HTTP
//! args, method args and response data are all described by a [`Vars`] schema
//! and materialized into a clean output map. The walker enforces
//! required/nullable rules, applies defaults, decrypts and encrypts field
//! values through the codec registry, validates against the type table and
//! recurses into child schemas.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde_json::json;

use crate::basic::{self, ValidFn, ValueFn, BASIC};
use crate::codec;
use crate::defs::{self, Map, Value};
use crate::result::{self, Res};

/// Field schemas in deterministic walk order.
pub type Vars = BTreeMap<String, Var>;

/// A field default: a literal, or a producer invoked at mapping time.
#[derive(Clone)]
pub enum Auto {
    Value(Value),
    Make(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl Auto {
    fn materialize(&self) -> Value {
        match self {
            Auto::Value(v) => v.clone(),
            Auto::Make(f) => f(),
        }
    }
}

impl From<Value> for Auto {
    fn from(v: Value) -> Auto {
        Auto::Value(v)
    }
}

/// One field's schema.
#[derive(Clone, Default)]
pub struct Var {
    /// Type name resolved against the registered kinds.
    pub kind: String,
    pub required: bool,
    pub nullable: bool,
    pub name: String,
    pub desc: String,
    pub default: Option<Auto>,
    /// Codec applied to the produced value (suppressed when `decode` ran).
    pub encode: String,
    /// Codec tried against the raw value before validation.
    pub decode: String,
    pub valid: Option<ValidFn>,
    pub value: Option<ValueFn>,
    pub children: Option<Vars>,
    pub options: Map,
    pub setting: Map,
    /// Result returned instead of the generated `_mapping_empty_<field>`.
    pub empty: Option<Res>,
    /// Result returned instead of the generated `_mapping_error_<field>`.
    pub error: Option<Res>,
}

impl Var {
    pub fn new(kind: &str) -> Var {
        Var { kind: kind.to_string(), ..Var::default() }
    }

    pub fn required(kind: &str) -> Var {
        Var { kind: kind.to_string(), required: true, ..Var::default() }
    }
}

/// Extend a base schema with overlays; later fields win.
pub fn vars_extend(mut base: Vars, extends: Vars) -> Vars {
    for (k, v) in extends {
        base.insert(k, v);
    }
    base
}

/// The slice of request context mapping needs: language for messages and a
/// fixed zone offset (seconds east of UTC) for time coercion.
#[derive(Clone, Default)]
pub struct MapCtx {
    pub lang: String,
    pub zone_secs: Option<i32>,
}

/// Walk `schema` over `data`, writing resolved fields into `out`.
///
/// `argn` relaxes required fields (update semantics: a present key with an
/// empty value writes null); `pass` lets offending fields through instead
/// of failing: empty ones land as null, invalid ones keep their raw value,
/// and neither is encoded. Returns the first offending result otherwise.
pub fn mapping(
    schema: &Vars,
    data: &Map,
    out: &mut Map,
    argn: bool,
    pass: bool,
    ctx: &MapCtx,
) -> Result<(), Res> {
    for (field, var) in schema {
        let mut decoded = false;
        let mut pass_empty = false;
        let mut pass_error = false;

        let exists = data.contains_key(field);
        let raw = data.get(field).cloned().unwrap_or(Value::Null);
        let text = defs::text_of(&raw);

        // normalize the notions of empty: null, empty string, and an empty
        // object on a non-required field
        let mut value = raw;
        if defs::is_empty(&value)
            || (!var.required && value.as_object().map(|o| o.is_empty()).unwrap_or(false))
        {
            value = Value::Null;
        }

        if var.required
            && !var.nullable
            && value.is_null()
            && var.default.is_none()
            && var.children.is_none()
            && !argn
        {
            if pass {
                pass_empty = true;
            } else {
                return Err(empty_result(field, var));
            }
        } else if value.is_null() {
            if let (Some(auto), false) = (&var.default, argn) {
                value = auto.materialize();
                // defaults are coerced but never validated
                if !var.kind.is_empty() || var.value.is_some() {
                    let coerce = var
                        .value
                        .clone()
                        .unwrap_or_else(|| BASIC.kind_value(&var.kind));
                    value = coerce(&value, var);
                }
            } else if var.nullable || argn {
                if argn && exists {
                    // update-to-null: the caller sent the key explicitly
                } else {
                    continue;
                }
            }
        } else {
            if !var.decode.is_empty() {
                if let Ok(plain) = codec::decrypt(&var.decode, &Value::String(text.clone())) {
                    value = plain;
                    // decode and encode are one-direction: a decoded field is
                    // never re-encoded in the same pass
                    decoded = true;
                }
            }

            if !var.kind.is_empty() || var.valid.is_some() {
                let valid = var
                    .valid
                    .clone()
                    .unwrap_or_else(|| BASIC.kind_valid(&var.kind));

                if valid(&value, var) {
                    if let Some(secs) = ctx.zone_secs {
                        shift_zone(&mut value, secs);
                    }
                    let coerce = var
                        .value
                        .clone()
                        .unwrap_or_else(|| BASIC.kind_value(&var.kind));
                    value = coerce(&value, var);
                } else if pass {
                    pass_error = true;
                } else {
                    return Err(error_result(field, var));
                }
            }
        }

        // child schemas: a non-empty value recurses per element; a required
        // empty object still walks children so their own rules apply
        let recursing = !(!var.required && value.is_null());
        if let (Some(children), true) = (&var.children, recursing) {
            let (rows, is_list) = match value {
                Value::Array(ref items) => (
                    items
                        .iter()
                        .filter_map(Value::as_object)
                        .cloned()
                        .collect::<Vec<_>>(),
                    true,
                ),
                Value::Object(ref one) => (vec![one.clone()], false),
                _ => (Vec::new(), false),
            };

            let mut converted = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut inner = Map::new();
                mapping(children, row, &mut inner, argn, pass, ctx)?;
                converted.push(Value::Object(inner));
            }

            value = if is_list {
                Value::Array(converted)
            } else {
                converted.into_iter().next().unwrap_or(json!({}))
            };
        }

        // a passed-through failure suppresses the encode, not the assignment
        if !var.encode.is_empty() && !decoded && !pass_empty && !pass_error {
            if let Ok(coded) = codec::encrypt(&var.encode, &value) {
                value = Value::String(coded);
            }
        }

        out.insert(field.clone(), value);
    }

    Ok(())
}

fn empty_result(field: &str, var: &Var) -> Res {
    if let Some(res) = &var.empty {
        return res.clone();
    }
    let key = format!("_mapping_empty_{field}");
    if basic::state_code(&key, -999) == -999 {
        result::state_with("_mapping_empty", vec![json!(label(field, var))])
    } else {
        result::state(key)
    }
}

fn error_result(field: &str, var: &Var) -> Res {
    if let Some(res) = &var.error {
        return res.clone();
    }
    let key = format!("_mapping_error_{field}");
    if basic::state_code(&key, -999) == -999 {
        result::state_with("_mapping_error", vec![json!(label(field, var))])
    } else {
        result::state(key)
    }
}

fn label(field: &str, var: &Var) -> String {
    if var.name.is_empty() {
        field.to_string()
    } else {
        var.name.clone()
    }
}

/// Rewrite RFC 3339 strings (and lists of them) into the given fixed offset.
fn shift_zone(value: &mut Value, secs: i32) {
    let Some(zone) = FixedOffset::east_opt(secs) else {
        return;
    };
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                *s = dt.with_timezone(&zone).to_rfc3339();
            }
        }
        Value::Array(items) => {
            for item in items {
                shift_zone(item, secs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::types;
    use crate::codec;
    use crate::map;
    use crate::result;

    fn setup() {
        result::builtin();
        types::builtin();
        codec::builtin();
    }

    fn schema(fields: &[(&str, Var)]) -> Vars {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn identity_schema_restricts_to_schema_keys() {
        setup();
        let vars = schema(&[("a", Var::new("string")), ("b", Var::new("int"))]);
        let data = map! { "a" => "hello", "b" => 42, "c" => "dropped" };

        let mut out = Map::new();
        mapping(&vars, &data, &mut out, false, false, &MapCtx::default()).unwrap();

        assert_eq!(out.get("a"), Some(&json!("hello")));
        assert_eq!(out.get("b"), Some(&json!(42)));
        assert!(!out.contains_key("c"));
    }

    #[test]
    fn required_empty_fails_with_field_state() {
        setup();
        let vars = schema(&[("x", Var::required("int"))]);
        let mut out = Map::new();
        let err = mapping(&vars, &Map::new(), &mut out, false, false, &MapCtx::default())
            .unwrap_err();
        assert_eq!(err.state(), "_mapping_empty");
        assert!(err.is_fail());
    }

    #[test]
    fn pass_keeps_offending_fields_unencoded() {
        setup();
        let mut invalid = Var::new("int");
        invalid.encode = "digit".into();
        let vars = schema(&[("x", Var::required("int")), ("y", invalid)]);
        let data = map! { "y" => "not-a-number" };

        let mut out = Map::new();
        mapping(&vars, &data, &mut out, false, true, &MapCtx::default()).unwrap();
        // the empty field lands as null, the invalid one keeps its raw
        // value and skips the encode
        assert_eq!(out.get("x"), Some(&Value::Null));
        assert_eq!(out.get("y"), Some(&json!("not-a-number")));
    }

    #[test]
    fn argn_relaxes_required_and_updates_to_null() {
        setup();
        let vars = schema(&[("x", Var::required("int")), ("y", Var::required("int"))]);
        let data = map! { "y" => "" };

        let mut out = Map::new();
        mapping(&vars, &data, &mut out, true, false, &MapCtx::default()).unwrap();
        assert!(!out.contains_key("x"));
        assert_eq!(out.get("y"), Some(&Value::Null));
    }

    #[test]
    fn defaults_materialize_and_coerce() {
        setup();
        let mut var = Var::required("int");
        var.default = Some(Auto::Value(json!("7")));
        let vars = schema(&[("n", var)]);

        let mut out = Map::new();
        mapping(&vars, &Map::new(), &mut out, false, false, &MapCtx::default()).unwrap();
        assert_eq!(out.get("n"), Some(&json!(7)));
    }

    #[test]
    fn producer_defaults_run_each_pass() {
        setup();
        let mut var = Var::new("string");
        var.required = true;
        var.default = Some(Auto::Make(Arc::new(|| json!("made"))));
        let vars = schema(&[("id", var)]);

        let mut out = Map::new();
        mapping(&vars, &Map::new(), &mut out, false, false, &MapCtx::default()).unwrap();
        assert_eq!(out.get("id"), Some(&json!("made")));
    }

    #[test]
    fn invalid_value_reports_error_state() {
        setup();
        let vars = schema(&[("n", Var::required("int"))]);
        let data = map! { "n" => "abc" };

        let mut out = Map::new();
        let err =
            mapping(&vars, &data, &mut out, false, false, &MapCtx::default()).unwrap_err();
        assert_eq!(err.state(), "_mapping_error");
    }

    #[test]
    fn custom_empty_result_wins() {
        setup();
        let custom = result::declare(7001, "profile_required", "profile required");
        let mut var = Var::required("json");
        var.kind = "string".into();
        var.empty = Some(custom.clone());
        let vars = schema(&[("p", var)]);

        let mut out = Map::new();
        let err = mapping(&vars, &Map::new(), &mut out, false, false, &MapCtx::default())
            .unwrap_err();
        assert_eq!(err.state(), "profile_required");
        assert_eq!(err.code(), 7001);
    }

    #[test]
    fn children_recurse_for_objects_and_lists() {
        setup();
        let child = schema(&[("id", Var::required("int"))]);

        let mut single = Var::required("json");
        single.children = Some(child.clone());
        let mut many = Var::new("[json]");
        many.children = Some(child);

        let vars = schema(&[("one", single), ("list", many)]);
        let data = map! {
            "one" => { "id": 3, "junk": true },
            "list" => [{ "id": 1 }, { "id": "2" }],
        };

        let mut out = Map::new();
        mapping(&vars, &data, &mut out, false, false, &MapCtx::default()).unwrap();

        assert_eq!(out.get("one"), Some(&json!({ "id": 3 })));
        assert_eq!(out.get("list"), Some(&json!([{ "id": 1 }, { "id": 2 }])));
    }

    #[test]
    fn child_failure_propagates() {
        setup();
        let child = schema(&[("id", Var::required("int"))]);
        let mut var = Var::required("json");
        var.children = Some(child);
        let vars = schema(&[("row", var)]);
        let data = map! { "row" => { "other": 1 } };

        let mut out = Map::new();
        let err =
            mapping(&vars, &data, &mut out, false, false, &MapCtx::default()).unwrap_err();
        assert_eq!(err.state(), "_mapping_empty");
    }

    #[test]
    fn decode_suppresses_encode() {
        setup();
        let secret = codec::encrypt("digit", &json!(12345)).unwrap();

        let mut var = Var::required("int");
        var.decode = "digit".into();
        var.encode = "digit".into();
        let vars = schema(&[("id", var)]);
        let data = map! { "id" => secret };

        let mut out = Map::new();
        mapping(&vars, &data, &mut out, false, false, &MapCtx::default()).unwrap();
        // decoded to the plain number and not re-encoded
        assert_eq!(out.get("id"), Some(&json!(12345)));
    }

    #[test]
    fn encode_applies_when_no_decode_happened() {
        setup();
        let mut var = Var::required("int");
        var.encode = "digit".into();
        let vars = schema(&[("id", var)]);
        let data = map! { "id" => 99 };

        let mut out = Map::new();
        mapping(&vars, &data, &mut out, false, false, &MapCtx::default()).unwrap();

        let coded = out.get("id").and_then(Value::as_str).unwrap().to_string();
        let back = codec::decrypt("digit", &json!(coded)).unwrap();
        assert_eq!(back, json!(99));
    }

    #[test]
    fn zone_conversion_applies_to_datetimes() {
        setup();
        let vars = schema(&[("at", Var::required("datetime"))]);
        let data = map! { "at" => "2026-01-01T00:00:00Z" };

        let ctx = MapCtx { lang: String::new(), zone_secs: Some(8 * 3600) };
        let mut out = Map::new();
        mapping(&vars, &data, &mut out, false, false, &ctx).unwrap();

        let shifted = out.get("at").and_then(Value::as_str).unwrap();
        assert!(shifted.contains("08:00:00"), "got {shifted}");
    }
}
