//! The staged request gates.
//!
//! A matched route runs these in fixed order, short-circuiting to the
//! `failed` or `denied` funnel: form parsing, client-signature validation,
//! argument mapping, token auth, session-sign lookups and entity finds.

use std::collections::HashMap;
use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::basic::{self, mapping, Var, Vars};
use crate::codec;
use crate::defs::{self, Map, Value};
use crate::http::access::Access;
use crate::http::body::Body;
use crate::result::{self, Res, INVALID, UNAUTHORIZED};
use crate::utils;

const FORM_LIMIT: usize = 32 << 20;

static DATA_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:(.*);base64,(.*)$").expect("data uri pattern"));

impl Access {
    /// Materialize `value` from uri params, query string and request body;
    /// collect uploads; detect ajax; negotiate the language.
    pub(crate) async fn form_handler(&mut self) -> Result<(), Res> {
        for (k, v) in self.params.clone() {
            self.value.insert(k, v);
        }

        let query = self
            .thread
            .as_ref()
            .map(|t| t.query())
            .unwrap_or_default();
        for (key, value) in parse_pairs(&query) {
            self.query.insert(key.clone(), value.clone());
            self.value.insert(key, value);
        }

        if !self.ajax {
            self.ajax = !self.req_header("x-requested-with").is_empty()
                || !self.req_header("ajax").is_empty();
        }

        self.negotiate_lang();

        let mut uploads: HashMap<String, Vec<Map>> = HashMap::new();

        if self.method != "GET" {
            let ctype = self.req_header("content-type");
            let bytes = match self.thread.as_mut() {
                Some(thread) => thread.body().await.unwrap_or_default(),
                None => Bytes::new(),
            };
            if bytes.len() > FORM_LIMIT {
                return Err(INVALID.clone());
            }

            if ctype.contains("json") {
                self.body = Body::Raw(bytes.clone());
                if let Ok(Value::Object(parsed)) = serde_json::from_slice::<Value>(&bytes) {
                    for (k, v) in parsed {
                        self.collect_data_uploads(&k, &v, &mut uploads);
                        self.form.insert(k.clone(), v.clone());
                        self.value.insert(k, v);
                    }
                }
            } else if ctype.contains("xml") {
                self.body = Body::Raw(bytes.clone());
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    if let Ok(Value::Object(parsed)) =
                        codec::decode("xml", &Value::String(text.to_string()))
                    {
                        for (k, v) in parsed {
                            self.form.insert(k.clone(), v.clone());
                            self.value.insert(k, v);
                        }
                    }
                }
            } else if ctype.contains("multipart/form-data") {
                self.multipart_handler(&ctype, bytes, &mut uploads).await?;
            } else if !bytes.is_empty() {
                let text = String::from_utf8_lossy(&bytes).to_string();
                self.urlencoded_handler(&text, &mut uploads);
            }
        }

        for (k, mut files) in uploads {
            let value = if files.len() == 1 {
                Value::Object(files.remove(0))
            } else {
                Value::Array(files.into_iter().map(Value::Object).collect())
            };
            self.upload.insert(k.clone(), value.clone());
            self.value.insert(k, value);
        }

        Ok(())
    }

    async fn multipart_handler(
        &mut self,
        ctype: &str,
        bytes: Bytes,
        uploads: &mut HashMap<String, Vec<Map>>,
    ) -> Result<(), Res> {
        let boundary = multer::parse_boundary(ctype).map_err(|_| INVALID.clone())?;
        let stream =
            futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(bytes) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut names: Vec<String> = Vec::new();
        let mut values: HashMap<String, Vec<String>> = HashMap::new();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|_| INVALID.clone())?
        {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let mime = field.content_type().map(|m| m.to_string());

            let data = field.bytes().await.map_err(|_| INVALID.clone())?;

            match file_name {
                Some(file_name) if !file_name.is_empty() => {
                    if data.is_empty() {
                        continue;
                    }
                    let extension = file_name
                        .rsplit_once('.')
                        .map(|(_, ext)| ext.to_lowercase())
                        .unwrap_or_default();
                    let mime = mime
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| basic::mimetype(&extension, ""));

                    if let Some(record) = self.spool_upload(&file_name, &extension, &mime, &data) {
                        uploads.entry(name).or_default().push(record);
                    }
                }
                _ => {
                    let text = String::from_utf8_lossy(&data).to_string();
                    if !names.contains(&name) {
                        names.push(name.clone());
                    }
                    values.entry(name).or_default().push(text);
                }
            }
        }

        for (name, entry) in &values {
            let value = fold_values(entry);
            self.form.insert(name.clone(), value);

            let files = self.decode_data_uris(entry);
            if !files.is_empty() {
                uploads.insert(name.clone(), files);
            }
        }

        self.fold_nested(&names, &values);
        Ok(())
    }

    fn urlencoded_handler(&mut self, body: &str, uploads: &mut HashMap<String, Vec<Map>>) {
        let mut names: Vec<String> = Vec::new();
        let mut values: HashMap<String, Vec<String>> = HashMap::new();

        for (key, value) in form_urlencoded::parse(body.as_bytes()) {
            let key = key.to_string();
            if !names.contains(&key) {
                names.push(key.clone());
            }
            values.entry(key).or_default().push(value.to_string());
        }

        for (name, entry) in &values {
            self.form.insert(name.clone(), fold_values(entry));

            let files = self.decode_data_uris(entry);
            if !files.is_empty() {
                uploads.insert(name.clone(), files);
            }
        }

        self.fold_nested(&names, &values);
    }

    /// Fold flat and dotted form keys into `value`: `a.b=1` nests, repeated
    /// peer groups of equal length become lists of maps.
    fn fold_nested(&mut self, names: &[String], values: &HashMap<String, Vec<String>>) {
        let mut grouped: Vec<(String, Vec<(String, Vec<String>)>)> = Vec::new();

        for name in names {
            let entry = values.get(name).cloned().unwrap_or_default();

            match name.rsplit_once('.') {
                None => {
                    self.value.insert(name.clone(), fold_values(&entry));
                }
                Some((key, field)) => {
                    match grouped.iter_mut().find(|(k, _)| k.as_str() == key) {
                        Some((_, fields)) => fields.push((field.to_string(), entry)),
                        None => grouped.push((
                            key.to_string(),
                            vec![(field.to_string(), entry)],
                        )),
                    }
                }
            }
        }

        for (key, fields) in grouped {
            // equal-length multi-value groups read as a list of records
            let lengths: Vec<usize> = fields.iter().map(|(_, v)| v.len()).collect();
            let uniform = lengths.iter().all(|l| *l == lengths[0]);

            let folded = if uniform && lengths[0] > 1 {
                let rows = (0..lengths[0])
                    .map(|i| {
                        let mut row = Map::new();
                        for (field, entry) in &fields {
                            row.insert(field.clone(), Value::String(entry[i].clone()));
                        }
                        Value::Object(row)
                    })
                    .collect();
                Value::Array(rows)
            } else {
                let mut row = Map::new();
                for (field, entry) in &fields {
                    row.insert(field.clone(), fold_values(entry));
                }
                Value::Object(row)
            };

            insert_path(&mut self.value, &key, folded);
        }
    }

    fn collect_data_uploads(
        &mut self,
        name: &str,
        value: &Value,
        uploads: &mut HashMap<String, Vec<Map>>,
    ) {
        let candidates: Vec<String> = match value {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => return,
        };

        let files = self.decode_data_uris(&candidates);
        if !files.is_empty() {
            uploads.insert(name.to_string(), files);
        }
    }

    /// Decode `data:<mime>;base64,<bytes>` form values into upload records.
    fn decode_data_uris(&mut self, values: &[String]) -> Vec<Map> {
        let mut files = Vec::new();
        for value in values {
            let Some(captures) = DATA_URI.captures(value) else {
                continue;
            };
            let mime = captures[1].to_string();
            let Ok(bytes) = STANDARD.decode(&captures[2]) else {
                continue;
            };

            let extension = basic::extension(&mime, "");
            let hash = utils::sha1_hex(&bytes);
            let file_name = if extension.is_empty() {
                hash.clone()
            } else {
                format!("{hash}.{extension}")
            };

            if let Some(record) = self.spool_upload(&file_name, &extension, &mime, &bytes) {
                files.push(record);
            }
        }
        files
    }

    fn spool_upload(
        &mut self,
        file_name: &str,
        extension: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Option<Map> {
        let hash = utils::sha1_hex(bytes);
        let (mut file, path) = self.context.temp_file(extension).ok()?;
        file.write_all(bytes).ok()?;

        Some(map! {
            "hash" => hash,
            "name" => file_name,
            "type" => extension.to_lowercase(),
            "mime" => mime,
            "size" => bytes.len() as i64,
            "file" => path.to_string_lossy().to_string(),
        })
    }

    /// Validate the `Client` signature header against the site's canonical
    /// format string and time window. Opt-in via `site.validate`; a route
    /// `passport` setting or a `Debug` header waives the check.
    pub(crate) fn client_handler(&mut self) -> Result<(), Res> {
        let mut checking = !self.site_config.validate.is_empty();

        if defs::get_bool(&self.setting, "passport") == Some(true) {
            checking = false;
        }
        if let Some(validate) = defs::get_bool(&self.setting, "validate") {
            checking = validate;
        }
        if !self.req_header("debug").is_empty() {
            checking = false;
        }

        let header = self.req_header("client").trim().to_string();
        if header.is_empty() {
            return if checking { Err(INVALID.clone()) } else { Ok(()) };
        }

        // the header itself rides through the site's validate codec
        let mut schema = Vars::new();
        let mut var = Var::required("string");
        var.decode = self.site_config.validate.clone();
        schema.insert("client".into(), var);

        let data = map! { "client" => header };
        let mut out = Map::new();
        if mapping(&schema, &data, &mut out, false, false, &self.context.map_ctx()).is_err() {
            return Err(INVALID.clone());
        }

        let client = defs::get_str(&out, "client").unwrap_or_default();
        let parts: Vec<&str> = client.split('/').collect();
        if parts.len() < 7 {
            return if checking { Err(INVALID.clone()) } else { Ok(()) };
        }

        for (i, key) in ["device", "system", "version", "client", "number", "time", "sign"]
            .iter()
            .enumerate()
        {
            self.client
                .insert((*key).to_string(), Value::String(parts[i].to_string()));
        }

        let mut format = self.site_config.format.clone();
        if format.is_empty() {
            format = "{device}/{system}/{version}/{client}/{number}/{time}/{path}".into();
        }
        for (marker, value) in [
            ("{device}", parts[0]),
            ("{system}", parts[1]),
            ("{version}", parts[2]),
            ("{client}", parts[3]),
            ("{number}", parts[4]),
            ("{time}", parts[5]),
            ("{path}", &self.path),
        ] {
            format = format.replace(marker, value);
        }

        let expected = utils::md5_hex(&format).to_lowercase();
        if expected != parts[6] && checking {
            return Err(INVALID.clone());
        }

        if let Some(timeout) = self.site_config.timeout {
            let Ok(stamp) = parts[5].parse::<i64>() else {
                return Err(INVALID.clone());
            };
            if stamp + (timeout.as_secs() as i64) < Utc::now().timestamp() {
                return Err(INVALID.clone());
            }
        }

        Ok(())
    }

    /// Map the merged `value` through the route's argument schema.
    pub(crate) fn args_handler(&mut self) -> Result<(), Res> {
        if self.config.args.is_empty() {
            return Ok(());
        }

        let mut args = Map::new();
        mapping(
            &self.config.args,
            &self.value,
            &mut args,
            self.config.nullable,
            false,
            &self.context.map_ctx(),
        )?;

        for (k, v) in args {
            self.args.insert(k, v);
        }
        Ok(())
    }

    /// Token gate: a `token` route needs any valid token, an `auth` route
    /// needs an authenticated one.
    pub(crate) fn auth_handler(&mut self) -> Result<(), Res> {
        if self.config.token && self.context.token.is_empty() {
            return Err(UNAUTHORIZED.clone());
        }
        if self.config.auth && !self.context.authorized() {
            return Err(UNAUTHORIZED.clone());
        }
        Ok(())
    }

    /// Session-sign gate: each configured key must be signed in when
    /// required; a configured method loads the signed record into `sign`.
    pub(crate) async fn sign_handler(&mut self) -> Result<(), Res> {
        if self.config.sign.is_empty() {
            return Ok(());
        }

        let rules = self.config.sign.clone();
        let mut loaded = Map::new();

        for (key, rule) in rules {
            let sign_key = if rule.sign.is_empty() { key.clone() } else { rule.sign.clone() };

            if self.signed(&sign_key) {
                if !rule.method.is_empty() {
                    let args = if rule.args.is_empty() { "id".to_string() } else { rule.args.clone() };
                    let id = self.signal(&sign_key);

                    let value = map! { args => id };
                    let item = self.context.invoke(&rule.method, value).await;
                    match item {
                        Some(item) => {
                            loaded.insert(key.clone(), Value::Object(item));
                        }
                        None if rule.required => {
                            return Err(rule
                                .error
                                .clone()
                                .unwrap_or_else(|| result::state(format!("_auth_error_{key}"))));
                        }
                        None => {}
                    }
                }
            } else if rule.required {
                return Err(rule
                    .empty
                    .clone()
                    .unwrap_or_else(|| result::state(format!("_auth_empty_{key}"))));
            }
        }

        for (k, v) in loaded {
            self.sign.insert(k, v);
        }
        Ok(())
    }

    /// Entity gate: resolve each configured lookup value and load the
    /// record through its method into `item`.
    pub(crate) async fn item_handler(&mut self) -> Result<(), Res> {
        if self.config.find.is_empty() {
            return Ok(());
        }

        let rules = self.config.find.clone();
        let mut loaded = Map::new();

        for (key, rule) in rules {
            let value_key = if rule.value.is_empty() { "id".to_string() } else { rule.value.clone() };

            let lookup = self
                .args
                .get(&value_key)
                .or_else(|| self.value.get(&value_key))
                .cloned();

            let Some(lookup) = lookup.filter(|v| !v.is_null()) else {
                if rule.required {
                    return Err(rule
                        .empty
                        .clone()
                        .unwrap_or_else(|| result::state(format!("_item_empty_{key}"))));
                }
                continue;
            };

            if rule.method.is_empty() {
                continue;
            }

            let args = if rule.args.is_empty() { "id".to_string() } else { rule.args.clone() };
            let value = map! { args => lookup };
            let item = self.context.invoke(&rule.method, value).await;

            match item {
                Some(item) => {
                    loaded.insert(key.clone(), Value::Object(item));
                }
                None if rule.required => {
                    let state_key = format!("_item_error_{}", key.replace('.', "_"));
                    return Err(rule
                        .error
                        .clone()
                        .unwrap_or_else(|| result::state(state_key)));
                }
                None => {}
            }
        }

        for (k, v) in loaded {
            self.item.insert(k, v);
        }
        Ok(())
    }
}

fn parse_pairs(query: &str) -> Vec<(String, Value)> {
    let mut names: Vec<String> = Vec::new();
    let mut values: HashMap<String, Vec<String>> = HashMap::new();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let key = key.to_string();
        if !names.contains(&key) {
            names.push(key.clone());
        }
        values.entry(key).or_default().push(value.to_string());
    }

    names
        .into_iter()
        .map(|name| {
            let entry = values.remove(&name).unwrap_or_default();
            (name, fold_values(&entry))
        })
        .collect()
}

fn fold_values(values: &[String]) -> Value {
    if values.len() == 1 {
        Value::String(values[0].clone())
    } else {
        Value::Array(values.iter().cloned().map(Value::String).collect())
    }
}

/// Insert at a dotted path, creating intermediate objects.
fn insert_path(map: &mut Map, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = map;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
        current = entry.as_object_mut().expect("object entry");
    }
}

use crate::map;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_keys_nest_and_repeat_into_lists() {
        let mut value = Map::new();
        insert_path(&mut value, "a.b", json!({ "x": "1" }));
        assert_eq!(value["a"]["b"]["x"], json!("1"));
    }

    #[test]
    fn fold_values_single_vs_list() {
        assert_eq!(fold_values(&["a".into()]), json!("a"));
        assert_eq!(
            fold_values(&["a".into(), "b".into()]),
            json!(["a", "b"])
        );
    }

    #[test]
    fn pairs_accumulate_repeats() {
        let pairs = parse_pairs("x=1&y=2&x=3");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("x".to_string(), json!(["1", "3"])));
        assert_eq!(pairs[1], ("y".to_string(), json!("2")));
    }
}
