//! Named encoders/decoders and the id generator.
//!
//! Codecs are registered by name (plus aliases) and dispatched dynamically:
//! `marshal`/`unmarshal` for byte-serialized codecs (json, xml, toml) and
//! `encrypt`/`decrypt` for string-result codecs (digit, text) used by the
//! mapping engine for parameter obfuscation. The module also owns the
//! snowflake sequence used for request ids and token ids.

mod obfuscate;
mod snowflake;
mod xml;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use eyre::{eyre, Result};
use once_cell::sync::Lazy;

use crate::defs::{self, Map, Value};
use crate::kernel::{Module, Registry};

pub use obfuscate::{DigitCodec, TextCodec};
pub use snowflake::Snowflake;

pub static CODEC: Lazy<CodecModule> = Lazy::new(CodecModule::new);

pub type EncodeFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// A named encode/decode pair.
#[derive(Clone)]
pub struct Codec {
    pub name: String,
    pub desc: String,
    pub alias: Vec<String>,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

#[derive(Clone)]
pub struct CodecConfig {
    /// Alphabet for the text codec (64 URL-safe characters).
    pub text: String,
    /// Alphabet for the digit codec.
    pub digit: String,
    /// Salt mixed into both alphabets.
    pub salt: String,
    /// Minimum length of digit-encoded output.
    pub length: usize,
    /// Snowflake epoch, milliseconds since the Unix epoch.
    pub epoch_ms: i64,
    pub timebits: u32,
    pub nodebits: u32,
    pub stepbits: u32,
    pub node: i64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            text: "01234AaBbCcDdEeFfGgHhIiJjKkLlMmNnOoPpQqRrSsTtUuVvWwXxYyZz56789-_".into(),
            digit: "abcdefghijkmnpqrstuvwxyz123456789ACDEFGHJKLMNPQRSTUVWXYZ".into(),
            salt: "strata".into(),
            length: 7,
            // 2022-05-01T00:00:00Z
            epoch_ms: 1_651_363_200_000,
            timebits: 42,
            nodebits: 7,
            stepbits: 14,
            node: 0,
        }
    }
}

pub struct CodecModule {
    config: RwLock<CodecConfig>,
    codecs: RwLock<HashMap<String, Codec>>,
    fastid: RwLock<Option<Arc<Snowflake>>>,
}

impl CodecModule {
    pub fn new() -> CodecModule {
        CodecModule {
            config: RwLock::new(CodecConfig::default()),
            codecs: RwLock::new(HashMap::new()),
            fastid: RwLock::new(None),
        }
    }

    pub fn config(&self) -> CodecConfig {
        self.config.read().unwrap().clone()
    }

    pub fn codec(&self, name: &str, config: Codec, overwrite: bool) {
        let mut keys = Vec::new();
        if !name.is_empty() {
            keys.push(name.to_string());
        }
        keys.extend(config.alias.iter().cloned());

        let mut codecs = self.codecs.write().unwrap();
        for key in keys {
            if overwrite || !codecs.contains_key(&key) {
                codecs.insert(key, config.clone());
            }
        }
    }

    pub fn encode(&self, name: &str, value: &Value) -> Result<Value> {
        let name = name.to_lowercase();
        let codec = self
            .codecs
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| eyre!("invalid codec: {name}"))?;
        (codec.encode)(value)
    }

    pub fn decode(&self, name: &str, value: &Value) -> Result<Value> {
        let name = name.to_lowercase();
        let codec = self
            .codecs
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| eyre!("invalid codec: {name}"))?;
        (codec.decode)(value)
    }

    /// Byte serialization through a codec whose encode output is text.
    pub fn marshal(&self, name: &str, value: &Value) -> Result<Vec<u8>> {
        match self.encode(name, value)? {
            Value::String(s) => Ok(s.into_bytes()),
            _ => Err(eyre!("codec {name} produced non-serializable data")),
        }
    }

    pub fn unmarshal(&self, name: &str, data: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(data)?;
        self.decode(name, &Value::String(text.to_string()))
    }

    /// Encrypt to a plainly-transferable string.
    pub fn encrypt(&self, name: &str, value: &Value) -> Result<String> {
        match self.encode(name, value)? {
            Value::String(s) => Ok(s),
            other => Ok(defs::text_of(&other)),
        }
    }

    pub fn decrypt(&self, name: &str, value: &Value) -> Result<Value> {
        self.decode(name, value)
    }

    fn sequencer(&self) -> Arc<Snowflake> {
        if let Some(id) = self.fastid.read().unwrap().as_ref() {
            return id.clone();
        }
        let mut slot = self.fastid.write().unwrap();
        slot.get_or_insert_with(|| {
            let cfg = self.config.read().unwrap();
            Arc::new(Snowflake::new(
                cfg.timebits,
                cfg.nodebits,
                cfg.stepbits,
                cfg.epoch_ms,
                cfg.node,
            ))
        })
        .clone()
    }

    /// Strictly monotonic 64-bit id.
    pub fn sequence(&self) -> i64 {
        self.sequencer().next()
    }

    /// Digit-encoded form of the next sequence id, optionally prefixed.
    pub fn generate(&self, prefix: &str) -> String {
        let id = self.sequence();
        match self.encrypt("digit", &Value::from(id)) {
            Ok(s) => format!("{prefix}{s}"),
            Err(_) => format!("{prefix}{id}"),
        }
    }
}

impl Default for CodecModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for CodecModule {
    fn name(&self) -> &'static str {
        "codec"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        if let Registry::Codec(codec) = value {
            self.codec(name, codec.clone(), overwrite);
        }
    }

    fn configure(&self, config: &Map) {
        let Some(section) = defs::get_map(config, "codec") else {
            return;
        };
        let mut cfg = self.config.write().unwrap();

        if let Some(v) = defs::get_str(section, "text") {
            cfg.text = v;
        }
        if let Some(v) = defs::get_str(section, "digit") {
            cfg.digit = v;
        }
        if let Some(v) = defs::get_str(section, "salt") {
            cfg.salt = v;
        }
        if let Some(v) = defs::get_i64(section, "length") {
            cfg.length = v.max(0) as usize;
        }
        if let Some(v) = defs::get_i64(section, "start") {
            cfg.epoch_ms = v * 1000;
        }
        if let Some(v) = defs::get_i64(section, "timebits") {
            cfg.timebits = v as u32;
        }
        if let Some(v) = defs::get_i64(section, "nodebits") {
            cfg.nodebits = v as u32;
        }
        if let Some(v) = defs::get_i64(section, "stepbits") {
            cfg.stepbits = v as u32;
        }
        if let Some(v) = defs::get_i64(section, "node") {
            cfg.node = v;
        }
    }

    async fn initialize(&self) -> Result<()> {
        let cfg = self.config.read().unwrap().clone();
        *self.fastid.write().unwrap() = Some(Arc::new(Snowflake::new(
            cfg.timebits,
            cfg.nodebits,
            cfg.stepbits,
            cfg.epoch_ms,
            cfg.node,
        )));
        Ok(())
    }
}

/// Register the builtin codecs (json, xml, toml, digit, text) with
/// `override = false`.
pub fn builtin() {
    let json = Codec {
        name: "json".into(),
        desc: "json".into(),
        alias: vec![],
        encode: Arc::new(|v| Ok(Value::String(serde_json::to_string(v)?))),
        decode: Arc::new(|v| match v {
            Value::String(s) => Ok(serde_json::from_str(s)?),
            other => Ok(other.clone()),
        }),
    };
    CODEC.codec("json", json, false);

    let xml = Codec {
        name: "xml".into(),
        desc: "xml".into(),
        alias: vec![],
        encode: Arc::new(|v| Ok(Value::String(xml::to_xml(v)))),
        decode: Arc::new(|v| match v {
            Value::String(s) => xml::from_xml(s),
            other => Ok(other.clone()),
        }),
    };
    CODEC.codec("xml", xml, false);

    let toml = Codec {
        name: "toml".into(),
        desc: "toml".into(),
        alias: vec![],
        encode: Arc::new(|v| Ok(Value::String(toml::to_string(v)?))),
        decode: Arc::new(|v| match v {
            Value::String(s) => {
                let parsed: toml::Value = toml::from_str(s)?;
                Ok(serde_json::to_value(parsed)?)
            }
            other => Ok(other.clone()),
        }),
    };
    CODEC.codec("toml", toml, false);

    let digit = Codec {
        name: "digit".into(),
        desc: "salted alphabet numbers".into(),
        alias: vec!["digits".into()],
        encode: Arc::new(|v| {
            let cfg = CODEC.config();
            DigitCodec::new(&cfg.digit, &cfg.salt, cfg.length).encode(v)
        }),
        decode: Arc::new(|v| {
            let cfg = CODEC.config();
            DigitCodec::new(&cfg.digit, &cfg.salt, cfg.length).decode(v)
        }),
    };
    CODEC.codec("digit", digit, false);

    let text = Codec {
        name: "text".into(),
        desc: "salted alphabet text".into(),
        alias: vec!["texts".into()],
        encode: Arc::new(|v| {
            let cfg = CODEC.config();
            TextCodec::new(&cfg.text, &cfg.salt).encode(v)
        }),
        decode: Arc::new(|v| {
            let cfg = CODEC.config();
            TextCodec::new(&cfg.text, &cfg.salt).decode(v)
        }),
    };
    CODEC.codec("text", text, false);
}

// module-level entry points

pub fn encode(name: &str, value: &Value) -> Result<Value> {
    CODEC.encode(name, value)
}

pub fn decode(name: &str, value: &Value) -> Result<Value> {
    CODEC.decode(name, value)
}

pub fn marshal(name: &str, value: &Value) -> Result<Vec<u8>> {
    CODEC.marshal(name, value)
}

pub fn unmarshal(name: &str, data: &[u8]) -> Result<Value> {
    CODEC.unmarshal(name, data)
}

pub fn encrypt(name: &str, value: &Value) -> Result<String> {
    CODEC.encrypt(name, value)
}

pub fn decrypt(name: &str, value: &Value) -> Result<Value> {
    CODEC.decrypt(name, value)
}

pub fn marshal_json(value: &Value) -> Result<Vec<u8>> {
    CODEC.marshal("json", value)
}

pub fn unmarshal_json(data: &[u8]) -> Result<Value> {
    CODEC.unmarshal("json", data)
}

pub fn encrypt_digit(n: i64) -> Result<String> {
    CODEC.encrypt("digit", &Value::from(n))
}

pub fn decrypt_digit(s: &str) -> Result<i64> {
    match CODEC.decrypt("digit", &Value::String(s.to_string()))? {
        Value::Number(n) => n.as_i64().ok_or_else(|| eyre!("invalid digit data")),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| eyre!("invalid digit data")),
        _ => Err(eyre!("invalid digit data")),
    }
}

pub fn encrypt_digits(ns: &[i64]) -> Result<String> {
    CODEC.encrypt("digit", &serde_json::json!(ns))
}

pub fn decrypt_digits(s: &str) -> Result<Vec<i64>> {
    match CODEC.decrypt("digit", &Value::String(s.to_string()))? {
        Value::Number(n) => Ok(vec![n.as_i64().ok_or_else(|| eyre!("invalid digit data"))?]),
        Value::Array(items) => Ok(items.iter().filter_map(Value::as_i64).collect()),
        _ => Err(eyre!("invalid digit data")),
    }
}

pub fn encrypt_text(s: &str) -> Result<String> {
    CODEC.encrypt("text", &Value::String(s.to_string()))
}

pub fn decrypt_text(s: &str) -> Result<String> {
    match CODEC.decrypt("text", &Value::String(s.to_string()))? {
        Value::String(s) => Ok(s),
        _ => Err(eyre!("invalid text data")),
    }
}

pub fn encrypt_texts(items: &[String]) -> Result<String> {
    CODEC.encrypt("text", &serde_json::json!(items))
}

pub fn decrypt_texts(s: &str) -> Result<Vec<String>> {
    match CODEC.decrypt("text", &Value::String(s.to_string()))? {
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()),
        _ => Err(eyre!("invalid text data")),
    }
}

pub fn sequence() -> i64 {
    CODEC.sequence()
}

pub fn generate(prefix: &str) -> String {
    CODEC.generate(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_roundtrip() {
        builtin();
        let v = json!({ "a": 1, "b": ["x", "y"] });
        let bytes = marshal("json", &v).unwrap();
        assert_eq!(unmarshal("json", &bytes).unwrap(), v);
    }

    #[test]
    fn toml_codec_roundtrip() {
        builtin();
        let v = json!({ "name": "demo", "port": 8080 });
        let text = encrypt("toml", &v).unwrap();
        let back = decrypt("toml", &json!(text)).unwrap();
        assert_eq!(back.get("name"), Some(&json!("demo")));
        assert_eq!(back.get("port"), Some(&json!(8080)));
    }

    #[test]
    fn digit_roundtrip_single_and_list() {
        builtin();
        for n in [0i64, 1, 42, 123_456_789, i64::MAX, -7] {
            let coded = encrypt_digit(n).unwrap();
            assert!(coded.len() >= CODEC.config().length, "short code {coded}");
            assert_eq!(decrypt_digit(&coded).unwrap(), n);
        }

        let list = vec![1i64, 2, 30_000];
        let coded = encrypt_digits(&list).unwrap();
        assert_eq!(decrypt_digits(&coded).unwrap(), list);
    }

    #[test]
    fn text_roundtrip_single_and_list() {
        builtin();
        for s in ["", "hello", "带中文的字符串", "{\"json\":true}"] {
            let coded = encrypt_text(s).unwrap();
            assert_eq!(decrypt_text(&coded).unwrap(), s);
        }

        let items = vec!["a".to_string(), "b c".to_string()];
        let coded = encrypt_texts(&items).unwrap();
        assert_eq!(decrypt_texts(&coded).unwrap(), items);
    }

    #[test]
    fn unknown_codec_errors() {
        builtin();
        assert!(encode("nope", &json!(1)).is_err());
    }

    #[test]
    fn generate_is_digit_decodable() {
        builtin();
        let id = generate("u");
        assert!(id.starts_with('u'));
        assert!(decrypt_digit(&id[1..]).unwrap() > 0);
    }
}
