//! Foundation registries: state codes, localized strings, MIME types,
//! named regular expressions and parameter types.
//!
//! Every registry is process-wide, built during the register/configure phase
//! and effectively immutable once the kernel has launched. Later writers win
//! unless a registration asks not to override.

pub mod mapping;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::defs::{self, Map, Value};
use crate::kernel::{Module, Registry};

pub use mapping::{mapping, vars_extend, Auto, MapCtx, Var, Vars};

/// The fallback language key.
pub const DEFAULT: &str = "default";

pub static BASIC: Lazy<BasicModule> = Lazy::new(BasicModule::new);

pub type ValidFn = Arc<dyn Fn(&Value, &Var) -> bool + Send + Sync>;
pub type ValueFn = Arc<dyn Fn(&Value, &Var) -> Value + Send + Sync>;

/// A named parameter type: how a field validates and how its value is
/// coerced. The default validator is a regex match against the regular of
/// the same name; the default coercer is string conversion.
#[derive(Clone, Default)]
pub struct Kind {
    pub name: String,
    pub desc: String,
    pub alias: Vec<String>,
    pub setting: Map,
    pub valid: Option<ValidFn>,
    pub value: Option<ValueFn>,
}

/// Per-language metadata, used for `Accept-Language` negotiation.
#[derive(Clone, Default)]
pub struct LangConfig {
    pub name: String,
    pub desc: String,
    pub accepts: Vec<String>,
}

pub struct BasicModule {
    lang_configs: RwLock<HashMap<String, LangConfig>>,
    states: RwLock<HashMap<String, i64>>,
    langs: RwLock<HashMap<String, String>>,
    mimes: RwLock<HashMap<String, String>>,
    regulars: RwLock<HashMap<String, Vec<String>>>,
    kinds: RwLock<HashMap<String, Kind>>,
}

impl BasicModule {
    pub fn new() -> BasicModule {
        BasicModule {
            lang_configs: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            langs: RwLock::new(HashMap::new()),
            mimes: RwLock::new(HashMap::new()),
            regulars: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
        }
    }

    pub fn state(&self, name: &str, code: i64, overwrite: bool) {
        let mut states = self.states.write().unwrap();
        if overwrite || !states.contains_key(name) {
            states.insert(name.to_string(), code);
        }
    }

    pub fn state_code(&self, name: &str, def: i64) -> i64 {
        self.states
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(def)
    }

    /// Register localized strings. Keys are stored as `"<lang>.<key>"` with
    /// dots in the key normalized to underscores, which keeps language
    /// resource files flat.
    pub fn lang(&self, lang: &str, strings: &HashMap<String, String>, overwrite: bool) {
        let mut langs = self.langs.write().unwrap();
        for (k, v) in strings {
            let key = format!("{}.{}", lang, k.replace('.', "_"));
            if overwrite || !langs.contains_key(&key) {
                langs.insert(key, v.clone());
            }
        }
    }

    pub fn lang_config(&self, name: &str, config: LangConfig) {
        self.lang_configs
            .write()
            .unwrap()
            .insert(name.to_string(), config);
    }

    pub fn lang_configs(&self) -> HashMap<String, LangConfig> {
        self.lang_configs.read().unwrap().clone()
    }

    /// Look up a localized string, falling back to the default language and
    /// finally to the key itself. Format arguments substitute `%v`-style
    /// markers only when their count matches.
    pub fn string(&self, lang: &str, name: &str, args: &[Value]) -> String {
        let lang = if lang.is_empty() { DEFAULT } else { lang };
        let name = name.replace('.', "_");

        let langs = self.langs.read().unwrap();
        let text = langs
            .get(&format!("{lang}.{name}"))
            .or_else(|| langs.get(&format!("{DEFAULT}.{name}")))
            .cloned()
            .unwrap_or(name);

        format_text(&text, args)
    }

    pub fn mime(&self, config: &HashMap<String, String>, overwrite: bool) {
        let mut mimes = self.mimes.write().unwrap();
        for (k, v) in config {
            if overwrite || !mimes.contains_key(k) {
                mimes.insert(k.clone(), v.clone());
            }
        }
    }

    /// MIME type for an extension. Values that already look like a MIME type
    /// pass through; a registered `"*"` entry catches unmatched extensions.
    pub fn mimetype(&self, ext: &str, def: &str) -> String {
        if ext.contains('/') {
            return ext.to_string();
        }
        let ext = ext.trim_start_matches('.');

        let mimes = self.mimes.read().unwrap();
        if let Some(mime) = mimes.get(ext) {
            return mime.clone();
        }
        if let Some(mime) = mimes.get("*") {
            return mime.clone();
        }
        if def.is_empty() {
            "application/octet-stream".to_string()
        } else {
            def.to_string()
        }
    }

    /// Reverse lookup: extension for a MIME type.
    pub fn extension(&self, mime: &str, def: &str) -> String {
        let mimes = self.mimes.read().unwrap();
        for (ext, m) in mimes.iter() {
            if m.eq_ignore_ascii_case(mime) {
                return ext.clone();
            }
        }
        def.to_string()
    }

    pub fn regular(&self, config: &HashMap<String, Vec<String>>, overwrite: bool) {
        let mut regulars = self.regulars.write().unwrap();
        for (k, v) in config {
            if overwrite || !regulars.contains_key(k) {
                regulars.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn expressions(&self, name: &str) -> Vec<String> {
        self.regulars
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// A value matches a regular when any of its patterns matches.
    pub fn matches(&self, regular: &str, value: &str) -> bool {
        for pattern in self.expressions(regular) {
            if let Ok(re) = Regex::new(&pattern) {
                if re.is_match(value) {
                    return true;
                }
            }
        }
        false
    }

    pub fn kind(&self, name: &str, config: Kind, overwrite: bool) {
        let mut keys = Vec::new();
        if !name.is_empty() {
            keys.push(name.to_string());
        }
        keys.extend(config.alias.iter().cloned());

        let mut kinds = self.kinds.write().unwrap();
        for key in keys {
            if overwrite || !kinds.contains_key(&key) {
                kinds.insert(key, config.clone());
            }
        }
    }

    pub fn kinds(&self) -> HashMap<String, Kind> {
        self.kinds.read().unwrap().clone()
    }

    /// The validator for a type: the registered one, or a regex match on the
    /// type name.
    pub(crate) fn kind_valid(&self, name: &str) -> ValidFn {
        if let Some(kind) = self.kinds.read().unwrap().get(name) {
            if let Some(valid) = &kind.valid {
                return valid.clone();
            }
        }
        let name = name.to_string();
        Arc::new(move |value, _var| BASIC.matches(&name, &defs::text_of(value)))
    }

    /// The coercer for a type: the registered one, or string conversion.
    pub(crate) fn kind_value(&self, name: &str) -> ValueFn {
        if let Some(kind) = self.kinds.read().unwrap().get(name) {
            if let Some(value) = &kind.value {
                return value.clone();
            }
        }
        Arc::new(|value, _var| Value::String(defs::text_of(value)))
    }

    fn configure_lang(&self, name: &str, config: &Map) {
        let mut lang = self
            .lang_configs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();

        if let Some(v) = defs::get_str(config, "name") {
            lang.name = v;
        }
        if let Some(v) = defs::get_str(config, "text") {
            lang.desc = v;
        }
        if let Some(v) = defs::get_str_list(config, "accept", "accepts") {
            lang.accepts = v;
        }
        self.lang_config(name, lang);
    }
}

impl Default for BasicModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for BasicModule {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        match value {
            Registry::State(code) => self.state(name, *code, overwrite),
            Registry::States(states) => {
                for (k, v) in states {
                    self.state(k, *v, overwrite);
                }
            }
            Registry::Lang { lang, strings } => self.lang(lang, strings, overwrite),
            Registry::Mime(config) => self.mime(config, overwrite),
            Registry::Regular(config) => self.regular(config, overwrite),
            Registry::Kind(kind) => self.kind(name, kind.clone(), overwrite),
            _ => {}
        }
    }

    fn configure(&self, config: &Map) {
        let Some(section) = defs::get_map(config, "lang") else {
            return;
        };

        // named blocks configure individual languages; loose keys configure
        // the default language
        let mut flat = Map::new();
        for (key, val) in section {
            if let Some(conf) = val.as_object() {
                self.configure_lang(key, conf);
            } else {
                flat.insert(key.clone(), val.clone());
            }
        }
        if !flat.is_empty() {
            self.configure_lang(DEFAULT, &flat);
        }
    }
}

fn format_text(text: &str, args: &[Value]) -> String {
    if args.is_empty() {
        return text.to_string();
    }

    let markers = text.matches('%').count() - 2 * text.matches("%%").count();
    if markers != args.len() {
        return text.to_string();
    }

    let mut out = text.to_string();
    for arg in args {
        let rendered = defs::text_of(arg);
        let earliest = ["%v", "%s", "%d"]
            .iter()
            .filter_map(|m| out.find(m))
            .min();
        if let Some(pos) = earliest {
            out.replace_range(pos..pos + 2, &rendered);
        }
    }
    out.replace("%%", "%")
}

// module-level accessors, used everywhere a registry lookup is needed

pub fn state_code(name: &str, def: i64) -> i64 {
    BASIC.state_code(name, def)
}

pub fn string(lang: &str, name: &str, args: &[Value]) -> String {
    BASIC.string(lang, name, args)
}

pub fn mimetype(ext: &str, def: &str) -> String {
    BASIC.mimetype(ext, def)
}

pub fn extension(mime: &str, def: &str) -> String {
    BASIC.extension(mime, def)
}

pub fn expressions(name: &str) -> Vec<String> {
    BASIC.expressions(name)
}

pub fn matches(regular: &str, value: &str) -> bool {
    BASIC.matches(regular, value)
}

pub fn register_state(name: &str, code: i64, overwrite: bool) {
    BASIC.state(name, code, overwrite);
}

pub fn register_lang(lang: &str, key: &str, text: &str, overwrite: bool) {
    let mut strings = HashMap::new();
    strings.insert(key.to_string(), text.to_string());
    BASIC.lang(lang, &strings, overwrite);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_codes_with_default() {
        let module = BasicModule::new();
        module.state("ok", 0, true);
        module.state("denied", 401, true);
        assert_eq!(module.state_code("denied", -1), 401);
        assert_eq!(module.state_code("unknown", -1), -1);
    }

    #[test]
    fn override_false_keeps_first_writer() {
        let module = BasicModule::new();
        module.state("x", 1, true);
        module.state("x", 2, false);
        assert_eq!(module.state_code("x", -1), 1);
        module.state("x", 3, true);
        assert_eq!(module.state_code("x", -1), 3);
    }

    #[test]
    fn lang_keys_normalize_dots() {
        let module = BasicModule::new();
        let mut strings = HashMap::new();
        strings.insert("user.missing".to_string(), "user %v missing".to_string());
        module.lang(DEFAULT, &strings, true);

        let text = module.string("", "user.missing", &[json!("neo")]);
        assert_eq!(text, "user neo missing");
        // falls back to the key itself when unknown
        assert_eq!(module.string("", "no.such", &[]), "no_such");
    }

    #[test]
    fn lang_falls_back_to_default_language() {
        let module = BasicModule::new();
        let mut strings = HashMap::new();
        strings.insert("greet".to_string(), "hello".to_string());
        module.lang(DEFAULT, &strings, true);
        assert_eq!(module.string("zh", "greet", &[]), "hello");
    }

    #[test]
    fn mimetype_lookup_and_catch_all() {
        let module = BasicModule::new();
        let mut mimes = HashMap::new();
        mimes.insert("png".to_string(), "image/png".to_string());
        mimes.insert("*".to_string(), "application/octet-stream".to_string());
        module.mime(&mimes, true);

        assert_eq!(module.mimetype("png", ""), "image/png");
        assert_eq!(module.mimetype(".png", ""), "image/png");
        assert_eq!(module.mimetype("zzz", ""), "application/octet-stream");
        assert_eq!(module.mimetype("text/plain", ""), "text/plain");
        assert_eq!(module.extension("image/PNG", ""), "png");
    }

    #[test]
    fn regular_any_pattern_matches() {
        let module = BasicModule::new();
        let mut regulars = HashMap::new();
        regulars.insert(
            "code".to_string(),
            vec!["^[a-z]+$".to_string(), "^[0-9]+$".to_string()],
        );
        module.regular(&regulars, true);

        assert!(module.matches("code", "abc"));
        assert!(module.matches("code", "123"));
        assert!(!module.matches("code", "a1"));
        assert!(!module.matches("unknown", "abc"));
    }
}
