//! Configuration file loading through the `config` crate.

use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{eyre, Context, Result};

use crate::defs::{Map, Value};

/// Load a configuration file into a dynamic map. The format follows the
/// file extension; TOML is the default.
pub fn load(path: &str) -> Result<Map> {
    let format = match Path::new(path).extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") | Some("conf") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(path, format))
        .build()
        .with_context(|| format!("failed to read config from {path}"))?;

    let value: Value = settings
        .try_deserialize()
        .with_context(|| format!("failed to parse config from {path}"))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(eyre!("config root must be a table: {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_toml_sections() {
        let toml = r#"
name = "demo"
mode = "production"

[http]
port = 8080

[site.www]
hosts = ["www.example.com"]

[cache]
prefix = "demo:"

[cache.hot]
weight = 2
"#;
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(file, "{toml}").unwrap();

        let config = load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(defs::get_str(&config, "name"), Some("demo".into()));

        let http = defs::get_map(&config, "http").unwrap();
        assert_eq!(defs::get_i64(http, "port"), Some(8080));

        let cache = defs::get_map(&config, "cache").unwrap();
        assert!(cache.contains_key("hot"));
        assert_eq!(defs::get_str(cache, "prefix"), Some("demo:".into()));
    }

    #[test]
    fn loads_json_by_extension() {
        let json = r#"{ "name": "demo", "token": { "secret": "s3cret" } }"#;
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, "{json}").unwrap();

        let config = load(file.path().to_str().unwrap()).unwrap();
        let token = defs::get_map(&config, "token").unwrap();
        assert_eq!(defs::get_str(token, "secret"), Some("s3cret".into()));
    }

    #[test]
    fn missing_file_errors() {
        assert!(load("/definitely/not/here.toml").is_err());
    }
}
