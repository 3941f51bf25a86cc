//! Configuration discovery and loading.
//!
//! The kernel only ever sees a merged dynamic map; where it came from (an
//! explicit `--config` path or the first file found next to the binary) is
//! decided here.

pub mod loader;

use std::path::Path;

use eyre::Result;

use crate::defs::Map;

pub use loader::load;

/// Locate a configuration file: the explicit path when given, otherwise the
/// first of `<binary>.toml`, `config.toml`, `strata.toml` that exists.
/// Returns `None` when nothing is found; running unconfigured is fine.
pub fn discover(path: Option<&str>) -> Result<Option<Map>> {
    let mut candidates: Vec<String> = Vec::new();

    if let Some(path) = path {
        candidates.push(path.to_string());
    }

    if let Some(base) = binary_base() {
        candidates.push(format!("{base}.toml"));
    }
    candidates.push("config.toml".into());
    candidates.push("strata.toml".into());

    for candidate in candidates {
        if Path::new(&candidate).exists() {
            return load(&candidate).map(Some);
        }
    }
    Ok(None)
}

fn binary_base() -> Option<String> {
    let exe = std::env::args().next()?;
    let name = Path::new(&exe).file_stem()?.to_str()?;
    (!name.is_empty()).then(|| name.to_string())
}
