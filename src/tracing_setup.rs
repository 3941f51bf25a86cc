//! Structured logging bootstrap.
//!
//! The `log` config section picks the default level and output format;
//! `RUST_LOG` overrides the filter when set. Initialization is idempotent
//! so embedded and test uses can call it freely.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

use crate::defs::{self, Map};

static INIT: Once = Once::new();

/// Initialize the global subscriber from the `log` config section.
pub fn init(config: &Map) {
    let section = defs::get_map(config, "log");

    let level = section
        .and_then(|s| defs::get_str(s, "level"))
        .unwrap_or_else(|| "info".to_string());
    let format = section
        .and_then(|s| defs::get_str(s, "format"))
        .unwrap_or_else(|| "pretty".to_string());

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level));

        if format == "json" {
            let _ = fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .try_init();
        } else {
            let _ = fmt().with_env_filter(filter).try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;

    #[test]
    fn init_is_idempotent() {
        init(&map! { "log" => { "level": "debug" } });
        init(&Map::new());
    }
}
