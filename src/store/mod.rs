//! Sharded stores: cache, session and mutex.
//!
//! The three modules share one skeleton: named backend configurations (a
//! flat config block registers as `default`), drivers connected and opened
//! at initialization, and a weighted consistent-hash ring that locates every
//! key to exactly one backend with its prefix applied.

pub mod cache;
pub mod mutex;
pub mod ring;
pub mod session;

use std::collections::HashMap;
use std::time::Duration;

use crate::defs::{self, Map};

pub use cache::{CacheModule, CACHE};
pub use mutex::{MutexModule, MUTEX};
pub use ring::HashRing;
pub use session::{SessionModule, SESSION};

pub const DEFAULT: &str = "default";

/// Per-backend configuration shared by all three stores.
#[derive(Clone)]
pub struct StoreConfig {
    pub driver: String,
    pub weight: i64,
    pub prefix: String,
    pub expiry: Duration,
    pub setting: Map,
}

impl StoreConfig {
    pub fn with_expiry(expiry: Duration) -> StoreConfig {
        StoreConfig {
            driver: DEFAULT.to_string(),
            weight: 1,
            prefix: String::new(),
            expiry,
            setting: Map::new(),
        }
    }
}

fn parse_block(config: &Map, base: StoreConfig) -> StoreConfig {
    let mut cfg = base;
    if let Some(driver) = defs::get_str(config, "driver") {
        cfg.driver = driver;
    }
    if let Some(weight) = defs::get_i64(config, "weight") {
        cfg.weight = weight;
    }
    if let Some(prefix) = defs::get_str(config, "prefix") {
        cfg.prefix = prefix;
    }
    if let Some(expiry) = defs::get_duration(config, "expiry") {
        cfg.expiry = expiry;
    }
    if let Some(setting) = defs::get_map(config, "setting") {
        cfg.setting = setting.clone();
    }
    cfg
}

/// Read a store section: nested named blocks become named backends, loose
/// top-level keys fold into a `default` backend.
pub(crate) fn parse_section(
    config: &Map,
    section: &str,
    default_expiry: Duration,
) -> HashMap<String, StoreConfig> {
    let mut out = HashMap::new();
    let Some(section) = defs::get_map(config, section) else {
        return out;
    };

    let mut flat = Map::new();
    for (key, val) in section {
        if let Some(block) = val.as_object() {
            out.insert(
                key.clone(),
                parse_block(block, StoreConfig::with_expiry(default_expiry)),
            );
        } else {
            flat.insert(key.clone(), val.clone());
        }
    }

    if !flat.is_empty() {
        out.insert(
            DEFAULT.to_string(),
            parse_block(&flat, StoreConfig::with_expiry(default_expiry)),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;

    #[test]
    fn named_blocks_and_flat_default() {
        let config = map! {
            "cache" => {
                "prefix": "app:",
                "hot": { "driver": "redis", "weight": 3 },
                "cold": { "weight": 1, "expiry": "1h" },
            }
        };

        let parsed = parse_section(&config, "cache", Duration::from_secs(60));
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["hot"].driver, "redis");
        assert_eq!(parsed["hot"].weight, 3);
        assert_eq!(parsed["cold"].expiry, Duration::from_secs(3600));
        assert_eq!(parsed[DEFAULT].prefix, "app:");
        assert_eq!(parsed[DEFAULT].expiry, Duration::from_secs(60));
    }

    #[test]
    fn missing_section_is_empty() {
        let parsed = parse_section(&Map::new(), "cache", Duration::from_secs(60));
        assert!(parsed.is_empty());
    }
}
