//! Sharded cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use once_cell::sync::Lazy;

use crate::defs::{Map, Value};
use crate::kernel::{Module, Registry};
use crate::ports::cache::{CacheConnect, CacheDriver};
use crate::store::{parse_section, HashRing, StoreConfig, DEFAULT};

pub static CACHE: Lazy<CacheModule> = Lazy::new(CacheModule::new);

const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 3600);

struct Instance {
    config: StoreConfig,
    connect: Arc<dyn CacheConnect>,
}

pub struct CacheModule {
    configs: RwLock<HashMap<String, StoreConfig>>,
    drivers: RwLock<HashMap<String, Arc<dyn CacheDriver>>>,
    instances: RwLock<HashMap<String, Instance>>,
    ring: RwLock<HashRing>,
}

impl CacheModule {
    pub fn new() -> CacheModule {
        CacheModule {
            configs: RwLock::new(HashMap::new()),
            drivers: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            ring: RwLock::new(HashRing::build(&HashMap::new())),
        }
    }

    pub fn driver(&self, name: &str, driver: Arc<dyn CacheDriver>, overwrite: bool) {
        let mut drivers = self.drivers.write().unwrap();
        if overwrite || !drivers.contains_key(name) {
            drivers.insert(name.to_string(), driver);
        }
    }

    pub fn configure_backend(&self, name: &str, config: StoreConfig) {
        self.configs.write().unwrap().insert(name.to_string(), config);
    }

    pub async fn setup(&self) -> Result<()> {
        {
            let mut configs = self.configs.write().unwrap();
            if configs.is_empty() {
                configs.insert(
                    DEFAULT.to_string(),
                    StoreConfig::with_expiry(DEFAULT_EXPIRY),
                );
            }
        }

        let configs = self.configs.read().unwrap().clone();
        let mut weights = HashMap::new();

        for (name, mut config) in configs {
            let driver = self
                .drivers
                .read()
                .unwrap()
                .get(&config.driver)
                .cloned()
                .ok_or_else(|| eyre!("invalid cache driver: {}", config.driver))?;

            let connect = driver
                .connect(&name, config.clone())
                .await
                .wrap_err_with(|| format!("failed to connect cache backend {name}"))?;
            connect
                .open()
                .await
                .wrap_err_with(|| format!("failed to open cache backend {name}"))?;

            // the cache always shards across every backend
            if config.weight <= 0 {
                config.weight = 1;
            }
            weights.insert(name.clone(), config.weight);

            self.instances
                .write()
                .unwrap()
                .insert(name, Instance { config, connect });
        }

        *self.ring.write().unwrap() = HashRing::build(&weights);
        Ok(())
    }

    fn locate(&self, key: &str) -> Result<(Arc<dyn CacheConnect>, String, Duration)> {
        let located = self
            .ring
            .read()
            .unwrap()
            .locate(key)
            .map(str::to_string)
            .ok_or_else(|| eyre!("invalid cache connection"))?;

        let instances = self.instances.read().unwrap();
        let instance = instances
            .get(&located)
            .ok_or_else(|| eyre!("invalid cache connection"))?;
        Ok((
            instance.connect.clone(),
            format!("{}{}", instance.config.prefix, key),
            instance.config.expiry,
        ))
    }

    pub async fn read(&self, key: &str) -> Result<Option<Value>> {
        let (connect, key, _) = self.locate(key)?;
        connect.read(&key).await
    }

    pub async fn write(&self, key: &str, value: Value, expiry: Option<Duration>) -> Result<()> {
        let (connect, key, default_expiry) = self.locate(key)?;
        connect
            .write(&key, value, expiry.unwrap_or(default_expiry))
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let (connect, key, _) = self.locate(key)?;
        connect.exists(&key).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let (connect, key, _) = self.locate(key)?;
        connect.delete(&key).await
    }

    /// Atomic counter located by key.
    pub async fn serial(&self, key: &str, start: i64, step: i64) -> Result<i64> {
        let (connect, key, _) = self.locate(key)?;
        connect.serial(&key, start, step).await
    }

    /// Union of matching keys across every backend.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let targets: Vec<(Arc<dyn CacheConnect>, String)> = {
            let instances = self.instances.read().unwrap();
            instances
                .values()
                .map(|i| {
                    (
                        i.connect.clone(),
                        format!("{}{}", i.config.prefix, prefix),
                    )
                })
                .collect()
        };

        let mut out = Vec::new();
        for (connect, prefix) in targets {
            if let Ok(keys) = connect.keys(&prefix).await {
                out.extend(keys);
            }
        }
        Ok(out)
    }

    /// Clear matching keys on every backend.
    pub async fn clear(&self, prefix: &str) -> Result<()> {
        let targets: Vec<(Arc<dyn CacheConnect>, String)> = {
            let instances = self.instances.read().unwrap();
            instances
                .values()
                .map(|i| {
                    (
                        i.connect.clone(),
                        format!("{}{}", i.config.prefix, prefix),
                    )
                })
                .collect()
        };

        for (connect, prefix) in targets {
            connect.clear(&prefix).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let connects: Vec<Arc<dyn CacheConnect>> = {
            let instances = self.instances.read().unwrap();
            instances.values().map(|i| i.connect.clone()).collect()
        };
        for connect in connects {
            let _ = connect.close().await;
        }
    }
}

impl Default for CacheModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for CacheModule {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        if let Registry::CacheDriver(driver) = value {
            self.driver(name, driver.clone(), overwrite);
        }
    }

    fn configure(&self, config: &Map) {
        let parsed = parse_section(config, "cache", DEFAULT_EXPIRY);
        let mut configs = self.configs.write().unwrap();
        for (name, cfg) in parsed {
            configs.insert(name, cfg);
        }
    }

    async fn initialize(&self) -> Result<()> {
        self.setup().await
    }

    async fn terminate(&self) {
        self.shutdown().await;
    }
}

// module-level entry points

pub async fn read(key: &str) -> Result<Option<Value>> {
    CACHE.read(key).await
}

pub async fn write(key: &str, value: Value, expiry: Option<Duration>) -> Result<()> {
    CACHE.write(key, value, expiry).await
}

pub async fn exists(key: &str) -> Result<bool> {
    CACHE.exists(key).await
}

pub async fn delete(key: &str) -> Result<()> {
    CACHE.delete(key).await
}

pub async fn serial(key: &str, start: i64, step: i64) -> Result<i64> {
    CACHE.serial(key, start, step).await
}

pub async fn keys(prefix: &str) -> Result<Vec<String>> {
    CACHE.keys(prefix).await
}

pub async fn clear(prefix: &str) -> Result<()> {
    CACHE.clear(prefix).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryCacheDriver;
    use serde_json::json;

    async fn sharded() -> CacheModule {
        let module = CacheModule::new();
        module.driver(DEFAULT, Arc::new(MemoryCacheDriver::new()), true);

        let mut light = StoreConfig::with_expiry(Duration::from_secs(60));
        light.weight = 1;
        light.prefix = "l:".into();
        module.configure_backend("light", light);

        let mut heavy = StoreConfig::with_expiry(Duration::from_secs(60));
        heavy.weight = 2;
        heavy.prefix = "h:".into();
        module.configure_backend("heavy", heavy);

        module.setup().await.unwrap();
        module
    }

    #[tokio::test]
    async fn roundtrip_across_two_backends() {
        let cache = sharded().await;

        for i in 0..50 {
            let key = format!("k{i}");
            cache.write(&key, json!({ "i": i }), None).await.unwrap();
        }
        for i in 0..50 {
            let key = format!("k{i}");
            assert_eq!(cache.read(&key).await.unwrap(), Some(json!({ "i": i })));
            assert!(cache.exists(&key).await.unwrap());
        }

        // union across backends sees every key
        let keys = cache.keys("").await.unwrap();
        assert_eq!(keys.len(), 50);

        cache.delete("k0").await.unwrap();
        assert_eq!(cache.read("k0").await.unwrap(), None);

        cache.clear("").await.unwrap();
        assert!(cache.keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn serial_advances_atomically() {
        let cache = sharded().await;
        assert_eq!(cache.serial("seq", 100, 5).await.unwrap(), 100);
        assert_eq!(cache.serial("seq", 100, 5).await.unwrap(), 105);
        assert_eq!(cache.serial("seq", 100, 5).await.unwrap(), 110);
    }

    #[tokio::test]
    async fn missing_driver_fails_setup() {
        let module = CacheModule::new();
        let mut cfg = StoreConfig::with_expiry(Duration::from_secs(60));
        cfg.driver = "redis".into();
        module.configure_backend("only", cfg);
        assert!(module.setup().await.is_err());
    }
}
