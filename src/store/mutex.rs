//! Sharded distributed mutex.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use once_cell::sync::Lazy;

use crate::defs::Map;
use crate::kernel::{Module, Registry};
use crate::ports::mutex::{MutexConnect, MutexDriver};
use crate::store::{parse_section, HashRing, StoreConfig, DEFAULT};

pub static MUTEX: Lazy<MutexModule> = Lazy::new(MutexModule::new);

const DEFAULT_EXPIRY: Duration = Duration::from_secs(1);

struct Instance {
    config: StoreConfig,
    connect: Arc<dyn MutexConnect>,
}

pub struct MutexModule {
    configs: RwLock<HashMap<String, StoreConfig>>,
    drivers: RwLock<HashMap<String, Arc<dyn MutexDriver>>>,
    instances: RwLock<HashMap<String, Instance>>,
    ring: RwLock<HashRing>,
}

impl MutexModule {
    pub fn new() -> MutexModule {
        MutexModule {
            configs: RwLock::new(HashMap::new()),
            drivers: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            ring: RwLock::new(HashRing::build(&HashMap::new())),
        }
    }

    pub fn driver(&self, name: &str, driver: Arc<dyn MutexDriver>, overwrite: bool) {
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

        for (name, config) in configs {
            let driver = self
                .drivers
                .read()
                .unwrap()
                .get(&config.driver)
                .cloned()
                .ok_or_else(|| eyre!("invalid mutex driver: {}", config.driver))?;

            let connect = driver
                .connect(&name, config.clone())
                .await
                .wrap_err_with(|| format!("failed to connect mutex backend {name}"))?;
            connect
                .open()
                .await
                .wrap_err_with(|| format!("failed to open mutex backend {name}"))?;

            // only weighted backends join the ring
            if config.weight > 0 {
                weights.insert(name.clone(), config.weight);
            }

            self.instances
                .write()
                .unwrap()
                .insert(name, Instance { config, connect });
        }

        *self.ring.write().unwrap() = HashRing::build(&weights);
        Ok(())
    }

    fn locate(&self, key: &str) -> Result<(Arc<dyn MutexConnect>, String, Duration)> {
        let located = self
            .ring
            .read()
            .unwrap()
            .locate(key)
            .map(str::to_string)
            .ok_or_else(|| eyre!("invalid mutex connection"))?;
        self.pinned(&located, key)
    }

    fn pinned(&self, name: &str, key: &str) -> Result<(Arc<dyn MutexConnect>, String, Duration)> {
        let instances = self.instances.read().unwrap();
        let instance = instances
            .get(name)
            .ok_or_else(|| eyre!("invalid mutex connection"))?;
        Ok((
            instance.connect.clone(),
            format!("{}{}", instance.config.prefix, key),
            instance.config.expiry,
        ))
    }

    pub async fn lock(&self, key: &str, expiry: Option<Duration>) -> Result<()> {
        let (connect, key, default_expiry) = self.locate(key)?;
        connect.lock(&key, expiry.unwrap_or(default_expiry)).await
    }

    pub async fn unlock(&self, key: &str) -> Result<()> {
        let (connect, key, _) = self.locate(key)?;
        connect.unlock(&key).await
    }

    /// Lock on a named backend instead of the ring-located one.
    pub async fn lock_to(&self, name: &str, key: &str, expiry: Option<Duration>) -> Result<()> {
        let (connect, key, default_expiry) = self.pinned(name, key)?;
        connect.lock(&key, expiry.unwrap_or(default_expiry)).await
    }

    pub async fn unlock_from(&self, name: &str, key: &str) -> Result<()> {
        let (connect, key, _) = self.pinned(name, key)?;
        connect.unlock(&key).await
    }

    /// Convenience probe: true when the key is already held.
    pub async fn locked(&self, key: &str, expiry: Option<Duration>) -> bool {
        self.lock(key, expiry).await.is_err()
    }

    async fn shutdown(&self) {
        let connects: Vec<Arc<dyn MutexConnect>> = {
            let instances = self.instances.read().unwrap();
            instances.values().map(|i| i.connect.clone()).collect()
        };
        for connect in connects {
            let _ = connect.close().await;
        }
    }
}

impl Default for MutexModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for MutexModule {
    fn name(&self) -> &'static str {
        "mutex"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        if let Registry::MutexDriver(driver) = value {
            self.driver(name, driver.clone(), overwrite);
        }
    }

    fn configure(&self, config: &Map) {
        let parsed = parse_section(config, "mutex", DEFAULT_EXPIRY);
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

pub async fn lock(key: &str, expiry: Option<Duration>) -> Result<()> {
    MUTEX.lock(key, expiry).await
}

pub async fn unlock(key: &str) -> Result<()> {
    MUTEX.unlock(key).await
}

pub async fn locked(key: &str, expiry: Option<Duration>) -> bool {
    MUTEX.locked(key, expiry).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryMutexDriver;

    #[tokio::test]
    async fn lock_excludes_until_unlock() {
        let module = MutexModule::new();
        module.driver(DEFAULT, Arc::new(MemoryMutexDriver::new()), true);
        module.setup().await.unwrap();

        module.lock("job", None).await.unwrap();
        assert!(module.lock("job", None).await.is_err());
        assert!(module.locked("job", None).await);

        module.unlock("job").await.unwrap();
        module.lock("job", None).await.unwrap();
        module.unlock("job").await.unwrap();
    }

    #[tokio::test]
    async fn lock_expiry_releases_on_its_own() {
        let module = MutexModule::new();
        module.driver(DEFAULT, Arc::new(MemoryMutexDriver::new()), true);
        module.setup().await.unwrap();

        module
            .lock("short", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(module.lock("short", None).await.is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        module.lock("short", None).await.unwrap();
    }
}
