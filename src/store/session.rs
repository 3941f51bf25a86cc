//! Sharded session store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use once_cell::sync::Lazy;

use crate::defs::Map;
use crate::kernel::{Module, Registry};
use crate::ports::session::{SessionConnect, SessionDriver};
use crate::store::{parse_section, HashRing, StoreConfig, DEFAULT};

pub static SESSION: Lazy<SessionModule> = Lazy::new(SessionModule::new);

const DEFAULT_EXPIRY: Duration = Duration::from_secs(24 * 3600);

struct Instance {
    config: StoreConfig,
    connect: Arc<dyn SessionConnect>,
}

pub struct SessionModule {
    configs: RwLock<HashMap<String, StoreConfig>>,
    drivers: RwLock<HashMap<String, Arc<dyn SessionDriver>>>,
    instances: RwLock<HashMap<String, Instance>>,
    ring: RwLock<HashRing>,
}

impl SessionModule {
    pub fn new() -> SessionModule {
        SessionModule {
            configs: RwLock::new(HashMap::new()),
            drivers: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            ring: RwLock::new(HashRing::build(&HashMap::new())),
        }
    }

    pub fn driver(&self, name: &str, driver: Arc<dyn SessionDriver>, overwrite: bool) {
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
                .ok_or_else(|| eyre!("invalid session driver: {}", config.driver))?;

            let connect = driver
                .connect(&name, config.clone())
                .await
                .wrap_err_with(|| format!("failed to connect session backend {name}"))?;
            connect
                .open()
                .await
                .wrap_err_with(|| format!("failed to open session backend {name}"))?;

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

    fn locate(&self, id: &str) -> Result<(Arc<dyn SessionConnect>, String, Duration)> {
        let located = self
            .ring
            .read()
            .unwrap()
            .locate(id)
            .map(str::to_string)
            .ok_or_else(|| eyre!("invalid session connection"))?;

        let instances = self.instances.read().unwrap();
        let instance = instances
            .get(&located)
            .ok_or_else(|| eyre!("invalid session connection"))?;
        Ok((
            instance.connect.clone(),
            format!("{}{}", instance.config.prefix, id),
            instance.config.expiry,
        ))
    }

    pub async fn read(&self, id: &str) -> Result<Option<Map>> {
        let (connect, id, _) = self.locate(id)?;
        connect.read(&id).await
    }

    pub async fn write(&self, id: &str, value: Map, expiry: Option<Duration>) -> Result<()> {
        let (connect, id, default_expiry) = self.locate(id)?;
        connect
            .write(&id, value, expiry.unwrap_or(default_expiry))
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let (connect, id, _) = self.locate(id)?;
        connect.delete(&id).await
    }

    /// Clear matching sessions on every backend.
    pub async fn clear(&self, prefix: &str) -> Result<()> {
        let targets: Vec<(Arc<dyn SessionConnect>, String)> = {
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
        let connects: Vec<Arc<dyn SessionConnect>> = {
            let instances = self.instances.read().unwrap();
            instances.values().map(|i| i.connect.clone()).collect()
        };
        for connect in connects {
            let _ = connect.close().await;
        }
    }
}

impl Default for SessionModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for SessionModule {
    fn name(&self) -> &'static str {
        "session"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        if let Registry::SessionDriver(driver) = value {
            self.driver(name, driver.clone(), overwrite);
        }
    }

    fn configure(&self, config: &Map) {
        let parsed = parse_section(config, "session", DEFAULT_EXPIRY);
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

pub async fn read(id: &str) -> Result<Option<Map>> {
    SESSION.read(id).await
}

pub async fn write(id: &str, value: Map, expiry: Option<Duration>) -> Result<()> {
    SESSION.write(id, value, expiry).await
}

pub async fn delete(id: &str) -> Result<()> {
    SESSION.delete(id).await
}

pub async fn clear(prefix: &str) -> Result<()> {
    SESSION.clear(prefix).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemorySessionDriver;
    use crate::map;

    #[tokio::test]
    async fn session_roundtrip_and_delete() {
        let module = SessionModule::new();
        module.driver(DEFAULT, Arc::new(MemorySessionDriver::new()), true);
        module.setup().await.unwrap();

        let value = map! { "user" => "neo", "$alive" => 1 };
        module.write("sid-1", value.clone(), None).await.unwrap();
        assert_eq!(module.read("sid-1").await.unwrap(), Some(value));

        module.delete("sid-1").await.unwrap();
        assert_eq!(module.read("sid-1").await.unwrap(), None);
    }
}
