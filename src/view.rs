//! View module: driver-backed template rendering plus the global helper
//! registry.
//!
//! The HTTP module supplies per-request helpers (url, language, sign
//! probes); helpers registered here are merged underneath them for every
//! render.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use eyre::{eyre, Result, WrapErr};
use once_cell::sync::Lazy;

use crate::defs::{self, Map, Value};
use crate::kernel::{Module, Registry};
use crate::ports::view::{ViewConnect, ViewDriver};

pub static VIEW: Lazy<ViewModule> = Lazy::new(ViewModule::new);

pub type HelperFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A named render helper.
#[derive(Clone)]
pub struct Helper {
    pub name: String,
    pub desc: String,
    pub alias: Vec<String>,
    pub action: HelperFn,
}

/// The helper set handed to a render.
#[derive(Clone, Default)]
pub struct Helpers {
    entries: HashMap<String, HelperFn>,
}

impl Helpers {
    pub fn new() -> Helpers {
        Helpers::default()
    }

    pub fn insert(&mut self, name: &str, action: HelperFn) {
        self.entries.insert(name.to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<&HelperFn> {
        self.entries.get(name)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Option<Value> {
        self.entries.get(name).map(|f| f(args))
    }

    /// Merge `other` underneath this set: existing names win.
    pub fn merge_under(&mut self, other: &Helpers) {
        for (name, action) in &other.entries {
            self.entries
                .entry(name.clone())
                .or_insert_with(|| action.clone());
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[derive(Clone)]
pub struct ViewConfig {
    pub driver: String,
    pub root: String,
    pub shared: String,
    pub left: String,
    pub right: String,
    pub setting: Map,
}

impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig {
            driver: "default".into(),
            root: "asset/views".into(),
            shared: "shared".into(),
            left: "{%".into(),
            right: "%}".into(),
            setting: Map::new(),
        }
    }
}

/// Everything a driver needs for one render.
pub struct ViewBody {
    pub view: String,
    pub site: String,
    pub lang: String,
    pub zone_secs: Option<i32>,
    pub data: Map,
    pub helpers: Helpers,
}

pub struct ViewModule {
    config: RwLock<ViewConfig>,
    drivers: RwLock<HashMap<String, Arc<dyn ViewDriver>>>,
    helpers: RwLock<Helpers>,
    connect: RwLock<Option<Arc<dyn ViewConnect>>>,
}

impl ViewModule {
    pub fn new() -> ViewModule {
        ViewModule {
            config: RwLock::new(ViewConfig::default()),
            drivers: RwLock::new(HashMap::new()),
            helpers: RwLock::new(Helpers::new()),
            connect: RwLock::new(None),
        }
    }

    pub fn config(&self) -> ViewConfig {
        self.config.read().unwrap().clone()
    }

    pub fn driver(&self, name: &str, driver: Arc<dyn ViewDriver>, overwrite: bool) {
        let mut drivers = self.drivers.write().unwrap();
        if overwrite || !drivers.contains_key(name) {
            drivers.insert(name.to_string(), driver);
        }
    }

    pub fn helper(&self, name: &str, config: Helper, overwrite: bool) {
        let mut keys = Vec::new();
        if !name.is_empty() {
            keys.push(name.to_string());
        }
        keys.extend(config.alias.iter().cloned());

        let mut helpers = self.helpers.write().unwrap();
        for key in keys {
            if overwrite || helpers.get(&key).is_none() {
                helpers.insert(&key, config.action.clone());
            }
        }
    }

    /// The globally registered helpers.
    pub fn helpers(&self) -> Helpers {
        self.helpers.read().unwrap().clone()
    }

    pub async fn parse(&self, body: ViewBody) -> Result<String> {
        let connect = self
            .connect
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| eyre!("view module is not connected"))?;
        connect.parse(body).await
    }
}

impl Default for ViewModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for ViewModule {
    fn name(&self) -> &'static str {
        "view"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        match value {
            Registry::ViewDriver(driver) => self.driver(name, driver.clone(), overwrite),
            Registry::Helper(helper) => self.helper(name, helper.clone(), overwrite),
            _ => {}
        }
    }

    fn configure(&self, config: &Map) {
        let Some(section) = defs::get_map(config, "view") else {
            return;
        };
        let mut cfg = self.config.write().unwrap();
        if let Some(v) = defs::get_str(section, "driver") {
            cfg.driver = v;
        }
        if let Some(v) = defs::get_str(section, "root") {
            cfg.root = v;
        }
        if let Some(v) = defs::get_str(section, "shared") {
            cfg.shared = v;
        }
        if let Some(v) = defs::get_str(section, "left") {
            cfg.left = v;
        }
        if let Some(v) = defs::get_str(section, "right") {
            cfg.right = v;
        }
        if let Some(v) = defs::get_map(section, "setting") {
            cfg.setting = v.clone();
        }
    }

    async fn connect(&self) -> Result<()> {
        let config = self.config.read().unwrap().clone();
        let driver = self
            .drivers
            .read()
            .unwrap()
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| eyre!("invalid view driver: {}", config.driver))?;

        let connect = driver
            .connect(config)
            .await
            .wrap_err("failed to connect view driver")?;
        connect.open().await.wrap_err("failed to open view driver")?;

        *self.connect.write().unwrap() = Some(connect);
        Ok(())
    }

    async fn terminate(&self) {
        let connect = self.connect.write().unwrap().take();
        if let Some(connect) = connect {
            let _ = connect.close().await;
        }
    }
}

pub async fn parse(body: ViewBody) -> Result<String> {
    VIEW.parse(body).await
}
