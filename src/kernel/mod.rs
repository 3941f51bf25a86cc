//! The module kernel.
//!
//! The kernel owns the ordered module list and drives the lifecycle:
//! `parse → initialize → connect → launch → (signal wait) → terminate`,
//! terminating in reverse registration order. Registrations are broadcast
//! as [`Registry`] values: every module inspects each value and keeps what
//! it recognizes. Configuration merges the discovered file with
//! programmatic [`configure`] calls and is frozen once initialization runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use once_cell::sync::Lazy;

use crate::basic::{Kind, BASIC};
use crate::codec::{Codec, CODEC};
use crate::context;
use crate::defs::{self, Map};
use crate::engine::{Method, ENGINE, START_TRIGGER, STOP_TRIGGER};
use crate::http::{
    DeniedHandler, ErrorHandler, ExecuteFilter, FailedHandler, Filter, FindRule, FoundHandler,
    Handler, RequestFilter, ResponseFilter, Router, HTTP,
};
use crate::ports::cache::CacheDriver;
use crate::ports::http::HttpDriver;
use crate::ports::mutex::MutexDriver;
use crate::ports::session::SessionDriver;
use crate::ports::view::ViewDriver;
use crate::store::{CACHE, MUTEX, SESSION};
use crate::token::TOKEN;
use crate::view::{Helper, VIEW};

pub static KERNEL: Lazy<Kernel> = Lazy::new(Kernel::new);

/// Node mode, parsed from the `d|dev|developing` family of literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Developing,
    Testing,
    Production,
}

impl Mode {
    fn parse(text: &str) -> Mode {
        match text.to_lowercase().as_str() {
            "t" | "test" | "testing" => Mode::Testing,
            "p" | "prod" | "production" => Mode::Production,
            _ => Mode::Developing,
        }
    }
}

/// The values a registration can carry. Each module matches the variants it
/// owns; everything else passes through untouched.
#[derive(Clone)]
pub enum Registry {
    State(i64),
    States(HashMap<String, i64>),
    Lang { lang: String, strings: HashMap<String, String> },
    Mime(HashMap<String, String>),
    Regular(HashMap<String, Vec<String>>),
    Kind(Kind),
    Codec(Codec),
    Method(Method),
    Router(Router),
    Filter(Filter),
    RequestFilter(RequestFilter),
    ExecuteFilter(ExecuteFilter),
    ResponseFilter(ResponseFilter),
    Handler(Handler),
    FoundHandler(FoundHandler),
    ErrorHandler(ErrorHandler),
    FailedHandler(FailedHandler),
    DeniedHandler(DeniedHandler),
    Item(FindRule),
    Helper(Helper),
    HttpDriver(Arc<dyn HttpDriver>),
    CacheDriver(Arc<dyn CacheDriver>),
    SessionDriver(Arc<dyn SessionDriver>),
    MutexDriver(Arc<dyn MutexDriver>),
    ViewDriver(Arc<dyn ViewDriver>),
}

macro_rules! registry_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(impl From<$ty> for Registry {
            fn from(value: $ty) -> Registry {
                Registry::$variant(value)
            }
        })+
    };
}

registry_from! {
    Kind => Kind,
    Codec => Codec,
    Method => Method,
    Router => Router,
    Filter => Filter,
    RequestFilter => RequestFilter,
    ExecuteFilter => ExecuteFilter,
    ResponseFilter => ResponseFilter,
    Handler => Handler,
    FoundHandler => FoundHandler,
    ErrorHandler => ErrorHandler,
    FailedHandler => FailedHandler,
    DeniedHandler => DeniedHandler,
    FindRule => Item,
    Helper => Helper,
    Arc<dyn HttpDriver> => HttpDriver,
    Arc<dyn CacheDriver> => CacheDriver,
    Arc<dyn SessionDriver> => SessionDriver,
    Arc<dyn MutexDriver> => MutexDriver,
    Arc<dyn ViewDriver> => ViewDriver,
}

/// A pluggable subsystem owned by the kernel. Lifecycle methods default to
/// no-ops so simple modules implement only what they use.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect a broadcast registration and keep what this module owns.
    fn register(&self, name: &str, value: &Registry, overwrite: bool);

    /// Receive the merged configuration map.
    fn configure(&self, config: &Map);

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self) {}
}

#[derive(Default)]
struct Phases {
    parsed: bool,
    initialized: bool,
    connected: bool,
    launched: bool,
}

#[derive(Clone)]
struct KernelConfig {
    name: String,
    role: String,
    version: String,
    mode: Mode,
    setting: Map,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            name: "strata".into(),
            role: "strata".into(),
            version: "0.0.0".into(),
            mode: Mode::Developing,
            setting: Map::new(),
        }
    }
}

pub struct Kernel {
    phases: RwLock<Phases>,
    config: RwLock<KernelConfig>,
    modules: RwLock<Vec<&'static dyn Module>>,
}

impl Kernel {
    fn new() -> Kernel {
        let kernel = Kernel {
            phases: RwLock::new(Phases::default()),
            config: RwLock::new(KernelConfig::default()),
            modules: RwLock::new(Vec::new()),
        };

        // builtin registrations must exist before anything configures
        crate::result::builtin();
        crate::basic::types::builtin();
        crate::codec::builtin();

        // dependency order; termination walks it backwards
        kernel.load(&*BASIC);
        kernel.load(&*CODEC);
        kernel.load(&*TOKEN);
        kernel.load(&*CACHE);
        kernel.load(&*SESSION);
        kernel.load(&*MUTEX);
        kernel.load(&*ENGINE);
        kernel.load(&*VIEW);
        kernel.load(&*HTTP);

        kernel.default_drivers();
        kernel
    }

    fn default_drivers(&self) {
        use crate::adapters::hyper_server::HyperDriver;
        use crate::adapters::memory::{MemoryCacheDriver, MemoryMutexDriver, MemorySessionDriver};
        use crate::adapters::text_view::TextViewDriver;

        self.broadcast(
            "default",
            &Registry::HttpDriver(Arc::new(HyperDriver::new())),
            false,
        );
        self.broadcast(
            "default",
            &Registry::CacheDriver(Arc::new(MemoryCacheDriver::new())),
            false,
        );
        self.broadcast(
            "default",
            &Registry::SessionDriver(Arc::new(MemorySessionDriver::new())),
            false,
        );
        self.broadcast(
            "default",
            &Registry::MutexDriver(Arc::new(MemoryMutexDriver::new())),
            false,
        );
        self.broadcast(
            "default",
            &Registry::ViewDriver(Arc::new(TextViewDriver::new())),
            false,
        );
    }

    /// Append a module; the list freezes at initialization.
    pub fn load(&self, module: &'static dyn Module) {
        if self.phases.read().unwrap().initialized {
            return;
        }
        self.modules.write().unwrap().push(module);
    }

    /// Broadcast a registration to every module.
    pub fn broadcast(&self, name: &str, value: &Registry, overwrite: bool) {
        for module in self.modules.read().unwrap().iter() {
            module.register(name, value, overwrite);
        }
    }

    /// Merge configuration and forward it to every module. Idempotent
    /// before initialization, a no-op after.
    pub fn configure(&self, config: &Map) {
        {
            let phases = self.phases.read().unwrap();
            if phases.initialized || phases.launched {
                return;
            }
        }

        {
            let mut kernel = self.config.write().unwrap();
            if let Some(name) = defs::get_str(config, "name") {
                if kernel.name == kernel.role {
                    kernel.role = name.clone();
                }
                kernel.name = name;
            }
            if let Some(role) = defs::get_str(config, "role") {
                kernel.role = role;
            }
            if let Some(version) = defs::get_str(config, "version") {
                kernel.version = version;
            }
            if let Some(mode) = defs::get_str(config, "mode") {
                kernel.mode = Mode::parse(&mode);
            }
            if let Some(setting) = defs::get_map(config, "setting") {
                defs::merge(&mut kernel.setting, setting);
            }
        }

        for module in self.modules.read().unwrap().iter() {
            module.configure(config);
        }
    }

    /// Declare this node's role and version.
    pub fn identify(&self, role: &str, version: Option<&str>) {
        let mut config = self.config.write().unwrap();
        config.role = role.to_string();
        if let Some(version) = version {
            config.version = version.to_string();
        }
    }

    /// A copy of the custom settings, safe against outside mutation.
    pub fn setting(&self) -> Map {
        self.config.read().unwrap().setting.clone()
    }

    pub fn mode(&self) -> Mode {
        self.config.read().unwrap().mode
    }

    /// Locate and load the configuration file.
    pub fn parse(&self, path: Option<&str>) -> Result<()> {
        if self.phases.read().unwrap().parsed {
            return Ok(());
        }

        if let Some(config) = crate::config::discover(path)? {
            self.configure(&config);
        }
        self.phases.write().unwrap().parsed = true;
        Ok(())
    }

    pub async fn initialize(&self) -> Result<()> {
        if self.phases.read().unwrap().initialized {
            return Ok(());
        }

        let modules: Vec<&'static dyn Module> = self.modules.read().unwrap().clone();
        for module in modules {
            module
                .initialize()
                .await
                .wrap_err_with(|| format!("failed to initialize module {}", module.name()))?;
        }
        self.phases.write().unwrap().initialized = true;
        Ok(())
    }

    pub async fn connect(&self) -> Result<()> {
        if self.phases.read().unwrap().connected {
            return Ok(());
        }

        let modules: Vec<&'static dyn Module> = self.modules.read().unwrap().clone();
        for module in modules {
            module
                .connect()
                .await
                .wrap_err_with(|| format!("failed to connect module {}", module.name()))?;
        }
        self.phases.write().unwrap().connected = true;
        Ok(())
    }

    pub async fn launch(&self) -> Result<()> {
        if self.phases.read().unwrap().launched {
            return Ok(());
        }

        let modules: Vec<&'static dyn Module> = self.modules.read().unwrap().clone();
        for module in modules {
            module
                .launch()
                .await
                .wrap_err_with(|| format!("failed to launch module {}", module.name()))?;
        }
        self.phases.write().unwrap().launched = true;

        crate::engine::trigger(START_TRIGGER, Map::new());

        let config = self.config.read().unwrap().clone();
        if config.role == config.name || config.role.is_empty() {
            tracing::info!("{} {} is running", config.name, config.version);
        } else {
            tracing::info!("{} {}-{} is running", config.name, config.role, config.version);
        }
        Ok(())
    }

    /// Stop trigger first (synchronously, so hooks can tear down), then
    /// modules in reverse registration order.
    pub async fn terminate(&self) {
        crate::engine::execute(STOP_TRIGGER, Map::new()).await;

        let modules: Vec<&'static dyn Module> = self.modules.read().unwrap().clone();
        for module in modules.iter().rev() {
            module.terminate().await;
        }
        self.phases.write().unwrap().launched = false;

        let config = self.config.read().unwrap().clone();
        tracing::info!("{} {} stopped", config.name, config.version);
    }
}

// crate-level entry points

/// Register a value under a name, broadcast to every module.
pub fn register(name: &str, value: impl Into<Registry>) {
    register_with(name, value.into(), true);
}

pub fn register_with(name: &str, value: Registry, overwrite: bool) {
    KERNEL.broadcast(name, &value, overwrite);
}

/// Merge configuration programmatically; callable multiple times before
/// initialization.
pub fn configure(config: Map) {
    KERNEL.configure(&config);
}

pub fn identify(role: &str, version: Option<&str>) {
    KERNEL.identify(role, version);
}

pub fn setting() -> Map {
    KERNEL.setting()
}

pub fn mode() -> Mode {
    KERNEL.mode()
}

/// Bring every module up to connected without launching: for scripts and
/// tools that embed the framework.
pub async fn ready() -> Result<()> {
    ready_with(None).await
}

pub async fn ready_with(config: Option<&str>) -> Result<()> {
    KERNEL.parse(config)?;
    KERNEL.initialize().await?;
    KERNEL.connect().await?;
    Ok(())
}

/// The full lifecycle: parse, initialize, connect, launch, wait for a
/// shutdown signal, terminate.
pub async fn run(config: Option<&str>) -> Result<()> {
    ready_with(config).await?;
    KERNEL.launch().await?;
    crate::utils::wait_for_signal().await;
    KERNEL.terminate().await;
    Ok(())
}

/// A fresh execution context bound to nothing; engine calls made outside a
/// request use one of these.
pub fn fresh_context() -> context::Context {
    context::Context::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_literals() {
        assert_eq!(Mode::parse("d"), Mode::Developing);
        assert_eq!(Mode::parse("dev"), Mode::Developing);
        assert_eq!(Mode::parse("TEST"), Mode::Testing);
        assert_eq!(Mode::parse("prod"), Mode::Production);
        assert_eq!(Mode::parse("unknown"), Mode::Developing);
    }

    #[test]
    fn configure_merges_kernel_fields() {
        let kernel = Kernel {
            phases: RwLock::new(Phases::default()),
            config: RwLock::new(KernelConfig::default()),
            modules: RwLock::new(Vec::new()),
        };

        kernel.configure(&crate::map! {
            "name" => "svc",
            "version" => "1.2.3",
            "mode" => "p",
            "setting" => { "flag": true },
        });

        let config = kernel.config.read().unwrap().clone();
        assert_eq!(config.name, "svc");
        assert_eq!(config.role, "svc");
        assert_eq!(config.version, "1.2.3");
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(defs::get_bool(&config.setting, "flag"), Some(true));

        kernel.identify("worker", Some("2.0"));
        let config = kernel.config.read().unwrap().clone();
        assert_eq!(config.role, "worker");
        assert_eq!(config.version, "2.0");
    }

    #[test]
    fn configure_is_frozen_after_initialize() {
        let kernel = Kernel {
            phases: RwLock::new(Phases { initialized: true, ..Phases::default() }),
            config: RwLock::new(KernelConfig::default()),
            modules: RwLock::new(Vec::new()),
        };

        kernel.configure(&crate::map! { "name" => "late" });
        assert_eq!(kernel.config.read().unwrap().name, "strata");
    }
}
