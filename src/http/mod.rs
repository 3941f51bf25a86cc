//! The HTTP module: virtual sites, named routes, the filter/handler
//! pipeline and response rendering.
//!
//! A driver owns the listener and resolves routes; this module owns the
//! registries and the per-request pipeline: token resolution, session
//! hydration, request filters, the CORS access stage, the staged gates of a
//! matched route, execute filters plus route actions, response filters and
//! the final body render. Error funnels (`found`/`error`/`failed`/`denied`)
//! re-enter the same response path.

pub mod access;
pub mod body;
pub mod router;
mod stages;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use eyre::{eyre, Result, WrapErr};
use once_cell::sync::Lazy;
use serde_json::json;

use crate::defs::{self, Map, Value};
use crate::kernel::{Module, Registry};
use crate::ports::http::{HttpConnect, HttpDriver, HttpRegister, HttpThread};
use crate::result;
use crate::store::SESSION;
use crate::token::{self, Token};
use crate::view::{Helpers, VIEW};

pub use access::{Access, Cookie};
pub use body::Body;
pub use router::{
    http_func, DeniedHandler, ErrorHandler, ExecuteFilter, FailedHandler, Filter, FindRule,
    FoundHandler, Handler, HttpFunc, HttpFuture, RequestFilter, ResponseFilter, Router, Routing,
    SignRule,
};

pub static HTTP: Lazy<HttpModule> = Lazy::new(HttpModule::new);

#[derive(Clone)]
pub struct HttpConfig {
    pub driver: String,
    pub port: u16,
    pub cert_file: String,
    pub key_file: String,
    /// Whether the implicit catch-all site auto-issues tokens.
    pub issue: bool,
    pub charset: String,
    pub domain: String,
    pub cookie: String,
    pub expiry: Option<Duration>,
    pub max_age: Option<Duration>,
    pub upload: String,
    pub static_root: String,
    pub shared: String,
    pub defaults: Vec<String>,
    pub setting: Map,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            driver: "default".into(),
            port: 80,
            cert_file: String::new(),
            key_file: String::new(),
            issue: false,
            charset: "utf-8".into(),
            domain: String::new(),
            cookie: String::new(),
            expiry: None,
            max_age: None,
            upload: String::new(),
            static_root: String::new(),
            shared: String::new(),
            defaults: Vec::new(),
            setting: Map::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SiteConfig {
    pub name: String,
    pub ssl: bool,
    pub hosts: Vec<String>,
    pub charset: String,
    /// Site root domain; inherits the module domain when empty.
    pub domain: String,
    /// Auto-issue a token when a request arrives without one.
    pub issue: bool,
    /// Cookie carrying the bearer token; empty reads the Authorization
    /// header only.
    pub cookie: String,
    pub expiry: Option<Duration>,
    pub max_age: Option<Duration>,
    /// Codec applied to successful API response data.
    pub confuse: String,
    /// Codec decoding the client-signature header; empty disables the gate.
    pub validate: String,
    /// Canonical string template for the client signature.
    pub format: String,
    /// Absolute window for client-signature timestamps.
    pub timeout: Option<Duration>,
    pub setting: Map,
}

#[derive(Clone, Default)]
pub struct CrossConfig {
    pub allow: bool,
    pub methods: Vec<String>,
    pub origins: Vec<String>,
    pub headers: Vec<String>,
}

pub struct HttpModule {
    config: RwLock<HttpConfig>,
    cross: RwLock<CrossConfig>,
    drivers: RwLock<HashMap<String, Arc<dyn HttpDriver>>>,

    sites: RwLock<HashMap<String, SiteConfig>>,
    hosts: RwLock<HashMap<String, String>>,

    routers: RwLock<HashMap<String, Router>>,
    router_names: RwLock<Vec<String>>,
    router_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,

    request_filters: RwLock<Vec<(String, RequestFilter)>>,
    execute_filters: RwLock<Vec<(String, ExecuteFilter)>>,
    response_filters: RwLock<Vec<(String, ResponseFilter)>>,
    request_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,
    execute_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,
    response_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,

    found_handlers: RwLock<Vec<(String, FoundHandler)>>,
    error_handlers: RwLock<Vec<(String, ErrorHandler)>>,
    failed_handlers: RwLock<Vec<(String, FailedHandler)>>,
    denied_handlers: RwLock<Vec<(String, DeniedHandler)>>,
    found_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,
    error_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,
    failed_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,
    denied_actions: RwLock<HashMap<String, Vec<HttpFunc>>>,

    items: RwLock<HashMap<String, FindRule>>,

    connect: RwLock<Option<Arc<dyn HttpConnect>>>,
}

impl HttpModule {
    pub fn new() -> HttpModule {
        HttpModule {
            config: RwLock::new(HttpConfig::default()),
            cross: RwLock::new(CrossConfig::default()),
            drivers: RwLock::new(HashMap::new()),
            sites: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            routers: RwLock::new(HashMap::new()),
            router_names: RwLock::new(Vec::new()),
            router_actions: RwLock::new(HashMap::new()),
            request_filters: RwLock::new(Vec::new()),
            execute_filters: RwLock::new(Vec::new()),
            response_filters: RwLock::new(Vec::new()),
            request_actions: RwLock::new(HashMap::new()),
            execute_actions: RwLock::new(HashMap::new()),
            response_actions: RwLock::new(HashMap::new()),
            found_handlers: RwLock::new(Vec::new()),
            error_handlers: RwLock::new(Vec::new()),
            failed_handlers: RwLock::new(Vec::new()),
            denied_handlers: RwLock::new(Vec::new()),
            found_actions: RwLock::new(HashMap::new()),
            error_actions: RwLock::new(HashMap::new()),
            failed_actions: RwLock::new(HashMap::new()),
            denied_actions: RwLock::new(HashMap::new()),
            items: RwLock::new(HashMap::new()),
            connect: RwLock::new(None),
        }
    }

    pub fn config(&self) -> HttpConfig {
        self.config.read().unwrap().clone()
    }

    /// Known site keys; the implicit catch-all site is always present for
    /// registration fan-out.
    pub fn site_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sites.read().unwrap().keys().cloned().collect();
        if !keys.iter().any(String::is_empty) {
            keys.push(String::new());
        }
        keys.sort();
        keys
    }

    pub fn site_of(&self, host: &str) -> Option<String> {
        self.hosts.read().unwrap().get(host).cloned()
    }

    pub fn site_config(&self, site: &str) -> SiteConfig {
        self.sites
            .read()
            .unwrap()
            .get(site)
            .cloned()
            .unwrap_or_default()
    }

    /// Routers, optionally restricted to one site.
    pub fn routers(&self, site: Option<&str>) -> HashMap<String, Router> {
        let prefix = site.map(|s| format!("{s}."));
        self.routers
            .read()
            .unwrap()
            .iter()
            .filter(|(name, _)| {
                prefix
                    .as_ref()
                    .map(|p| name.starts_with(p.as_str()))
                    .unwrap_or(true)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Route lookup with the dispatch fallback chain: the exact key, then
    /// the method-specific entry, then the method-agnostic wildcard.
    pub fn router_for(&self, name: &str, method: &str) -> Option<Router> {
        let routers = self.routers.read().unwrap();
        if let Some(router) = routers.get(name) {
            return Some(router.clone());
        }
        let method = method.to_lowercase();
        if let Some(router) = routers.get(&format!("{name}.{method}")) {
            return Some(router.clone());
        }
        routers.get(&format!("{name}.*")).cloned()
    }

    // ---- registration ----

    pub fn driver(&self, name: &str, driver: Arc<dyn HttpDriver>, overwrite: bool) {
        let mut drivers = self.drivers.write().unwrap();
        if overwrite || !drivers.contains_key(name) {
            drivers.insert(name.to_string(), driver);
        }
    }

    pub fn router(&self, name: &str, config: Router, overwrite: bool) {
        let sites = self.site_keys();
        let mut routers = self.routers.write().unwrap();
        let mut names = self.router_names.write().unwrap();

        for (key, entry) in router::expand_routers(name, config, &sites) {
            if overwrite || !routers.contains_key(&key) {
                if !routers.contains_key(&key) {
                    names.push(key.clone());
                }
                routers.insert(key, entry);
            }
        }
    }

    pub fn filter(&self, name: &str, config: Filter, overwrite: bool) {
        if let Some(action) = config.request {
            self.request_filter(
                name,
                RequestFilter {
                    site: String::new(),
                    name: config.name.clone(),
                    desc: config.desc.clone(),
                    action,
                },
                overwrite,
            );
        }
        if let Some(action) = config.execute {
            self.execute_filter(
                name,
                ExecuteFilter {
                    site: String::new(),
                    name: config.name.clone(),
                    desc: config.desc.clone(),
                    action,
                },
                overwrite,
            );
        }
        if let Some(action) = config.response {
            self.response_filter(
                name,
                ResponseFilter {
                    site: String::new(),
                    name: config.name,
                    desc: config.desc,
                    action,
                },
                overwrite,
            );
        }
    }

    pub fn request_filter(&self, name: &str, config: RequestFilter, overwrite: bool) {
        let sites = self.site_keys();
        let mut filters = self.request_filters.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !filters.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                filters.push((key, entry));
            }
        }
    }

    pub fn execute_filter(&self, name: &str, config: ExecuteFilter, overwrite: bool) {
        let sites = self.site_keys();
        let mut filters = self.execute_filters.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !filters.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                filters.push((key, entry));
            }
        }
    }

    pub fn response_filter(&self, name: &str, config: ResponseFilter, overwrite: bool) {
        let sites = self.site_keys();
        let mut filters = self.response_filters.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !filters.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                filters.push((key, entry));
            }
        }
    }

    pub fn handler(&self, name: &str, config: Handler, overwrite: bool) {
        if let Some(action) = config.found {
            self.found_handler(
                name,
                FoundHandler {
                    site: String::new(),
                    name: config.name.clone(),
                    desc: config.desc.clone(),
                    action,
                },
                overwrite,
            );
        }
        if let Some(action) = config.error {
            self.error_handler(
                name,
                ErrorHandler {
                    site: String::new(),
                    name: config.name.clone(),
                    desc: config.desc.clone(),
                    action,
                },
                overwrite,
            );
        }
        if let Some(action) = config.failed {
            self.failed_handler(
                name,
                FailedHandler {
                    site: String::new(),
                    name: config.name.clone(),
                    desc: config.desc.clone(),
                    action,
                },
                overwrite,
            );
        }
        if let Some(action) = config.denied {
            self.denied_handler(
                name,
                DeniedHandler {
                    site: String::new(),
                    name: config.name,
                    desc: config.desc,
                    action,
                },
                overwrite,
            );
        }
    }

    pub fn found_handler(&self, name: &str, config: FoundHandler, overwrite: bool) {
        let sites = self.site_keys();
        let mut handlers = self.found_handlers.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !handlers.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                handlers.push((key, entry));
            }
        }
    }

    pub fn error_handler(&self, name: &str, config: ErrorHandler, overwrite: bool) {
        let sites = self.site_keys();
        let mut handlers = self.error_handlers.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !handlers.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                handlers.push((key, entry));
            }
        }
    }

    pub fn failed_handler(&self, name: &str, config: FailedHandler, overwrite: bool) {
        let sites = self.site_keys();
        let mut handlers = self.failed_handlers.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !handlers.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                handlers.push((key, entry));
            }
        }
    }

    pub fn denied_handler(&self, name: &str, config: DeniedHandler, overwrite: bool) {
        let sites = self.site_keys();
        let mut handlers = self.denied_handlers.write().unwrap();
        for (key, site) in router::expand_site_key(name, &sites) {
            if overwrite || !handlers.iter().any(|(k, _)| *k == key) {
                let mut entry = config.clone();
                entry.site = site;
                handlers.push((key, entry));
            }
        }
    }

    pub fn item(&self, name: &str, config: FindRule, overwrite: bool) {
        let mut keys = Vec::new();
        if !name.is_empty() {
            keys.push(name.to_string());
        }
        keys.extend(config.alias.iter().cloned());

        let mut items = self.items.write().unwrap();
        for key in keys {
            if overwrite || !items.contains_key(&key) {
                items.insert(key, config.clone());
            }
        }
    }

    pub fn item_config(&self, name: &str) -> Option<FindRule> {
        self.items.read().unwrap().get(name).cloned()
    }

    // ---- configuration ----

    fn configure_http(&self, section: &Map) {
        let mut cfg = self.config.write().unwrap();
        if let Some(v) = defs::get_str(section, "driver") {
            cfg.driver = v;
        }
        if let Some(v) = defs::get_i64(section, "port") {
            // 0 asks the driver for an ephemeral port
            cfg.port = v.clamp(0, 65535) as u16;
        }
        if let Some(v) = defs::get_str(section, "certfile") {
            cfg.cert_file = v;
        }
        if let Some(v) = defs::get_str(section, "keyfile") {
            cfg.key_file = v;
        }
        if let Some(v) = defs::get_bool(section, "issue") {
            cfg.issue = v;
        }
        if let Some(v) = defs::get_str(section, "charset") {
            cfg.charset = v;
        }
        if let Some(v) = defs::get_str(section, "domain") {
            cfg.domain = v;
        }
        if let Some(v) = defs::get_str(section, "cookie") {
            cfg.cookie = v;
        }
        if let Some(v) = defs::get_duration(section, "expiry") {
            cfg.expiry = Some(v);
        }
        if let Some(v) = defs::get_duration(section, "maxage") {
            cfg.max_age = Some(v);
        }
        if let Some(v) = defs::get_str(section, "upload") {
            cfg.upload = v;
        }
        if let Some(v) = defs::get_str(section, "static") {
            cfg.static_root = v;
        }
        if let Some(v) = defs::get_str(section, "shared") {
            cfg.shared = v;
        }
        if let Some(v) = defs::get_str_list(section, "default", "defaults") {
            cfg.defaults = v;
        }
        if let Some(v) = defs::get_map(section, "setting") {
            cfg.setting = v.clone();
        }
    }

    fn configure_cross(&self, section: &Map) {
        let mut cross = self.cross.write().unwrap();
        if let Some(v) = defs::get_bool(section, "allow") {
            cross.allow = v;
        }
        if let Some(v) = defs::get_str_list(section, "method", "methods") {
            cross.methods = v;
        }
        if let Some(v) = defs::get_str_list(section, "origin", "origins") {
            cross.origins = v;
        }
        if let Some(v) = defs::get_str_list(section, "header", "headers") {
            cross.headers = v;
        }
    }

    fn configure_site(&self, key: &str, section: &Map) {
        let mut site = self
            .sites
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default();

        if let Some(v) = defs::get_str(section, "name") {
            site.name = v;
        }
        if let Some(v) = defs::get_bool(section, "ssl") {
            site.ssl = v;
        }
        if let Some(v) = defs::get_bool(section, "issue") {
            site.issue = v;
        }
        if let Some(v) = defs::get_str_list(section, "host", "hosts") {
            site.hosts = v;
        }
        if let Some(v) = defs::get_str(section, "charset") {
            site.charset = v;
        }
        if let Some(v) = defs::get_str(section, "domain") {
            site.domain = v;
        }
        if let Some(v) = defs::get_str(section, "cookie") {
            site.cookie = v;
        }
        if let Some(v) = defs::get_duration(section, "expiry") {
            site.expiry = Some(v);
        }
        if let Some(v) = defs::get_duration(section, "maxage") {
            site.max_age = Some(v);
        }
        if let Some(v) = defs::get_str(section, "confuse") {
            site.confuse = v;
        }
        if let Some(v) = defs::get_str(section, "validate") {
            site.validate = v;
        }
        if let Some(v) = defs::get_str(section, "format") {
            site.format = v;
        }
        if let Some(v) = defs::get_duration(section, "timeout") {
            site.timeout = Some(v);
        }
        if let Some(v) = defs::get_map(section, "setting") {
            site.setting = v.clone();
        }

        self.sites.write().unwrap().insert(key.to_string(), site);
    }

    // ---- lifecycle ----

    fn setup(&self) -> Result<()> {
        let mut config = self.config.write().unwrap();

        if !self.drivers.read().unwrap().contains_key(&config.driver) {
            return Err(eyre!("invalid http driver: {}", config.driver));
        }

        if config.upload.is_empty() {
            config.upload = std::env::temp_dir().to_string_lossy().to_string();
        }
        if config.static_root.is_empty() {
            config.static_root = "asset/statics".into();
        }
        if config.shared.is_empty() {
            config.shared = "shared".into();
        }
        if config.defaults.is_empty() {
            config.defaults = vec!["index.html".into(), "default.html".into(), "index.htm".into()];
        }

        let mut sites = self.sites.write().unwrap();
        let mut hosts = self.hosts.write().unwrap();

        if !sites.contains_key("") {
            sites.insert(
                String::new(),
                SiteConfig { issue: config.issue, ..SiteConfig::default() },
            );
        }

        for (key, site) in sites.iter_mut() {
            if site.charset.is_empty() {
                site.charset = config.charset.clone();
            }
            if site.domain.is_empty() {
                site.domain = config.domain.clone();
            }
            if site.expiry.is_none() {
                site.expiry = config.expiry;
            }
            if site.max_age.is_none() {
                site.max_age = config.max_age;
            }
            if site.cookie.is_empty() {
                site.cookie = config.cookie.clone();
            }
            if site.format.is_empty() {
                site.format =
                    "{device}/{system}/{version}/{client}/{number}/{time}/{path}".into();
            }

            // sites without explicit hosts answer on `<key>.<domain>`
            if site.hosts.is_empty() && !key.is_empty() {
                site.hosts.push(key.clone());
            }
            if !site.domain.is_empty() {
                for host in site.hosts.iter_mut() {
                    if !host.ends_with(&site.domain) {
                        *host = format!("{host}.{}", site.domain);
                    }
                }
            }

            for host in &site.hosts {
                hosts.insert(host.clone(), key.clone());
            }
        }

        drop(sites);
        drop(hosts);
        drop(config);

        self.build_actions();
        Ok(())
    }

    /// Pre-build the per-site and per-route action lists so dispatch stays
    /// lookup-only.
    fn build_actions(&self) {
        {
            let routers = self.routers.read().unwrap();
            let names = self.router_names.read().unwrap();
            let mut actions = self.router_actions.write().unwrap();
            for name in names.iter() {
                let Some(config) = routers.get(name) else { continue };
                let list = actions.entry(name.clone()).or_default();
                list.clear();
                if let Some(action) = &config.action {
                    list.push(action.clone());
                }
                list.extend(config.actions.iter().cloned());
            }
        }

        fn collect<T: Clone>(
            entries: &[(String, T)],
            site_of: impl Fn(&T) -> String,
            action_of: impl Fn(&T) -> HttpFunc,
        ) -> HashMap<String, Vec<HttpFunc>> {
            let mut out: HashMap<String, Vec<HttpFunc>> = HashMap::new();
            for (_, entry) in entries {
                out.entry(site_of(entry)).or_default().push(action_of(entry));
            }
            out
        }

        *self.request_actions.write().unwrap() = collect(
            &self.request_filters.read().unwrap(),
            |f: &RequestFilter| f.site.clone(),
            |f| f.action.clone(),
        );
        *self.execute_actions.write().unwrap() = collect(
            &self.execute_filters.read().unwrap(),
            |f: &ExecuteFilter| f.site.clone(),
            |f| f.action.clone(),
        );
        *self.response_actions.write().unwrap() = collect(
            &self.response_filters.read().unwrap(),
            |f: &ResponseFilter| f.site.clone(),
            |f| f.action.clone(),
        );
        *self.found_actions.write().unwrap() = collect(
            &self.found_handlers.read().unwrap(),
            |h: &FoundHandler| h.site.clone(),
            |h| h.action.clone(),
        );
        *self.error_actions.write().unwrap() = collect(
            &self.error_handlers.read().unwrap(),
            |h: &ErrorHandler| h.site.clone(),
            |h| h.action.clone(),
        );
        *self.failed_actions.write().unwrap() = collect(
            &self.failed_handlers.read().unwrap(),
            |h: &FailedHandler| h.site.clone(),
            |h| h.action.clone(),
        );
        *self.denied_actions.write().unwrap() = collect(
            &self.denied_handlers.read().unwrap(),
            |h: &DeniedHandler| h.site.clone(),
            |h| h.action.clone(),
        );
    }

    fn registering(&self, config: &Router) -> HttpRegister {
        let mut methods = Vec::new();
        if !config.method.is_empty() {
            methods.push(config.method.clone());
        }

        let hosts = self
            .sites
            .read()
            .unwrap()
            .get(config.site())
            .map(|site| site.hosts.clone())
            .unwrap_or_default();

        HttpRegister {
            site: config.site().to_string(),
            uris: config.uris.clone(),
            methods,
            hosts,
        }
    }

    async fn attach(&'static self) -> Result<()> {
        let config = self.config.read().unwrap().clone();
        let driver = self
            .drivers
            .read()
            .unwrap()
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| eyre!("invalid http driver: {}", config.driver))?;

        let connect = driver
            .connect(config)
            .await
            .wrap_err("failed to connect http driver")?;
        connect.open().await.wrap_err("failed to open http driver")?;

        connect.accept(Arc::new(move |thread| Box::pin(self.serve(thread))))?;

        {
            let routers = self.routers.read().unwrap();
            let names = self.router_names.read().unwrap();
            for name in names.iter() {
                if let Some(config) = routers.get(name) {
                    connect
                        .register(name, self.registering(config))
                        .wrap_err_with(|| format!("failed to register route {name}"))?;
                }
            }
        }

        *self.connect.write().unwrap() = Some(connect);
        Ok(())
    }

    // ---- the serve pipeline ----

    /// One request, end to end.
    pub async fn serve(&'static self, thread: Box<dyn HttpThread>) {
        let mut ctx = Access::create(self, thread);

        if let Some(config) = self.router_for(&ctx.name, &ctx.method) {
            if !config.setting.is_empty() {
                ctx.setting = config.setting.clone();
            }
            ctx.config = config;
        }

        // bearer token: site cookie first, Authorization header verbatim
        let mut token = String::new();
        if !ctx.site_config.cookie.is_empty() {
            token = ctx.raw_cookie(&ctx.site_config.cookie);
        }
        let header = ctx.req_header("authorization");
        if !header.is_empty() {
            token = header;
        }

        if !token.is_empty() {
            if let Ok(verify) = token::verify(&token) {
                ctx.context.token = token;
                for (k, v) in &verify.payload {
                    ctx.sessions.insert(k.clone(), v.clone());
                }
                ctx.context.verify = Some(verify);
            }
        }

        if ctx.context.token.is_empty() {
            if ctx.site_config.issue {
                if let Ok(token) = token::sign(&Token::default()) {
                    ctx.issue = true;
                    ctx.context.token = token;
                    ctx.context.verify = Some(Token::default());
                }
            }
        } else if ctx.sessional(true) {
            let id = ctx.context.act_id();
            if let Ok(Some(saved)) = SESSION.read(&id).await {
                for (k, v) in saved {
                    ctx.sessions.insert(k, v);
                }
            }

            // at most one liveness stamp per day of observed activity
            let now = Utc::now().timestamp();
            let stale = match defs::get_i64(&ctx.sessions, "$alive") {
                Some(last) => now - last > 24 * 3600,
                None => true,
            };
            if stale {
                ctx.set_session("$alive", Some(Value::from(now)));
            }
        }

        let site_filters = self
            .request_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(site_filters);
        let stages: [HttpFunc; 3] = [
            Arc::new(access_stage),
            Arc::new(request_stage),
            Arc::new(execute_stage),
        ];
        ctx.push(stages);
        ctx.next().await;

        if ctx.sessional(false) {
            let id = ctx.context.act_id();
            if !id.is_empty() {
                let expiry = ctx.site_config.expiry;
                if let Err(err) = SESSION.write(&id, ctx.sessions.clone(), expiry).await {
                    tracing::warn!(error = %err, "session write-back failed");
                }
            }
        }

        self.response(&mut ctx).await;
    }

    /// Cross-origin gate: all three checks must pass to emit the
    /// `Access-Control-Allow-*` headers; a passing OPTIONS request
    /// short-circuits the pipeline.
    async fn access_stage(&'static self, ctx: &mut Access) {
        let cross = self.cross.read().unwrap().clone();

        if cross.allow {
            let origin = ctx.req_header("origin");
            let method = ctx.req_header("access-control-request-method");
            let headers = ctx.req_header("access-control-request-headers");

            let origin_ok = allows_any(&cross.origins)
                || (!origin.is_empty()
                    && cross.origins.iter().any(|o| origin.starts_with(o.as_str())));
            let method_ok = allows_any(&cross.methods)
                || (!method.is_empty()
                    && split_list(&method)
                        .iter()
                        .all(|m| contains_ignore_case(&cross.methods, m)));
            let headers_ok = allows_any(&cross.headers)
                || (!headers.is_empty()
                    && split_list(&headers)
                        .iter()
                        .all(|h| contains_ignore_case(&cross.headers, h)));

            if origin_ok && method_ok && headers_ok {
                ctx.set_header("Access-Control-Allow-Credentials", "true");
                if !origin.is_empty() {
                    ctx.set_header("Access-Control-Allow-Origin", &origin);
                }
                if !method.is_empty() {
                    ctx.set_header("Access-Control-Allow-Methods", &method);
                }
                if !headers.is_empty() {
                    ctx.set_header("Access-Control-Allow-Headers", &headers);
                    ctx.set_header("Access-Control-Expose-Headers", &headers);
                }

                if ctx.method == "OPTIONS" {
                    ctx.text("cross domain access allowed.", Some(200));
                    return;
                }
            }
        }

        ctx.next().await;
    }

    /// Unmatched requests fall back to static files; matched routes run the
    /// staged gates in order, short-circuiting into the right funnel.
    async fn request_stage(&'static self, ctx: &mut Access) {
        if ctx.name.is_empty() {
            let config = self.config.read().unwrap().clone();
            let rel = ctx.path.trim_start_matches('/');

            let mut file = resolve_static(
                Path::new(&config.static_root).join(&ctx.site).join(rel),
                &config.defaults,
            )
            .await;
            if file.is_none() {
                file = resolve_static(
                    Path::new(&config.static_root).join(&config.shared).join(rel),
                    &config.defaults,
                )
                .await;
            }

            match file {
                Some(path) => ctx.file(&path.to_string_lossy(), "", ""),
                None => ctx.found().await,
            }
            return;
        }

        if let Err(res) = ctx.form_handler().await {
            ctx.result(res);
            self.failed(ctx).await;
            return;
        }
        if let Err(res) = ctx.client_handler() {
            ctx.result(res);
            self.failed(ctx).await;
            return;
        }
        if let Err(res) = ctx.args_handler() {
            ctx.result(res);
            self.failed(ctx).await;
            return;
        }
        if let Err(res) = ctx.auth_handler() {
            ctx.result(res);
            self.denied(ctx).await;
            return;
        }
        if let Err(res) = ctx.sign_handler().await {
            ctx.result(res);
            self.denied(ctx).await;
            return;
        }
        if let Err(res) = ctx.item_handler().await {
            ctx.result(res);
            self.failed(ctx).await;
            return;
        }

        ctx.next().await;
    }

    /// Execute filters, then the route actions.
    async fn execute_stage(&'static self, ctx: &mut Access) {
        ctx.clear();

        let filters = self
            .execute_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(filters);

        let actions = self
            .router_actions
            .read()
            .unwrap()
            .get(&ctx.name)
            .cloned()
            .unwrap_or_default();
        ctx.push(actions);

        ctx.next().await;
    }

    /// Response filters, then the body render.
    pub(crate) async fn response(&'static self, ctx: &mut Access) {
        ctx.clear();

        let filters = self
            .response_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(filters);
        ctx.push([Arc::new(body_stage) as HttpFunc]);

        ctx.next().await;
    }

    // ---- error funnels ----

    pub(crate) async fn found(&'static self, ctx: &mut Access) {
        ctx.clear();
        if ctx.code == 0 {
            ctx.code = 404;
        }

        if let Some(handler) = ctx.config.found.clone() {
            ctx.push([handler]);
        }
        let handlers = self
            .found_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(handlers);
        ctx.push([Arc::new(found_default_stage) as HttpFunc]);

        ctx.next().await;
    }

    async fn found_default(&'static self, ctx: &mut Access) {
        let res = ctx
            .context
            .last_result()
            .cloned()
            .unwrap_or_else(|| result::state("_found"));
        ctx.code = 404;

        if ctx.ajax {
            ctx.answer(&res, None);
            ctx.code = 404;
        } else {
            ctx.text("not found", Some(404));
        }
    }

    pub(crate) async fn error(&'static self, ctx: &mut Access) {
        ctx.clear();
        if ctx.code == 0 {
            ctx.code = 500;
        }

        if let Some(handler) = ctx.config.error.clone() {
            ctx.push([handler]);
        }
        let handlers = self
            .error_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(handlers);
        ctx.push([Arc::new(error_default_stage) as HttpFunc]);

        ctx.next().await;
    }

    async fn error_default(&'static self, ctx: &mut Access) {
        let res = ctx
            .context
            .last_result()
            .cloned()
            .unwrap_or_else(|| result::state("_error"));
        ctx.code = 500;

        if ctx.ajax {
            ctx.answer(&res, None);
            ctx.code = 500;
        } else {
            let code = res.resolved_code();
            let text = ctx.string(res.state(), res.args());
            ctx.data.insert("status".into(), json!(500));
            ctx.data
                .insert("error".into(), json!({ "code": code, "text": text }));
            ctx.view("error");
        }
    }

    pub(crate) async fn failed(&'static self, ctx: &mut Access) {
        ctx.clear();
        if ctx.code == 0 {
            ctx.code = 400;
        }

        if let Some(handler) = ctx.config.failed.clone() {
            ctx.push([handler]);
        }
        let handlers = self
            .failed_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(handlers);
        ctx.push([Arc::new(failed_default_stage) as HttpFunc]);

        ctx.next().await;
    }

    async fn failed_default(&'static self, ctx: &mut Access) {
        let res = ctx
            .context
            .last_result()
            .cloned()
            .unwrap_or_else(|| result::state("_failed"));

        if ctx.ajax {
            ctx.answer(&res, None);
            ctx.code = 400;
        } else {
            ctx.alert(&res, None);
            ctx.code = 400;
        }
    }

    pub(crate) async fn denied(&'static self, ctx: &mut Access) {
        ctx.clear();
        if ctx.code == 0 {
            ctx.code = 401;
        }

        if let Some(handler) = ctx.config.denied.clone() {
            ctx.push([handler]);
        }
        let handlers = self
            .denied_actions
            .read()
            .unwrap()
            .get(&ctx.site)
            .cloned()
            .unwrap_or_default();
        ctx.push(handlers);
        ctx.push([Arc::new(denied_default_stage) as HttpFunc]);

        ctx.next().await;
    }

    async fn denied_default(&'static self, ctx: &mut Access) {
        let res = ctx
            .context
            .last_result()
            .cloned()
            .unwrap_or_else(|| result::state("_denied"));

        if ctx.ajax {
            ctx.answer(&res, None);
            ctx.code = 401;
        } else {
            ctx.alert(&res, None);
            ctx.code = 401;
        }
    }

    // ---- urls and helpers ----

    /// Build a url for a named route: substitute `{param}` segments from
    /// `args`, append leftovers as a query string, prefix the site host
    /// when one is configured.
    pub fn route_url(&self, site: &str, name: &str, args: &Map) -> String {
        let qualified = if name.contains('.') {
            name.to_string()
        } else {
            format!("{site}.{name}")
        };

        let Some(config) = self.router_for(&qualified, "") else {
            return String::new();
        };
        let Some(uri) = config.uris.first() else {
            return String::new();
        };

        let mut path = uri.clone();
        let mut query = Vec::new();
        for (key, value) in args {
            let marker = format!("{{{key}}}");
            let text = defs::text_of(value);
            if path.contains(&marker) {
                path = path.replace(&marker, &text);
            } else {
                query.push(format!(
                    "{}={}",
                    key,
                    form_urlencoded::byte_serialize(text.as_bytes()).collect::<String>()
                ));
            }
        }
        if !query.is_empty() {
            path = format!("{path}?{}", query.join("&"));
        }

        let site_config = self.site_config(config.site());
        if let Some(host) = site_config.hosts.first() {
            let scheme = if site_config.ssl { "https" } else { "http" };
            return format!("{scheme}://{host}{path}");
        }
        path
    }

    /// The standard helper set handed to view renders, merged over the
    /// globally registered helpers.
    pub(crate) fn view_helpers(&'static self, ctx: &Access) -> Helpers {
        let mut helpers = Helpers::new();

        let lang = ctx.lang().to_string();
        helpers.insert("lang", Arc::new(move |_args| Value::String(lang.clone())));

        let zone = ctx.context.zone_secs.unwrap_or(0);
        helpers.insert("zone", Arc::new(move |_args| Value::from(zone)));

        let lang_for_string = ctx.lang().to_string();
        helpers.insert(
            "string",
            Arc::new(move |args: &[Value]| {
                let key = args.first().and_then(Value::as_str).unwrap_or_default();
                let rest = args.get(1..).unwrap_or(&[]);
                Value::String(crate::basic::string(&lang_for_string, key, rest))
            }),
        );

        let sessions = ctx.sessions.clone();
        let probe = move |key: &str| -> Option<Map> {
            sessions
                .get(&format!("$.sign.{key}"))
                .and_then(Value::as_object)
                .cloned()
        };

        let signed_probe = probe.clone();
        helpers.insert(
            "signed",
            Arc::new(move |args: &[Value]| {
                let key = args.first().and_then(Value::as_str).unwrap_or_default();
                Value::Bool(signed_probe(key).is_some())
            }),
        );
        let signal_probe = probe.clone();
        helpers.insert(
            "signal",
            Arc::new(move |args: &[Value]| {
                let key = args.first().and_then(Value::as_str).unwrap_or_default();
                Value::String(
                    signal_probe(key)
                        .and_then(|m| defs::get_str(&m, "id"))
                        .unwrap_or_default(),
                )
            }),
        );
        let signer_probe = probe;
        helpers.insert(
            "signer",
            Arc::new(move |args: &[Value]| {
                let key = args.first().and_then(Value::as_str).unwrap_or_default();
                Value::String(
                    signer_probe(key)
                        .and_then(|m| defs::get_str(&m, "name"))
                        .unwrap_or_default(),
                )
            }),
        );

        let site = ctx.site.clone();
        helpers.insert(
            "route",
            Arc::new(move |args: &[Value]| {
                let name = args.first().and_then(Value::as_str).unwrap_or_default();
                let params = args
                    .get(1)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Value::String(HTTP.route_url(&site, name, &params))
            }),
        );

        let back = ctx.back_url();
        helpers.insert("backurl", Arc::new(move |_args| Value::String(back.clone())));

        let lang_for_option = ctx.lang().to_string();
        helpers.insert(
            "option",
            Arc::new(move |args: &[Value]| {
                let name = args.first().and_then(Value::as_str).unwrap_or_default();
                let field = args.get(1).and_then(Value::as_str).unwrap_or_default();
                let value = args.get(2).map(defs::text_of).unwrap_or_default();

                let key = format!("option_{name}_{field}_{value}");
                let text = crate::basic::string(&lang_for_option, &key, &[]);
                if text == key.replace('.', "_") {
                    Value::String(value)
                } else {
                    Value::String(text)
                }
            }),
        );

        helpers.merge_under(&VIEW.helpers());
        helpers
    }
}

impl Default for HttpModule {
    fn default() -> Self {
        Self::new()
    }
}

/// A registration handle scoped to one site: keys are prefixed with the
/// site name and router uris with the mount root.
pub struct Site {
    name: String,
    root: String,
}

/// Scope registrations to a site, optionally mounted under a uri root.
pub fn site(name: &str, root: &str) -> Site {
    Site { name: name.to_string(), root: root.trim_end_matches('/').to_string() }
}

impl Site {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, name: &str, value: impl Into<Registry>) {
        let key = format!("{}.{}", self.name, name);
        let mut value = value.into();

        if let Registry::Router(router) = &mut value {
            if !self.root.is_empty() {
                if !router.uri.is_empty() {
                    router.uri = format!("{}{}", self.root, router.uri);
                }
                for uri in router.uris.iter_mut() {
                    *uri = format!("{}{}", self.root, uri);
                }
            }
        }

        crate::kernel::register_with(&key, value, true);
    }

    pub fn route_url(&self, name: &str, args: &Map) -> String {
        HTTP.route_url(&self.name, name, args)
    }
}

// chain-callable wrappers over the module stage methods

fn access_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.access_stage(ctx).await })
}

fn request_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.request_stage(ctx).await })
}

fn execute_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.execute_stage(ctx).await })
}

fn body_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.render(ctx).await })
}

fn found_default_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.found_default(ctx).await })
}

fn error_default_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.error_default(ctx).await })
}

fn failed_default_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.failed_default(ctx).await })
}

fn denied_default_stage(ctx: &mut Access) -> HttpFuture<'_> {
    let module = ctx.module;
    Box::pin(async move { module.denied_default(ctx).await })
}

fn allows_any(list: &[String]) -> bool {
    list.is_empty() || list.iter().any(|v| v == "*")
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v.eq_ignore_ascii_case(value))
}

async fn resolve_static(path: std::path::PathBuf, defaults: &[String]) -> Option<std::path::PathBuf> {
    let meta = tokio::fs::metadata(&path).await.ok()?;
    if !meta.is_dir() {
        return Some(path);
    }
    for doc in defaults {
        let candidate = path.join(doc);
        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            if !meta.is_dir() {
                return Some(candidate);
            }
        }
    }
    None
}

#[async_trait::async_trait]
impl Module for HttpModule {
    fn name(&self) -> &'static str {
        "http"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        match value {
            Registry::HttpDriver(driver) => self.driver(name, driver.clone(), overwrite),
            Registry::Router(config) => self.router(name, config.clone(), overwrite),
            Registry::Filter(config) => self.filter(name, config.clone(), overwrite),
            Registry::RequestFilter(config) => {
                self.request_filter(name, config.clone(), overwrite)
            }
            Registry::ExecuteFilter(config) => {
                self.execute_filter(name, config.clone(), overwrite)
            }
            Registry::ResponseFilter(config) => {
                self.response_filter(name, config.clone(), overwrite)
            }
            Registry::Handler(config) => self.handler(name, config.clone(), overwrite),
            Registry::FoundHandler(config) => self.found_handler(name, config.clone(), overwrite),
            Registry::ErrorHandler(config) => self.error_handler(name, config.clone(), overwrite),
            Registry::FailedHandler(config) => {
                self.failed_handler(name, config.clone(), overwrite)
            }
            Registry::DeniedHandler(config) => {
                self.denied_handler(name, config.clone(), overwrite)
            }
            Registry::Item(config) => self.item(name, config.clone(), overwrite),
            _ => {}
        }
    }

    fn configure(&self, config: &Map) {
        if let Some(section) = defs::get_map(config, "http") {
            self.configure_http(section);
        }
        if let Some(section) = defs::get_map(config, "cross") {
            self.configure_cross(section);
        }

        if let Some(sites) = defs::get_map(config, "site") {
            let mut flat = Map::new();
            for (key, value) in sites {
                if let Some(section) = value.as_object() {
                    self.configure_site(key, section);
                } else {
                    flat.insert(key.clone(), value.clone());
                }
            }
            // loose keys configure the implicit catch-all site
            if !flat.is_empty() {
                self.configure_site("", &flat);
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        self.setup()
    }

    async fn connect(&self) -> Result<()> {
        // the registered instance is the process-wide singleton; requests
        // borrow it statically through the driver callback
        HTTP.attach().await
    }

    async fn launch(&self) -> Result<()> {
        let connect = self.connect.read().unwrap().clone();
        let Some(connect) = connect else {
            return Err(eyre!("http module is not connected"));
        };

        let config = self.config.read().unwrap().clone();
        if !config.cert_file.is_empty() && !config.key_file.is_empty() {
            connect.start_tls(&config.cert_file, &config.key_file).await?;
        } else {
            connect.start().await?;
        }

        tracing::info!(port = config.port, "http listening");
        Ok(())
    }

    async fn terminate(&self) {
        let connect = self.connect.write().unwrap().take();
        if let Some(connect) = connect {
            let _ = connect.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;

    #[test]
    fn hosts_index_inverts_site_hosts() {
        let module = HttpModule::new();
        module.driver(
            "default",
            Arc::new(crate::adapters::hyper_server::HyperDriver::new()),
            true,
        );

        module.configure(&map! {
            "http" => { "domain": "example.com" },
            "site" => {
                "www": { "name": "Main" },
                "api": { "hosts": ["api.example.com", "open.example.com"] },
            }
        });
        module.setup().unwrap();

        assert_eq!(module.site_of("www.example.com"), Some("www".into()));
        assert_eq!(module.site_of("api.example.com"), Some("api".into()));
        assert_eq!(module.site_of("open.example.com"), Some("api".into()));
        assert_eq!(module.site_of("nope.example.com"), None);
        assert!(module.sites.read().unwrap().contains_key(""));
    }

    #[test]
    fn router_lookup_falls_back_to_wildcard() {
        let module = HttpModule::new();
        module.configure(&map! { "site" => { "www": { "name": "Main" } } });

        module.router(
            "www.page",
            Router { uri: "/page".into(), ..Router::default() },
            true,
        );
        let mut routing = Routing::new();
        routing.insert("post".into(), Router::default());
        module.router(
            "www.form",
            Router { uri: "/form".into(), routing, ..Router::default() },
            true,
        );

        assert!(module.router_for("www.page.*", "GET").is_some());
        assert!(module.router_for("www.page", "GET").is_some());
        assert!(module.router_for("www.form", "POST").is_some());
        assert!(module.router_for("www.form", "GET").is_none());
        assert!(module.router_for("www.ghost", "GET").is_none());
    }

    #[test]
    fn route_url_substitutes_params() {
        let module = HttpModule::new();
        module.configure(&map! {
            "http" => { "domain": "example.com" },
            "site" => { "www": { "name": "Main" } }
        });

        module.router(
            "www.user",
            Router { uri: "/user/{id}".into(), ..Router::default() },
            true,
        );
        module.setup_for_tests();

        let url = module.route_url("www", "user", &map! { "id" => 42, "tab" => "posts" });
        assert_eq!(url, "http://www.example.com/user/42?tab=posts");
    }

    impl HttpModule {
        fn setup_for_tests(&self) {
            self.driver(
                "default",
                Arc::new(crate::adapters::hyper_server::HyperDriver::new()),
                true,
            );
            self.setup().unwrap();
        }
    }
}
