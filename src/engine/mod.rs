//! The method engine: named business methods with typed in/out schemas.
//!
//! A [`Method`] couples an action with an argument schema, an optional
//! response schema and auth flags. Dispatch normalizes every action shape
//! into `(Map, Res, Shape)`; the `invoke*` wrappers adapt that normalized
//! form back to what each call site expects. [`Library`] namespaces
//! registrations; [`Logic`] is a context-bound caller that prefixes every
//! inner name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::basic::{mapping, vars_extend, Var, Vars};
use crate::context::Context;
use crate::defs::{self, Map, Value};
use crate::kernel::{Module, Registry};
use crate::result::{Res, FAIL, NOTHING, OK, RETRY, UNAUTHORIZED};

/// Fired asynchronously after every module has launched.
pub const START_TRIGGER: &str = "$.strata.start";
/// Executed synchronously before modules terminate.
pub const STOP_TRIGGER: &str = "$.strata.stop";

pub static ENGINE: Lazy<EngineModule> = Lazy::new(EngineModule::new);

pub type ActFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ActFn<T> = Arc<dyn for<'a> Fn(&'a mut Context) -> ActFuture<'a, T> + Send + Sync>;

/// The closed set of action shapes. Each constructor tags how its return is
/// normalized; the dispatcher never inspects function types at runtime.
#[derive(Clone)]
pub enum Action {
    /// Unit action returning only a result.
    Invoke(ActFn<Res>),
    /// Yes/no action; `true` normalizes to OK, `false` to Fail.
    Invoked(ActFn<bool>),
    /// Single record.
    Record(ActFn<(Map, Res)>),
    /// Record list, normalized to `{items}`.
    Records(ActFn<(Vec<Map>, Res)>),
    /// Count, normalized to `{count}`.
    Count(ActFn<f64>),
    /// Count plus records, normalized to `{count, items}`.
    Paged(ActFn<(i64, Vec<Map>, Res)>),
    /// Record plus records, normalized to `{item, items}`.
    Mixed(ActFn<(Map, Vec<Map>, Res)>),
}

macro_rules! action_ctor {
    ($fn_name:ident, $variant:ident, $out:ty) => {
        pub fn $fn_name(
            f: impl for<'a> Fn(&'a mut Context) -> ActFuture<'a, $out> + Send + Sync + 'static,
        ) -> Action {
            Action::$variant(Arc::new(f))
        }
    };
}

impl Action {
    action_ctor!(invoke, Invoke, Res);
    action_ctor!(invoked, Invoked, bool);
    action_ctor!(record, Record, (Map, Res));
    action_ctor!(records, Records, (Vec<Map>, Res));
    action_ctor!(count, Count, f64);
    action_ctor!(paged, Paged, (i64, Vec<Map>, Res));
    action_ctor!(mixed, Mixed, (Map, Vec<Map>, Res));
}

/// Normalized return category of a dispatched method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Invoke,
    Invokes,
    Invoking,
    Invoker,
    Invokee,
    Invoked,
}

#[derive(Clone, Default)]
pub struct Method {
    pub name: String,
    pub desc: String,
    pub alias: Vec<String>,
    pub nullable: bool,
    pub args: Vars,
    pub data: Vars,
    pub setting: Map,
    pub action: Option<Action>,
    /// Retry budget, honored only by retry-capable callers such as queues.
    pub retry: i64,
    pub token: bool,
    pub auth: bool,
}

#[derive(Clone, Default)]
struct EngineConfig {
    pool: i64,
    setting: Map,
}

pub struct EngineModule {
    config: RwLock<EngineConfig>,
    methods: RwLock<HashMap<String, Method>>,
}

impl EngineModule {
    pub fn new() -> EngineModule {
        EngineModule {
            config: RwLock::new(EngineConfig::default()),
            methods: RwLock::new(HashMap::new()),
        }
    }

    pub fn method(&self, name: &str, config: Method, overwrite: bool) {
        let mut keys = Vec::new();
        if !name.is_empty() {
            keys.push(name.to_string());
        }
        keys.extend(config.alias.iter().cloned());

        let mut methods = self.methods.write().unwrap();
        for key in keys {
            if overwrite || !methods.contains_key(&key) {
                methods.insert(key, config.clone());
            }
        }
    }

    /// The argument schema of a method, extended with overlays.
    pub fn arguments(&self, name: &str, extends: Vars) -> Vars {
        let base = self
            .methods
            .read()
            .unwrap()
            .get(name)
            .map(|m| m.args.clone())
            .unwrap_or_default();
        vars_extend(base, extends)
    }

    /// Dispatch with the engine's degradation rules applied: `Retry` becomes
    /// `Fail` here since a local call cannot be replayed.
    pub async fn call(
        &self,
        ctx: &mut Context,
        name: &str,
        value: Map,
        setting: Option<Map>,
    ) -> (Map, Res, Shape) {
        let (data, res, shape) = self.dispatch(ctx, name, value, setting).await;
        if res.code() == RETRY.code() {
            (data, FAIL.clone(), shape)
        } else {
            (data, res, shape)
        }
    }

    /// The raw local dispatch. `Nothing` means the method is not registered
    /// here; callers with a remote path hook off that result.
    async fn dispatch(
        &self,
        ctx: &mut Context,
        name: &str,
        value: Map,
        setting: Option<Map>,
    ) -> (Map, Res, Shape) {
        let Some(method) = self.methods.read().unwrap().get(name).cloned() else {
            return (Map::new(), NOTHING.clone(), Shape::Invoke);
        };

        if method.token && ctx.token.is_empty() {
            return (Map::new(), UNAUTHORIZED.clone(), Shape::Invoke);
        }
        if method.auth && !ctx.authorized() {
            return (Map::new(), UNAUTHORIZED.clone(), Shape::Invoke);
        }

        let setting = match setting {
            Some(setting) => setting,
            None => {
                let mut merged = Map::new();
                defs::merge(&mut merged, &method.setting);
                merged
            }
        };

        let mut args = Map::new();
        if !method.args.is_empty() {
            if let Err(res) = mapping(
                &method.args,
                &value,
                &mut args,
                method.nullable,
                false,
                &ctx.map_ctx(),
            ) {
                return (Map::new(), res, Shape::Invoke);
            }
        }

        ctx.name = name.to_string();
        ctx.setting = setting;
        ctx.value = value;
        ctx.args = args;

        let (mut data, result, shape) = match &method.action {
            None => (Map::new(), OK.clone(), Shape::Invoke),
            Some(Action::Invoke(f)) => (Map::new(), f(ctx).await, Shape::Invoke),
            Some(Action::Invoked(f)) => {
                let ok = f(ctx).await;
                let res = if ok { OK.clone() } else { FAIL.clone() };
                (Map::new(), res, Shape::Invoked)
            }
            Some(Action::Record(f)) => {
                let (data, res) = f(ctx).await;
                (data, res, Shape::Invoke)
            }
            Some(Action::Records(f)) => {
                let (items, res) = f(ctx).await;
                (map! { "items" => items }, res, Shape::Invokes)
            }
            Some(Action::Count(f)) => {
                let count = f(ctx).await;
                (map! { "count" => count }, OK.clone(), Shape::Invokee)
            }
            Some(Action::Paged(f)) => {
                let (count, items, res) = f(ctx).await;
                (map! { "count" => count, "items" => items }, res, Shape::Invoking)
            }
            Some(Action::Mixed(f)) => {
                let (item, items, res) = f(ctx).await;
                (map! { "item" => item, "items" => items }, res, Shape::Invoker)
            }
        };

        // response-side schema: applied when it succeeds, raw data otherwise
        if !method.data.is_empty() {
            let mut shaped = Map::new();
            if mapping(
                &method.data,
                &data,
                &mut shaped,
                false,
                false,
                &ctx.map_ctx(),
            )
            .is_ok()
            {
                data = shaped;
            }
        }

        (data, result, shape)
    }
}

impl Default for EngineModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for EngineModule {
    fn name(&self) -> &'static str {
        "engine"
    }

    fn register(&self, name: &str, value: &Registry, overwrite: bool) {
        if let Registry::Method(method) = value {
            self.method(name, method.clone(), overwrite);
        }
    }

    fn configure(&self, config: &Map) {
        let Some(section) = defs::get_map(config, "engine") else {
            return;
        };
        let mut cfg = self.config.write().unwrap();
        if let Some(pool) = defs::get_i64(section, "pool") {
            cfg.pool = pool.max(0);
        }
        if let Some(setting) = defs::get_map(section, "setting") {
            cfg.setting = setting.clone();
        }
    }
}

// call adapters

/// Single record: unwraps `{items}` to its first element when the action
/// was naturally list-shaped.
pub async fn invoke(
    ctx: &mut Context,
    name: &str,
    value: Map,
    setting: Option<Map>,
) -> (Option<Map>, Res) {
    let (data, res, shape) = ENGINE.call(ctx, name, value, setting).await;
    if res.is_fail() {
        return (None, res);
    }

    let item = match shape {
        Shape::Invokes => data
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(Value::as_object)
            .cloned(),
        _ => Some(data),
    };
    (item, res)
}

/// Record list: wraps a single record when the action was record-shaped.
pub async fn invokes(
    ctx: &mut Context,
    name: &str,
    value: Map,
    setting: Option<Map>,
) -> (Vec<Map>, Res) {
    let (data, res, _) = ENGINE.call(ctx, name, value, setting).await;
    if res.is_fail() {
        return (Vec::new(), res);
    }

    if let Some(items) = data.get("items").and_then(Value::as_array) {
        let items = items
            .iter()
            .filter_map(Value::as_object)
            .cloned()
            .collect();
        return (items, res);
    }
    if !data.is_empty() {
        return (vec![data], res);
    }
    (Vec::new(), res)
}

/// Yes/no adapter.
pub async fn invoked(
    ctx: &mut Context,
    name: &str,
    value: Map,
    setting: Option<Map>,
) -> (bool, Res) {
    let (_, res, _) = ENGINE.call(ctx, name, value, setting).await;
    (res.is_ok(), res)
}

/// Paged adapter: injects `offset`/`limit` and reads `{count, items}` back.
pub async fn invoking(
    ctx: &mut Context,
    name: &str,
    offset: i64,
    limit: i64,
    value: Map,
    setting: Option<Map>,
) -> (i64, Vec<Map>, Res) {
    let mut value = value;
    value.insert("offset".into(), Value::from(offset));
    value.insert("limit".into(), Value::from(limit));

    let (data, res, _) = ENGINE.call(ctx, name, value, setting).await;
    if res.is_fail() {
        return (0, Vec::new(), res);
    }

    let count = defs::get_i64(&data, "count");
    let items = data.get("items").and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_object)
            .cloned()
            .collect::<Vec<_>>()
    });

    match (count, items) {
        (Some(count), Some(items)) => (count, items, res),
        _ => (0, vec![data], res),
    }
}

/// Record-plus-records adapter.
pub async fn invoker(
    ctx: &mut Context,
    name: &str,
    value: Map,
    setting: Option<Map>,
) -> (Option<Map>, Vec<Map>, Res) {
    let (data, res, _) = ENGINE.call(ctx, name, value, setting).await;
    if res.is_fail() {
        return (None, Vec::new(), res);
    }

    let item = data.get("item").and_then(Value::as_object).cloned();
    let items = data.get("items").and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_object)
            .cloned()
            .collect::<Vec<_>>()
    });

    match (item, items) {
        (Some(item), Some(items)) => (Some(item), items, res),
        _ => (Some(data.clone()), vec![data], res),
    }
}

/// Count adapter.
pub async fn invokee(
    ctx: &mut Context,
    name: &str,
    value: Map,
    setting: Option<Map>,
) -> (f64, Res) {
    let (data, res, _) = ENGINE.call(ctx, name, value, setting).await;
    if res.is_fail() {
        return (0.0, res);
    }
    (defs::get_f64(&data, "count").unwrap_or(0.0), res)
}

/// Synchronous local execution on a fresh context.
pub async fn execute(name: &str, value: Map) -> (Map, Res) {
    let mut ctx = Context::new();
    let (data, res, _) = ENGINE.call(&mut ctx, name, value, None).await;
    ctx.terminal();
    (data, res)
}

/// Fire-and-forget local execution.
pub fn trigger(name: &str, value: Map) {
    let name = name.to_string();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = execute(&name, value).await;
        });
    }
}

/// A registration handle that prefixes every name with a library namespace
/// and auto-numbers failure result codes from a cardinal.
pub struct Library {
    name: String,
    cardinal: AtomicI64,
}

impl Library {
    pub fn new(name: &str, cardinal: i64) -> Library {
        Library { name: name.to_string(), cardinal: AtomicI64::new(cardinal) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn naming(&self, name: &str) -> String {
        if self.name.is_empty() || name.starts_with(&format!("{}.", self.name)) {
            name.to_string()
        } else {
            format!("{}.{}", self.name, name)
        }
    }

    pub fn register(&self, name: &str, value: impl Into<Registry>, overwrite: bool) {
        crate::kernel::register_with(&self.naming(name), value.into(), overwrite);
    }

    /// Declare a result scoped to this library; failures take the next code
    /// from the cardinal.
    pub fn result(&self, ok: bool, state: &str, text: &str) -> Res {
        let code = if ok { 0 } else { self.cardinal.fetch_add(1, Ordering::Relaxed) };
        crate::result::declare(code, &self.naming(state), text)
    }
}

/// A scoped caller: every inner call is prefixed with the logic name and
/// threads the logic's setting map.
pub struct Logic {
    pub name: String,
    pub setting: Map,
}

impl Logic {
    pub fn new(name: &str, setting: Map) -> Logic {
        Logic { name: name.to_string(), setting }
    }

    fn naming(&self, name: &str) -> String {
        format!("{}.{}", self.name, name)
    }

    pub async fn invoke(&self, ctx: &mut Context, name: &str, value: Map) -> Option<Map> {
        let (item, res) =
            invoke(ctx, &self.naming(name), value, Some(self.setting.clone())).await;
        ctx.set_result(res);
        item
    }

    pub async fn invokes(&self, ctx: &mut Context, name: &str, value: Map) -> Vec<Map> {
        let (items, res) =
            invokes(ctx, &self.naming(name), value, Some(self.setting.clone())).await;
        ctx.set_result(res);
        items
    }

    pub async fn invoked(&self, ctx: &mut Context, name: &str, value: Map) -> bool {
        let (ok, res) =
            invoked(ctx, &self.naming(name), value, Some(self.setting.clone())).await;
        ctx.set_result(res);
        ok
    }

    pub async fn invoking(
        &self,
        ctx: &mut Context,
        name: &str,
        offset: i64,
        limit: i64,
        value: Map,
    ) -> (i64, Vec<Map>) {
        let (count, items, res) = invoking(
            ctx,
            &self.naming(name),
            offset,
            limit,
            value,
            Some(self.setting.clone()),
        )
        .await;
        ctx.set_result(res);
        (count, items)
    }

    pub async fn invoker(
        &self,
        ctx: &mut Context,
        name: &str,
        value: Map,
    ) -> (Option<Map>, Vec<Map>) {
        let (item, items, res) =
            invoker(ctx, &self.naming(name), value, Some(self.setting.clone())).await;
        ctx.set_result(res);
        (item, items)
    }

    pub async fn invokee(&self, ctx: &mut Context, name: &str, value: Map) -> f64 {
        let (count, res) =
            invokee(ctx, &self.naming(name), value, Some(self.setting.clone())).await;
        ctx.set_result(res);
        count
    }
}

/// Standard argument schema for paged methods.
pub fn paging_args(offset: i64, limit: i64, extends: Vars) -> Vars {
    let mut offset_var = Var::required("int");
    offset_var.default = Some(Value::from(offset).into());
    offset_var.name = "offset".into();

    let mut limit_var = Var::required("int");
    limit_var.default = Some(Value::from(limit).into());
    limit_var.name = "limit".into();

    let mut config = Vars::new();
    config.insert("offset".into(), offset_var);
    config.insert("limit".into(), limit_var);
    vars_extend(config, extends)
}

use crate::map;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::types;
    use crate::codec;
    use serde_json::json;

    fn setup() -> EngineModule {
        crate::result::builtin();
        types::builtin();
        codec::builtin();
        EngineModule::new()
    }

    fn list_method() -> Method {
        Method {
            name: "list".into(),
            args: Vars::new(),
            action: Some(Action::paged(|_ctx: &mut Context| {
                Box::pin(async move {
                    (2i64, vec![map! { "a" => 1 }, map! { "a" => 2 }], OK.clone())
                })
            })),
            ..Method::default()
        }
    }

    #[tokio::test]
    async fn unknown_method_is_nothing() {
        let engine = setup();
        let mut ctx = Context::new();
        let (_, res, _) = engine.call(&mut ctx, "ghost", Map::new(), None).await;
        assert_eq!(res, NOTHING.clone());
    }

    #[tokio::test]
    async fn paged_shape_normalizes_and_adapts() {
        let engine = setup();
        engine.method("list", list_method(), true);

        let mut ctx = Context::new();
        let (data, res, shape) = engine.call(&mut ctx, "list", Map::new(), None).await;
        assert!(res.is_ok());
        assert_eq!(shape, Shape::Invoking);
        assert_eq!(data.get("count"), Some(&json!(2)));
        assert_eq!(
            data.get("items"),
            Some(&json!([{ "a": 1 }, { "a": 2 }]))
        );
    }

    #[tokio::test]
    async fn args_schema_gates_dispatch() {
        let engine = setup();
        let method = Method {
            name: "sum".into(),
            args: [("x".to_string(), Var::required("int"))].into_iter().collect(),
            action: Some(Action::record(|ctx: &mut Context| {
                Box::pin(async move {
                    let x = defs::get_i64(&ctx.args, "x").unwrap_or(0);
                    (map! { "twice" => x * 2 }, OK.clone())
                })
            })),
            ..Method::default()
        };
        engine.method("sum", method, true);

        let mut ctx = Context::new();
        let (_, res, _) = engine.call(&mut ctx, "sum", Map::new(), None).await;
        assert!(res.is_fail());

        let (data, res, _) = engine
            .call(&mut ctx, "sum", map! { "x" => "21" }, None)
            .await;
        assert!(res.is_ok());
        assert_eq!(data.get("twice"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn token_and_auth_gates() {
        let engine = setup();
        let method = Method {
            name: "me".into(),
            token: true,
            auth: true,
            action: Some(Action::invoke(|_ctx: &mut Context| {
                Box::pin(async move { OK.clone() })
            })),
            ..Method::default()
        };
        engine.method("me", method, true);

        let mut ctx = Context::new();
        let (_, res, _) = engine.call(&mut ctx, "me", Map::new(), None).await;
        assert_eq!(res, UNAUTHORIZED.clone());

        ctx.token = "present".into();
        let (_, res, _) = engine.call(&mut ctx, "me", Map::new(), None).await;
        assert_eq!(res, UNAUTHORIZED.clone());

        ctx.verify = Some(crate::token::Token {
            header: crate::token::TokenHeader { auth: true, ..Default::default() },
            payload: Map::new(),
        });
        let (_, res, _) = engine.call(&mut ctx, "me", Map::new(), None).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn retry_degrades_to_fail() {
        let engine = setup();
        let method = Method {
            name: "flaky".into(),
            action: Some(Action::invoke(|_ctx: &mut Context| {
                Box::pin(async move { RETRY.clone() })
            })),
            ..Method::default()
        };
        engine.method("flaky", method, true);

        let mut ctx = Context::new();
        let (_, res, _) = engine.call(&mut ctx, "flaky", Map::new(), None).await;
        assert_eq!(res, FAIL.clone());
    }

    #[tokio::test]
    async fn data_schema_reshapes_output() {
        let engine = setup();
        let method = Method {
            name: "narrow".into(),
            data: [("kept".to_string(), Var::required("int"))].into_iter().collect(),
            action: Some(Action::record(|_ctx: &mut Context| {
                Box::pin(async move {
                    (map! { "kept" => "5", "dropped" => true }, OK.clone())
                })
            })),
            ..Method::default()
        };
        engine.method("narrow", method, true);

        let mut ctx = Context::new();
        let (data, res, _) = engine.call(&mut ctx, "narrow", Map::new(), None).await;
        assert!(res.is_ok());
        assert_eq!(data.get("kept"), Some(&json!(5)));
        assert!(!data.contains_key("dropped"));
    }

    #[tokio::test]
    async fn bool_shape_maps_to_ok_fail() {
        let engine = setup();
        let method = Method {
            name: "allowed".into(),
            action: Some(Action::invoked(|_ctx: &mut Context| {
                Box::pin(async move { false })
            })),
            ..Method::default()
        };
        engine.method("allowed", method, true);

        let mut ctx = Context::new();
        let (_, res, shape) = engine.call(&mut ctx, "allowed", Map::new(), None).await;
        assert!(res.is_fail());
        assert_eq!(shape, Shape::Invoked);
    }
}
