//! Route, filter and handler registration records.
//!
//! Registration keys are site-qualified: a bare name fans out to every
//! known site as `<site>.<name>`, and a router carrying a `routing` sub-map
//! expands into one concrete `<site>.<name>.<method>` entry per method with
//! the overlay fields materialized. A bare registration lands on
//! `<site>.<name>.*` (method-agnostic).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::basic::Vars;
use crate::defs::{self, Map};
use crate::http::Access;
use crate::result::Res;

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
pub type HttpFunc = Arc<dyn for<'a> Fn(&'a mut Access) -> HttpFuture<'a> + Send + Sync>;

/// Wrap a request function into the chain-callable form.
pub fn http_func(
    f: impl for<'a> Fn(&'a mut Access) -> HttpFuture<'a> + Send + Sync + 'static,
) -> HttpFunc {
    Arc::new(f)
}

/// Session-sign gate on a route: requires a signed-in key and optionally
/// loads its record through an engine method.
#[derive(Clone, Default)]
pub struct SignRule {
    /// Session sign key; defaults to the map key.
    pub sign: String,
    pub required: bool,
    /// Engine method invoked with the signed id.
    pub method: String,
    /// Argument name the id is passed under; defaults to `id`.
    pub args: String,
    pub name: String,
    pub desc: String,
    pub empty: Option<Res>,
    pub error: Option<Res>,
}

/// Entity lookup on a route: resolves a value from args and loads the
/// record through an engine method.
#[derive(Clone, Default)]
pub struct FindRule {
    /// Field holding the lookup value; defaults to `id`.
    pub value: String,
    pub required: bool,
    pub method: String,
    pub args: String,
    pub name: String,
    pub desc: String,
    pub alias: Vec<String>,
    pub empty: Option<Res>,
    pub error: Option<Res>,
}

pub type Routing = BTreeMap<String, Router>;

#[derive(Clone, Default)]
pub struct Router {
    pub(crate) site: String,
    pub uri: String,
    pub uris: Vec<String>,
    pub name: String,
    pub desc: String,
    /// Concrete method once expanded; empty means method-agnostic.
    pub method: String,
    pub nullable: bool,
    pub socket: bool,
    pub setting: Map,
    pub args: Vars,
    pub data: Vars,
    pub sign: BTreeMap<String, SignRule>,
    pub find: BTreeMap<String, FindRule>,
    /// Per-method overlays expanded at registration time.
    pub routing: Routing,
    pub action: Option<HttpFunc>,
    pub actions: Vec<HttpFunc>,
    pub found: Option<HttpFunc>,
    pub error: Option<HttpFunc>,
    pub failed: Option<HttpFunc>,
    pub denied: Option<HttpFunc>,
    pub token: bool,
    pub auth: bool,
}

impl Router {
    pub(crate) fn site(&self) -> &str {
        &self.site
    }
}

#[derive(Clone)]
pub struct Filter {
    pub name: String,
    pub desc: String,
    pub request: Option<HttpFunc>,
    pub execute: Option<HttpFunc>,
    pub response: Option<HttpFunc>,
}

#[derive(Clone)]
pub struct RequestFilter {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

#[derive(Clone)]
pub struct ExecuteFilter {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

#[derive(Clone)]
pub struct ResponseFilter {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

#[derive(Clone)]
pub struct Handler {
    pub name: String,
    pub desc: String,
    pub found: Option<HttpFunc>,
    pub error: Option<HttpFunc>,
    pub failed: Option<HttpFunc>,
    pub denied: Option<HttpFunc>,
}

#[derive(Clone)]
pub struct FoundHandler {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

#[derive(Clone)]
pub struct ErrorHandler {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

#[derive(Clone)]
pub struct FailedHandler {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

#[derive(Clone)]
pub struct DeniedHandler {
    pub(crate) site: String,
    pub name: String,
    pub desc: String,
    pub action: HttpFunc,
}

/// Expand a registration key over the known sites: a bare name becomes
/// `*.name`, and the wildcard fans out to one `(key, site)` pair per site.
pub(crate) fn expand_site_key(name: &str, sites: &[String]) -> Vec<(String, String)> {
    let name = if name.contains('.') {
        name.to_string()
    } else {
        format!("*.{name}")
    };

    if let Some(rest) = name.strip_prefix("*.") {
        sites
            .iter()
            .map(|site| (format!("{site}.{rest}"), site.clone()))
            .collect()
    } else {
        let site = name.split('.').next().unwrap_or_default().to_string();
        vec![(name, site)]
    }
}

/// Expand a router registration into concrete entries: site fan-out first,
/// then one entry per `routing` method (or a single `.*` entry), with
/// `uri`/`action` folded into their list forms.
pub(crate) fn expand_routers(
    name: &str,
    config: Router,
    sites: &[String],
) -> Vec<(String, Router)> {
    let mut out = Vec::new();

    for (key, site) in expand_site_key(name, sites) {
        let mut base = config.clone();
        base.site = site;

        if base.routing.is_empty() {
            out.push((format!("{key}.*").to_lowercase(), normalize(base)));
            continue;
        }

        let routing = std::mem::take(&mut base.routing);
        for (method, overlay) in routing {
            let mut entry = base.clone();
            entry.method = method.clone();
            entry.socket = overlay.socket;
            entry.nullable = overlay.nullable;

            if !overlay.name.is_empty() {
                entry.name = overlay.name.clone();
            }
            if !overlay.desc.is_empty() {
                entry.desc = overlay.desc.clone();
            }

            defs::merge(&mut entry.setting, &overlay.setting);
            for (k, v) in overlay.args {
                entry.args.insert(k, v);
            }
            for (k, v) in overlay.data {
                entry.data.insert(k, v);
            }
            for (k, v) in overlay.sign {
                entry.sign.insert(k, v);
            }
            for (k, v) in overlay.find {
                entry.find.insert(k, v);
            }

            if overlay.action.is_some() {
                entry.action = overlay.action;
                entry.actions = Vec::new();
            }
            if !overlay.actions.is_empty() {
                entry.actions = overlay.actions;
            }
            if overlay.found.is_some() {
                entry.found = overlay.found;
            }
            if overlay.error.is_some() {
                entry.error = overlay.error;
            }
            if overlay.failed.is_some() {
                entry.failed = overlay.failed;
            }
            if overlay.denied.is_some() {
                entry.denied = overlay.denied;
            }

            out.push((format!("{key}.{method}").to_lowercase(), normalize(entry)));
        }
    }

    out
}

fn normalize(mut router: Router) -> Router {
    if !router.uri.is_empty() {
        let uri = std::mem::take(&mut router.uri);
        router.uris.push(uri);
    }
    if let Some(action) = router.action.take() {
        router.actions.push(action);
    }
    router.routing.clear();
    router
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites() -> Vec<String> {
        vec!["".to_string(), "www".to_string(), "api".to_string()]
    }

    fn noop() -> HttpFunc {
        http_func(|_ctx| Box::pin(async {}))
    }

    #[test]
    fn bare_names_fan_out_to_every_site() {
        let keys = expand_site_key("hello", &sites());
        let names: Vec<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec![".hello", "www.hello", "api.hello"]);
    }

    #[test]
    fn qualified_names_stay_single_site() {
        let keys = expand_site_key("api.hello", &sites());
        assert_eq!(keys, vec![("api.hello".to_string(), "api".to_string())]);
    }

    #[test]
    fn bare_router_registers_method_agnostic() {
        let router = Router { uri: "/hello".into(), action: Some(noop()), ..Router::default() };
        let expanded = expand_routers("www.hello", router, &sites());

        assert_eq!(expanded.len(), 1);
        let (key, entry) = &expanded[0];
        assert_eq!(key, "www.hello.*");
        assert_eq!(entry.site(), "www");
        assert_eq!(entry.uris, vec!["/hello".to_string()]);
        assert!(entry.action.is_none());
        assert_eq!(entry.actions.len(), 1);
    }

    #[test]
    fn routing_expands_one_entry_per_method_per_site() {
        let mut base_args = Vars::new();
        base_args.insert("id".into(), crate::basic::Var::required("int"));

        let mut routing = Routing::new();
        routing.insert(
            "get".into(),
            Router { desc: "read".into(), action: Some(noop()), ..Router::default() },
        );
        let mut post_args = Vars::new();
        post_args.insert("body".into(), crate::basic::Var::required("string"));
        routing.insert(
            "post".into(),
            Router { args: post_args, action: Some(noop()), ..Router::default() },
        );

        let router = Router {
            uri: "/thing".into(),
            args: base_args,
            routing,
            ..Router::default()
        };

        let expanded = expand_routers("thing", router, &sites());
        let keys: Vec<&str> = expanded.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                ".thing.get",
                ".thing.post",
                "www.thing.get",
                "www.thing.post",
                "api.thing.get",
                "api.thing.post",
            ]
        );

        let (_, get) = expanded.iter().find(|(k, _)| k == "www.thing.get").unwrap();
        assert_eq!(get.method, "get");
        assert_eq!(get.desc, "read");
        assert!(get.args.contains_key("id"));
        assert!(!get.args.contains_key("body"));

        let (_, post) = expanded.iter().find(|(k, _)| k == "www.thing.post").unwrap();
        // overlay args merge on top of the base schema
        assert!(post.args.contains_key("id"));
        assert!(post.args.contains_key("body"));
        assert_eq!(post.uris, vec!["/thing".to_string()]);
    }

    #[test]
    fn overlay_actions_replace_base_actions() {
        let mut routing = Routing::new();
        routing.insert("get".into(), Router { action: Some(noop()), ..Router::default() });
        routing.insert("post".into(), Router::default());

        let router = Router { action: Some(noop()), routing, ..Router::default() };
        let expanded = expand_routers("api.item", router, &sites());

        let (_, get) = expanded.iter().find(|(k, _)| k == "api.item.get").unwrap();
        assert_eq!(get.actions.len(), 1);
        let (_, post) = expanded.iter().find(|(k, _)| k == "api.item.post").unwrap();
        // post falls back to the base action
        assert_eq!(post.actions.len(), 1);
    }
}
