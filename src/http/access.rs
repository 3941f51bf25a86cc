//! The per-request context.
//!
//! An `Access` is created when a request arrives and destroyed once the
//! response is written. A single serve call owns it end to end: accumulated
//! response headers, cookies, sessions, the chosen body and the temp files
//! deleted at end-of-request all live here. The filter/handler pipeline is a
//! cursor over `nexts`; handlers extend the chain by appending and pass
//! control by calling [`Access::next`].

use std::collections::BTreeMap;
use std::net::IpAddr;

use axum::http::HeaderMap;
use serde_json::json;

use crate::basic;
use crate::codec;
use crate::context::Context;
use crate::defs::{self, Map, Value};
use crate::http::body::Body;
use crate::http::router::{HttpFunc, HttpFuture, Router};
use crate::http::{HttpModule, SiteConfig};
use crate::ports::http::HttpThread;
use crate::result::Res;

/// An outgoing cookie. Values are text-codec encrypted when the response is
/// written, not here.
#[derive(Clone, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    /// Max-Age in seconds; negative deletes the cookie.
    pub max_age: Option<i64>,
    pub http_only: bool,
}

pub struct Access {
    pub context: Context,
    pub(crate) module: &'static HttpModule,

    index: usize,
    nexts: Vec<HttpFunc>,
    pub(crate) thread: Option<Box<dyn HttpThread>>,

    req_headers: HeaderMap,
    remote: String,

    /// Whether a fresh token should be handed to the client.
    pub issue: bool,
    pub(crate) charset: String,

    /// Resolved route key; empty when nothing matched.
    pub name: String,
    pub config: Router,
    pub setting: Map,

    pub site: String,
    pub site_config: SiteConfig,

    pub method: String,
    pub host: String,
    /// Root domain of the request host; empty for IP literals.
    pub domain: String,
    pub path: String,
    pub uri: String,
    pub ajax: bool,

    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) cookies: BTreeMap<String, Cookie>,
    pub(crate) sessions: Map,
    pub(crate) session_changed: bool,

    /// Decoded client-signature fields.
    pub client: Map,
    /// Parameters extracted from the uri pattern.
    pub params: Map,
    pub query: Map,
    pub form: Map,
    pub upload: Map,
    /// Free-form data handed to views and API envelopes.
    pub data: Map,
    /// Every parameter source merged.
    pub value: Map,
    /// Validated and coerced route arguments.
    pub args: Map,
    /// Records loaded by the sign gate.
    pub sign: Map,
    /// Records loaded by the find gate.
    pub item: Map,
    /// Request-scoped scratch space for filters.
    pub local: Map,

    pub code: u16,
    /// Response content type key, resolved through the MIME registry.
    pub kind: String,
    pub body: Body,
}

impl Access {
    pub(crate) fn create(module: &'static HttpModule, thread: Box<dyn HttpThread>) -> Access {
        let method = thread.method().to_uppercase();
        let uri = thread.uri();
        let path = thread.path();
        let params = thread.params();
        let req_headers = thread.headers();
        let remote = thread.remote();

        let mut host = thread.host();
        if let Some((bare, _)) = host.split_once(':') {
            host = bare.to_string();
        }

        let mut site = thread.site();
        if site.is_empty() {
            site = module.site_of(&host).unwrap_or_default();
        }
        let site_config = module.site_config(&site);

        // root domain only makes sense for real host names
        let mut domain = String::new();
        if host.parse::<IpAddr>().is_err() {
            let labels: Vec<&str> = host.split('.').collect();
            if labels.len() >= 2 {
                domain = format!(
                    "{}.{}",
                    labels[labels.len() - 2],
                    labels[labels.len() - 1]
                );
            }
        }

        let charset = if site_config.charset.is_empty() {
            "utf-8".to_string()
        } else {
            site_config.charset.clone()
        };

        Access {
            context: Context::new(),
            module,
            index: 0,
            nexts: Vec::new(),
            name: thread.name(),
            thread: Some(thread),
            req_headers,
            remote,
            issue: false,
            charset,
            config: Router::default(),
            setting: Map::new(),
            site,
            site_config,
            method,
            host,
            domain,
            path,
            uri,
            ajax: false,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            sessions: Map::new(),
            session_changed: false,
            client: Map::new(),
            params,
            query: Map::new(),
            form: Map::new(),
            upload: Map::new(),
            data: Map::new(),
            value: Map::new(),
            args: Map::new(),
            sign: Map::new(),
            item: Map::new(),
            local: Map::new(),
            code: 0,
            kind: String::new(),
            body: Body::None,
        }
    }

    // ---- chain machinery ----

    pub(crate) fn clear(&mut self) {
        self.index = 0;
        self.nexts.clear();
    }

    pub(crate) fn push(&mut self, funcs: impl IntoIterator<Item = HttpFunc>) {
        self.nexts.extend(funcs);
    }

    /// Advance the cursor and invoke the next function on the chain. A
    /// function that wants the rest of the chain to run calls this itself.
    pub fn next(&mut self) -> HttpFuture<'_> {
        Box::pin(async move {
            if self.index < self.nexts.len() {
                let func = self.nexts[self.index].clone();
                self.index += 1;
                func(self).await;
            }
        })
    }

    // ---- request reads ----

    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// A request header, empty when absent.
    pub fn req_header(&self, name: &str) -> String {
        self.req_headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    pub fn user_agent(&self) -> String {
        self.req_header("user-agent")
    }

    /// Client address, preferring forwarding headers; the last hop wins on
    /// comma-joined chains.
    pub fn ip(&self) -> String {
        let mut ip = self.req_header("x-forwarded-for");
        if ip.is_empty() {
            ip = self.req_header("x-real-ip");
        }
        if ip.is_empty() {
            ip = self.remote.clone();
        }
        if let Some((bare, _)) = ip.rsplit_once(':') {
            if bare.parse::<IpAddr>().is_ok() {
                ip = bare.to_string();
            }
        }
        ip.rsplit(", ").next().unwrap_or(&ip).trim().to_string()
    }

    /// Read a request cookie, decrypting the stored value.
    pub fn cookie(&self, name: &str) -> String {
        let header = self.req_header("cookie");
        for pair in header.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    if let Ok(plain) = codec::decrypt_text(v) {
                        return plain;
                    }
                    return v.to_string();
                }
            }
        }
        String::new()
    }

    /// The raw (undecrypted) request cookie value; tokens are written
    /// verbatim, so they read back verbatim.
    pub(crate) fn raw_cookie(&self, name: &str) -> String {
        let header = self.req_header("cookie");
        for pair in header.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return v.to_string();
                }
            }
        }
        String::new()
    }

    // ---- response accumulation ----

    /// Set a response header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.cookies.insert(
            name.to_string(),
            Cookie {
                name: name.to_string(),
                value: value.to_string(),
                path: "/".into(),
                http_only: true,
                ..Cookie::default()
            },
        );
    }

    pub fn clear_cookie(&mut self, name: &str) {
        self.cookies.insert(
            name.to_string(),
            Cookie {
                name: name.to_string(),
                max_age: Some(-1),
                http_only: true,
                ..Cookie::default()
            },
        );
    }

    // ---- sessions and signs ----

    pub fn session(&self, key: &str) -> Option<&Value> {
        self.sessions.get(key)
    }

    /// Write (or with `None`, delete) a session entry, marking the session
    /// as mutated so it is persisted at end-of-request.
    pub fn set_session(&mut self, key: &str, value: Option<Value>) {
        self.session_changed = true;
        match value {
            Some(value) => {
                self.sessions.insert(key.to_string(), value);
            }
            None => {
                self.sessions.remove(key);
            }
        }
    }

    fn sign_key(key: &str) -> String {
        format!("$.sign.{key}")
    }

    pub fn signed(&self, key: &str) -> bool {
        self.session(&Self::sign_key(key)).is_some()
    }

    pub fn signin(&mut self, key: &str, id: &Value, name: &Value) {
        self.set_session(
            &Self::sign_key(key),
            Some(json!({
                "id": defs::text_of(id),
                "name": defs::text_of(name),
            })),
        );
    }

    pub fn signout(&mut self, key: &str) {
        self.set_session(&Self::sign_key(key), None);
    }

    /// The signed-in id for a sign key.
    pub fn signal(&self, key: &str) -> String {
        self.session(&Self::sign_key(key))
            .and_then(Value::as_object)
            .and_then(|m| defs::get_str(m, "id"))
            .unwrap_or_default()
    }

    /// The signed-in display name for a sign key.
    pub fn signer(&self, key: &str) -> String {
        self.session(&Self::sign_key(key))
            .and_then(Value::as_object)
            .and_then(|m| defs::get_str(m, "name"))
            .unwrap_or_default()
    }

    /// Whether this request keeps a server-side session: forced by sign
    /// configuration or an observed mutation, otherwise the route setting,
    /// otherwise the given default.
    pub(crate) fn sessional(&self, def: bool) -> bool {
        let mut sessional = defs::get_bool(&self.setting, "session").unwrap_or(def);
        if !self.config.sign.is_empty() {
            sessional = true;
        }
        if self.session_changed {
            sessional = true;
        }
        sessional
    }

    // ---- token ----

    /// Hand a signed token to the client with the response.
    pub fn issue_token(&mut self, token: String) {
        self.issue = true;
        if let Ok(verify) = crate::token::verify(&token) {
            self.context.verify = Some(verify);
        }
        self.context.token = token;
    }

    /// Mint a token for an identity without issuing it.
    pub fn auth(&mut self, authorized: bool, payload: Map, expiry: Option<std::time::Duration>) -> String {
        crate::token::issue(authorized, payload, expiry)
    }

    /// Mint and issue in one step.
    pub fn auth_issue(&mut self, authorized: bool, payload: Map, expiry: Option<std::time::Duration>) -> String {
        let token = self.auth(authorized, payload, expiry);
        self.issue_token(token.clone());
        token
    }

    // ---- results and localization ----

    pub fn lang(&self) -> &str {
        &self.context.lang
    }

    pub fn string(&self, key: &str, args: &[Value]) -> String {
        self.context.string(key, args)
    }

    pub fn result(&mut self, res: Res) {
        self.context.set_result(res);
    }

    // ---- error funnels ----

    pub async fn found(&mut self) {
        let module = self.module;
        module.found(self).await;
    }

    pub async fn erred(&mut self, res: Res) {
        self.context.set_result(res);
        let module = self.module;
        module.error(self).await;
    }

    pub async fn failed(&mut self, res: Res) {
        self.context.set_result(res);
        let module = self.module;
        module.failed(self).await;
    }

    pub async fn denied(&mut self, res: Res) {
        self.context.set_result(res);
        let module = self.module;
        module.denied(self).await;
    }

    // ---- response bodies ----

    fn finish_code(&mut self, code: Option<u16>) {
        if let Some(code) = code {
            self.code = code;
        }
        if self.code == 0 {
            self.code = 200;
        }
    }

    pub fn goto(&mut self, url: &str) {
        self.body = Body::Goto(url.to_string());
    }

    pub fn goback(&mut self) {
        let url = self.back_url();
        self.goto(&url);
    }

    pub fn redirect(&mut self, url: &str) {
        self.goto(url);
    }

    pub fn text(&mut self, text: &str, code: Option<u16>) {
        self.finish_code(code);
        self.kind = "text".into();
        self.body = Body::Text(text.to_string());
    }

    /// Render a result as plain text in the request language.
    pub fn text_result(&mut self, res: &Res, code: Option<u16>) {
        let text = self.string(res.state(), res.args());
        self.text(&text, code);
    }

    pub fn html(&mut self, html: &str, code: Option<u16>) {
        self.finish_code(code);
        self.kind = "html".into();
        self.body = Body::Html(html.to_string());
    }

    pub fn script(&mut self, script: &str, code: Option<u16>) {
        self.finish_code(code);
        self.kind = "script".into();
        self.body = Body::Script(script.to_string());
    }

    pub fn json(&mut self, value: Value, code: Option<u16>) {
        self.finish_code(code);
        self.kind = "json".into();
        self.body = Body::Json(value);
    }

    pub fn jsonp(&mut self, callback: &str, value: Value, code: Option<u16>) {
        self.finish_code(code);
        self.kind = "jsonp".into();
        self.body = Body::Jsonp(callback.to_string(), value);
    }

    pub fn xml(&mut self, value: Value, code: Option<u16>) {
        self.finish_code(code);
        self.kind = "xml".into();
        self.body = Body::Xml(value);
    }

    pub fn file(&mut self, path: &str, kind: &str, name: &str) {
        self.finish_code(None);
        self.kind = if kind.is_empty() { "file".into() } else { kind.to_string() };
        self.body = Body::File { path: path.into(), name: name.to_string() };
    }

    pub fn binary(&mut self, bytes: Vec<u8>, kind: &str, name: &str) {
        self.finish_code(None);
        self.kind = if kind.is_empty() { "file".into() } else { kind.to_string() };
        self.body = Body::Down { bytes, name: name.to_string() };
    }

    pub fn buffer(
        &mut self,
        reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        kind: &str,
        name: &str,
    ) {
        self.finish_code(None);
        self.kind = if kind.is_empty() { "file".into() } else { kind.to_string() };
        self.body = Body::Buffer { reader, name: name.to_string() };
    }

    pub fn view(&mut self, view: &str) {
        self.finish_code(None);
        if self.kind.is_empty() {
            self.kind = "html".into();
        }
        self.body = Body::View { view: view.to_string(), model: Value::Null };
    }

    pub fn proxy(&mut self, url: &str) {
        self.body = Body::Proxy(url.to_string());
    }

    /// Browser alert fallback: script that alerts the localized message and
    /// navigates back (or to the given url).
    pub fn alert(&mut self, res: &Res, url: Option<&str>) {
        let text = self.string(res.state(), res.args());
        if self.code == 0 {
            self.code = if res.is_ok() { 200 } else { 500 };
        }
        let code = self.code;
        let script = match url {
            Some(url) => format!(
                r#"<script type="text/javascript">alert("{text}"); location.href="{url}";</script>"#
            ),
            None => format!(
                r#"<script type="text/javascript">alert("{text}"); history.back();</script>"#
            ),
        };
        self.script(&script, Some(code));
    }

    /// Render the shared `show` view with the result code/text.
    pub fn show(&mut self, res: &Res, url: Option<&str>) {
        let code = res.resolved_code();
        let text = self.string(res.state(), res.args());
        if self.code == 0 {
            self.code = if res.is_ok() { 200 } else { 500 };
        }

        self.data.insert(
            "show".into(),
            json!({ "code": code, "text": text, "url": url.unwrap_or_default() }),
        );
        self.view("show");
    }

    /// The API envelope: result code and localized text plus response data
    /// (accumulated `data` merged with the given map).
    pub fn answer(&mut self, res: &Res, extra: Option<Map>) {
        let code = res.resolved_code();
        let text = self.string(res.state(), res.args());

        // funnel-assigned statuses (400/401/404) survive; only a fresh
        // response picks its status from the result
        if self.code == 0 {
            self.code = if res.is_ok() { 200 } else { 500 };
        }

        let mut data = self.data.clone();
        if let Some(extra) = extra {
            defs::merge(&mut data, &extra);
        }
        defs::merge(&mut self.data, &data);

        let data = if data.is_empty() { None } else { Some(data) };
        self.kind = "json".into();
        self.body = Body::Api { code, text, data };
    }

    // ---- urls ----

    /// Build a url for a named route on this site, substituting `{param}`
    /// segments from `args`.
    pub fn route_url(&self, name: &str, args: &Map) -> String {
        self.module.route_url(&self.site, name, args)
    }

    /// Where "back" points: an explicit `backurl` parameter, the referer,
    /// or the root.
    pub fn back_url(&self) -> String {
        if let Some(url) = defs::get_str(&self.value, "backurl") {
            return url;
        }
        let referer = self.req_header("referer");
        if !referer.is_empty() {
            return referer;
        }
        "/".into()
    }

    /// Negotiate the request language against the configured accept lists.
    pub(crate) fn negotiate_lang(&mut self) {
        let header = self.req_header("accept-language");
        if header.is_empty() {
            return;
        }
        let configs = basic::BASIC.lang_configs();
        for accept in header.split(',') {
            let accept = accept.split(';').next().unwrap_or_default().trim();
            for (lang, config) in &configs {
                if config
                    .accepts
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(accept))
                {
                    self.context.lang = lang.clone();
                    return;
                }
            }
        }
    }

    /// End-of-request cleanup.
    pub(crate) fn terminal(&mut self) {
        self.context.terminal();
    }
}
