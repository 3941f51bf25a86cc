//! Response body variants and their rendering.
//!
//! The route pipeline accumulates exactly one [`Body`]; the final stage of
//! the response chain renders it to the wire, applies cookies and headers,
//! and releases the thread.

use std::path::PathBuf;

use axum::body::Body as WireBody;
use axum::http::header;
use chrono::Utc;
use hyper::Response;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::basic::{self, Var, Vars};
use crate::codec;
use crate::map;
use crate::defs::{self, Map, Value};
use crate::http::access::Access;
use crate::http::HttpModule;
use crate::view::{ViewBody, VIEW};

/// The closed set of response renderings.
pub enum Body {
    /// Nothing chosen: renders 404.
    None,
    /// Raw request body captured during form parsing; replaced by any
    /// explicit response.
    Raw(bytes::Bytes),
    /// 302 redirect.
    Goto(String),
    Text(String),
    Html(String),
    Script(String),
    Json(Value),
    Jsonp(String, Value),
    /// API envelope `{code, time, token?, text?, data?}`.
    Api { code: i64, text: String, data: Option<Map> },
    Xml(Value),
    /// Serve a file from disk.
    File { path: PathBuf, name: String },
    /// Inline bytes download.
    Down { bytes: Vec<u8>, name: String },
    /// Stream a reader to the response.
    Buffer { reader: Box<dyn AsyncRead + Send + Unpin>, name: String },
    /// Delegate to the view module.
    View { view: String, model: Value },
    /// Reverse-proxy to a remote origin.
    Proxy(String),
}

impl Default for Body {
    fn default() -> Self {
        Body::None
    }
}

impl HttpModule {
    /// Final response stage: write cookies and headers, render the body
    /// variant, finish the thread and clean the request up.
    pub(crate) async fn render(&'static self, ctx: &mut Access) {
        if ctx.code == 0 {
            ctx.code = 200;
        }

        let response = self.build(ctx).await;
        if let Some(mut thread) = ctx.thread.take() {
            if let Err(err) = thread.finish(response).await {
                tracing::warn!(error = %err, "failed to write response");
            }
        }

        ctx.terminal();
    }

    async fn build(&'static self, ctx: &mut Access) -> Response<WireBody> {
        let body = std::mem::take(&mut ctx.body);

        let mut response = match body {
            Body::None | Body::Raw(_) => {
                ctx.code = 404;
                self.plain(ctx, "text", "not found")
            }
            Body::Goto(url) => {
                ctx.code = 302;
                let mut response = Response::new(WireBody::empty());
                response
                    .headers_mut()
                    .insert(header::LOCATION, url.parse().unwrap_or_else(|_| "/".parse().unwrap()));
                response
            }
            Body::Text(text) => self.plain(ctx, "text", &text),
            Body::Html(html) => self.plain(ctx, "html", &html),
            Body::Script(script) => self.plain(ctx, "script", &script),
            Body::Json(value) => match serde_json::to_string(&value) {
                Ok(text) => self.plain_kind(ctx, "json", &text),
                Err(err) => {
                    ctx.code = 500;
                    self.plain(ctx, "text", &err.to_string())
                }
            },
            Body::Jsonp(callback, value) => match serde_json::to_string(&value) {
                Ok(text) => self.plain_kind(ctx, "script", &format!("{callback}({text});")),
                Err(err) => {
                    ctx.code = 500;
                    self.plain(ctx, "text", &err.to_string())
                }
            },
            Body::Api { code, text, data } => {
                let value = self.envelope(ctx, code, text, data);
                match serde_json::to_string(&value) {
                    Ok(text) => self.plain_kind(ctx, "json", &text),
                    Err(err) => {
                        ctx.code = 500;
                        self.plain(ctx, "text", &err.to_string())
                    }
                }
            }
            Body::Xml(value) => {
                let content = match value {
                    Value::String(raw) => raw,
                    other => codec::encrypt("xml", &other).unwrap_or_default(),
                };
                if content.is_empty() {
                    ctx.code = 500;
                    self.plain(ctx, "text", "xml marshal failed")
                } else {
                    self.plain_kind(ctx, "xml", &content)
                }
            }
            Body::File { path, name } => self.file_body(ctx, &path, &name).await,
            Body::Down { bytes, name } => {
                let mut response = Response::new(WireBody::from(bytes));
                self.set_attachment(ctx, &mut response, &name);
                response
            }
            Body::Buffer { reader, name } => {
                let stream = ReaderStream::new(reader);
                let mut response = Response::new(WireBody::from_stream(stream));
                self.set_attachment(ctx, &mut response, &name);
                response
            }
            Body::View { view, model } => self.view_body(ctx, &view, model).await,
            Body::Proxy(url) => return self.proxy_body(ctx, &url).await,
        };

        *response.status_mut() =
            hyper::StatusCode::from_u16(ctx.code).unwrap_or(hyper::StatusCode::OK);

        self.apply_cookies(ctx, &mut response);
        for (name, value) in &ctx.headers {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::try_from(name.as_str()),
                header::HeaderValue::try_from(value.as_str()),
            ) {
                response.headers_mut().insert(name, value);
            }
        }

        response
    }

    fn content_type(&self, ctx: &Access, fallback: &str) -> String {
        let kind = if ctx.kind.is_empty() { fallback } else { &ctx.kind };
        let mime = basic::mimetype(kind, "");
        format!("{}; charset={}", mime, ctx.charset())
    }

    fn plain(&self, ctx: &mut Access, fallback: &str, text: &str) -> Response<WireBody> {
        let content_type = self.content_type(ctx, fallback);
        let mut response = Response::new(WireBody::from(text.to_string()));
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        response
    }

    fn plain_kind(&self, ctx: &mut Access, kind: &str, text: &str) -> Response<WireBody> {
        ctx.kind = kind.to_string();
        self.plain(ctx, kind, text)
    }

    fn set_attachment(&self, ctx: &mut Access, response: &mut Response<WireBody>, name: &str) {
        let content_type = self.content_type(ctx, "file");
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        if !name.is_empty() {
            let escaped = utf8_percent_encode(name, NON_ALPHANUMERIC).to_string();
            if let Ok(value) = format!("attachment;filename={escaped};").parse() {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, value);
            }
        }
    }

    /// The API envelope; a zero code re-runs the response schema with the
    /// site's obfuscation codec applied.
    fn envelope(&self, ctx: &mut Access, code: i64, text: String, data: Option<Map>) -> Value {
        let mut envelope = map! { "code" => code, "time" => Utc::now().timestamp() };

        if ctx.issue {
            envelope.insert("token".into(), Value::String(ctx.context.token.clone()));
        }
        if !text.is_empty() {
            envelope.insert("text".into(), Value::String(text));
        }

        let Some(data) = data else {
            return Value::Object(envelope);
        };

        if code != 0 {
            envelope.insert("data".into(), Value::Object(data));
            return Value::Object(envelope);
        }

        // response-side obfuscation: the site confuse codec unless the route
        // setting or a debug caller turns it off
        let mut confuse = ctx.site_config.confuse.clone();
        if defs::get_bool(&ctx.setting, "confuse") == Some(false)
            || defs::get_bool(&ctx.setting, "encode") == Some(false)
            || defs::get_bool(&ctx.setting, "plain") == Some(true)
            || !ctx.req_header("debug").is_empty()
        {
            confuse = String::new();
        }

        let mut wrapper = Var::required("json");
        wrapper.encode = confuse;
        if !ctx.config.data.is_empty() {
            wrapper.children = Some(ctx.config.data.clone());
        }
        let mut schema = Vars::new();
        schema.insert("data".into(), wrapper);

        let wrapped = map! { "data" => data };
        let mut out = Map::new();
        match basic::mapping(&schema, &wrapped, &mut out, false, false, &ctx.context.map_ctx()) {
            Ok(()) => {
                envelope.insert("data".into(), out.remove("data").unwrap_or(Value::Null));
            }
            Err(res) => {
                envelope.insert("code".into(), Value::from(basic::state_code(res.state(), -1)));
                envelope.insert(
                    "text".into(),
                    Value::String(ctx.string(res.state(), res.args())),
                );
            }
        }

        Value::Object(envelope)
    }

    async fn file_body(&self, ctx: &mut Access, path: &PathBuf, name: &str) -> Response<WireBody> {
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                if ctx.kind == "file" || ctx.kind.is_empty() {
                    let ext = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or_default();
                    ctx.kind = ext.to_string();
                }
                let stream = ReaderStream::new(file);
                let mut response = Response::new(WireBody::from_stream(stream));

                let content_type = self.content_type(ctx, "file");
                if let Ok(value) = content_type.parse() {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                if !name.is_empty() {
                    self.set_attachment(ctx, &mut response, name);
                }
                response
            }
            Err(_) => {
                ctx.code = 404;
                self.plain(ctx, "text", "not found")
            }
        }
    }

    async fn view_body(&'static self, ctx: &mut Access, view: &str, model: Value) -> Response<WireBody> {
        let mut site = Map::new();
        site.insert("name".into(), Value::String(ctx.site_config.name.clone()));
        site.insert("domain".into(), Value::String(ctx.site_config.domain.clone()));
        site.insert("setting".into(), Value::Object(ctx.site_config.setting.clone()));

        let viewdata = map! {
            "args" => ctx.args.clone(),
            "sign" => ctx.sign.clone(),
            "config" => site,
            "setting" => crate::kernel::setting(),
            "local" => ctx.local.clone(),
            "data" => ctx.data.clone(),
            "model" => model,
        };

        let body = ViewBody {
            view: view.to_string(),
            site: ctx.site.clone(),
            lang: ctx.lang().to_string(),
            zone_secs: ctx.context.zone_secs,
            data: viewdata,
            helpers: self.view_helpers(ctx),
        };

        match VIEW.parse(body).await {
            Ok(html) => self.plain_kind(ctx, "html", &html),
            Err(err) => {
                ctx.code = 500;
                let text = ctx.string(&err.to_string(), &[]);
                self.plain(ctx, "text", &text)
            }
        }
    }

    async fn proxy_body(&self, ctx: &mut Access, url: &str) -> Response<WireBody> {
        let client = reqwest::Client::new();
        let method = reqwest::Method::from_bytes(ctx.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = client.request(method, url);
        for (name, value) in ctx.thread.as_ref().map(|t| t.headers()).unwrap_or_default() {
            if let Some(name) = name {
                if name != header::HOST {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(thread) = ctx.thread.as_mut() {
            if let Ok(bytes) = thread.body().await {
                if !bytes.is_empty() {
                    request = request.body(bytes);
                }
            }
        }

        match request.send().await {
            Ok(upstream) => {
                let status = upstream.status();
                let headers = upstream.headers().clone();
                let stream = upstream.bytes_stream();

                let mut response = Response::new(WireBody::from_stream(stream));
                *response.status_mut() = hyper::StatusCode::from_u16(status.as_u16())
                    .unwrap_or(hyper::StatusCode::BAD_GATEWAY);
                for (name, value) in &headers {
                    if name == header::CONNECTION || name == header::TRANSFER_ENCODING {
                        continue;
                    }
                    response.headers_mut().insert(name, value.clone());
                }
                response
            }
            Err(err) => {
                tracing::warn!(error = %err, url, "proxy request failed");
                ctx.code = 502;
                self.plain(ctx, "text", "bad gateway")
            }
        }
    }

    fn apply_cookies(&self, ctx: &mut Access, response: &mut Response<WireBody>) {
        let max_age = ctx.site_config.max_age;
        let domain = ctx.domain.clone();

        let mut lines = Vec::new();
        for cookie in ctx.cookies.values() {
            let mut cookie = cookie.clone();
            cookie.http_only = true;
            if cookie.domain.is_empty() {
                cookie.domain = domain.clone();
            }
            if cookie.max_age.is_none() {
                if let Some(max_age) = max_age {
                    cookie.max_age = Some(max_age.as_secs() as i64);
                }
            }
            // values ride encrypted; deletions carry no value at all
            if !cookie.value.is_empty() {
                if let Ok(coded) = codec::encrypt_text(&cookie.value) {
                    cookie.value = coded;
                }
            }
            lines.push(serialize_cookie(&cookie));
        }

        // issued tokens are written verbatim under the site cookie name
        if ctx.issue && !ctx.site_config.cookie.is_empty() {
            let cookie = crate::http::access::Cookie {
                name: ctx.site_config.cookie.clone(),
                value: ctx.context.token.clone(),
                path: "/".into(),
                domain: domain.clone(),
                http_only: true,
                ..Default::default()
            };
            lines.push(serialize_cookie(&cookie));
        }

        for line in lines {
            if let Ok(value) = line.parse::<header::HeaderValue>() {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
    }
}

fn serialize_cookie(cookie: &crate::http::access::Cookie) -> String {
    let mut line = format!("{}={}", cookie.name, cookie.value);
    let path = if cookie.path.is_empty() { "/" } else { &cookie.path };
    line.push_str(&format!("; Path={path}"));
    if !cookie.domain.is_empty() {
        line.push_str(&format!("; Domain={}", cookie.domain));
    }
    if let Some(max_age) = cookie.max_age {
        line.push_str(&format!("; Max-Age={max_age}"));
    }
    if cookie.http_only {
        line.push_str("; HttpOnly");
    }
    line
}
