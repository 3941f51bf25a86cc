//! Default HTTP driver on axum/hyper.
//!
//! The driver owns the listener and the route table: it resolves each
//! inbound request to a registered route (host, method and uri pattern),
//! extracts path parameters, and hands the request to the module as an
//! `HttpThread`. The module writes its response back through a oneshot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use axum::routing::any;
use bytes::Bytes;
use eyre::{eyre, Result, WrapErr};
use http_body_util::BodyExt;
use hyper::Response;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio_rustls::TlsAcceptor;

use crate::defs::{Map, Value};
use crate::http::HttpConfig;
use crate::ports::http::{HttpConnect, HttpDriver, HttpHandler, HttpHealth, HttpRegister, HttpThread};

#[derive(Default)]
pub struct HyperDriver;

impl HyperDriver {
    pub fn new() -> HyperDriver {
        HyperDriver
    }
}

#[async_trait]
impl HttpDriver for HyperDriver {
    async fn connect(&self, config: HttpConfig) -> Result<Arc<dyn HttpConnect>> {
        Ok(Arc::new(HyperConnect {
            config,
            routes: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            listener: TokioMutex::new(None),
            serving: TokioMutex::new(None),
            workload: Arc::new(AtomicI64::new(0)),
        }))
    }
}

#[derive(Clone)]
enum Segment {
    Literal(String),
    Param(String),
    Tail,
}

#[derive(Clone)]
struct RouteEntry {
    name: String,
    site: String,
    methods: Vec<String>,
    hosts: Vec<String>,
    patterns: Vec<Vec<Segment>>,
}

pub struct HyperConnect {
    config: HttpConfig,
    routes: RwLock<Vec<RouteEntry>>,
    handler: RwLock<Option<HttpHandler>>,
    listener: TokioMutex<Option<TcpListener>>,
    serving: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    workload: Arc<AtomicI64>,
}

impl HyperConnect {
    fn resolve(&self, host: &str, method: &str, path: &str) -> (String, String, Map) {
        let routes = self.routes.read().unwrap();

        let mut best: Option<(usize, usize, &RouteEntry, Map)> = None;
        for entry in routes.iter() {
            if !entry.methods.is_empty()
                && !entry.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            {
                continue;
            }

            let host_rank = if entry.hosts.iter().any(|h| h == host) {
                1
            } else if entry.hosts.is_empty() {
                0
            } else {
                continue;
            };

            for pattern in &entry.patterns {
                if let Some((literals, params)) = match_pattern(pattern, path) {
                    let better = match &best {
                        Some((rank, lits, _, _)) => {
                            host_rank > *rank || (host_rank == *rank && literals > *lits)
                        }
                        None => true,
                    };
                    if better {
                        best = Some((host_rank, literals, entry, params));
                    }
                }
            }
        }

        match best {
            Some((_, _, entry, params)) => (entry.name.clone(), entry.site.clone(), params),
            None => (String::new(), String::new(), Map::new()),
        }
    }

    async fn handle(self: Arc<Self>, addr: Option<SocketAddr>, req: Request) -> Response<Body> {
        let handler = self.handler.read().unwrap().clone();
        let Some(handler) = handler else {
            return plain_response(503, "no handler attached");
        };

        self.workload.fetch_add(1, Ordering::Relaxed);

        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or_default().to_string();
        let headers = req.headers().clone();

        let host = headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bare_host = host.split(':').next().unwrap_or_default().to_string();

        let (name, site, params) = self.resolve(&bare_host, &method, &path);

        let (tx, mut rx) = oneshot::channel();
        let thread = RequestThread {
            name,
            site,
            params,
            method,
            uri,
            path,
            query,
            host,
            remote: addr.map(|a| a.to_string()).unwrap_or_default(),
            headers,
            body: Some(req.into_body()),
            responder: Some(tx),
        };

        handler(Box::new(thread)).await;
        self.workload.fetch_sub(1, Ordering::Relaxed);

        match rx.try_recv() {
            Ok(response) => response,
            Err(_) => plain_response(500, "request finished without a response"),
        }
    }

}

fn build_app(connect: Arc<HyperConnect>) -> axum::Router {
    let route = |connect: Arc<HyperConnect>| {
        any(
            move |ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request| {
                let connect = connect.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(connect.handle(Some(addr), req).await)
                }
            },
        )
    };

    axum::Router::new()
        .route("/", route(connect.clone()))
        .route("/{*path}", route(connect))
}

/// Wraps the peer address for the TLS listener. `axum::extract::connect_info::Connected`
/// can't be implemented directly for `SocketAddr` here (orphan rules: both the
/// trait and `SocketAddr` are foreign), so this local newtype carries the
/// address instead; its value is identical to the plain-TCP path.
#[derive(Clone, Copy, Debug)]
struct TlsAddr(SocketAddr);

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, TlsListener>> for TlsAddr {
    fn connect_info(stream: axum::serve::IncomingStream<'_, TlsListener>) -> Self {
        *stream.remote_addr()
    }
}

fn build_app_tls(connect: Arc<HyperConnect>) -> axum::Router {
    let route = |connect: Arc<HyperConnect>| {
        any(
            move |ConnectInfo(addr): ConnectInfo<TlsAddr>, req: Request| {
                let connect = connect.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(connect.handle(Some(addr.0), req).await)
                }
            },
        )
    };

    axum::Router::new()
        .route("/", route(connect.clone()))
        .route("/{*path}", route(connect))
}

#[async_trait]
impl HttpConnect for HyperConnect {
    async fn open(&self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .wrap_err_with(|| format!("failed to bind {addr}"))?;
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn health(&self) -> Result<HttpHealth> {
        Ok(HttpHealth { workload: self.workload.load(Ordering::Relaxed) })
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.serving.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    fn accept(&self, handler: HttpHandler) -> Result<()> {
        *self.handler.write().unwrap() = Some(handler);
        Ok(())
    }

    fn register(&self, name: &str, config: HttpRegister) -> Result<()> {
        let patterns = config.uris.iter().map(|uri| compile_pattern(uri)).collect();
        self.routes.write().unwrap().push(RouteEntry {
            name: name.to_string(),
            site: config.site,
            methods: config.methods,
            hosts: config.hosts,
            patterns,
        });
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| eyre!("listener is not open"))?;

        let app = build_app(connect_arc(self)?);

        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(error = %err, "http server stopped");
            }
        });
        *self.serving.lock().await = Some(task);
        Ok(())
    }

    async fn start_tls(&self, cert_file: &str, key_file: &str) -> Result<()> {
        // ensure one crypto provider wins when the dependency graph enables
        // more than one
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| eyre!("listener is not open"))?;
        let local_addr = listener.local_addr()?;

        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
            std::fs::File::open(cert_file).wrap_err("failed to open cert file")?,
        ))
        .collect::<std::result::Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::pkcs8_private_keys(&mut std::io::BufReader::new(
            std::fs::File::open(key_file).wrap_err("failed to open key file")?,
        ))
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("no PKCS#8 private key found in key file"))?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key.into())?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let app = build_app_tls(connect_arc(self)?);

        let tls_listener = TlsListener { inner: listener, acceptor, local_addr };
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(
                tls_listener,
                app.into_make_service_with_connect_info::<TlsAddr>(),
            )
            .await
            {
                tracing::error!(error = %err, "https server stopped");
            }
        });
        *self.serving.lock().await = Some(task);
        Ok(())
    }
}

/// The serve task needs an owned handle. Routes and the handler are frozen
/// by the time `start` runs, so a snapshot sharing the workload gauge is
/// equivalent to the original connection.
fn connect_arc(connect: &HyperConnect) -> Result<Arc<HyperConnect>> {
    Ok(Arc::new(HyperConnect {
        config: connect.config.clone(),
        routes: RwLock::new(connect.routes.read().unwrap().clone()),
        handler: RwLock::new(connect.handler.read().unwrap().clone()),
        listener: TokioMutex::new(None),
        serving: TokioMutex::new(None),
        workload: connect.workload.clone(),
    }))
}

struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for TlsListener {
    type Io = tokio_rustls::server::TlsStream<TcpStream>;
    type Addr = TlsAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => match self.acceptor.accept(stream).await {
                    Ok(stream) => return (stream, TlsAddr(addr)),
                    Err(err) => tracing::debug!(error = %err, "tls accept failed"),
                },
                Err(err) => tracing::debug!(error = %err, "accept failed"),
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(TlsAddr(self.local_addr))
    }
}

struct RequestThread {
    name: String,
    site: String,
    params: Map,
    method: String,
    uri: String,
    path: String,
    query: String,
    host: String,
    remote: String,
    headers: HeaderMap,
    body: Option<Body>,
    responder: Option<oneshot::Sender<Response<Body>>>,
}

#[async_trait]
impl HttpThread for RequestThread {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn site(&self) -> String {
        self.site.clone()
    }

    fn params(&self) -> Map {
        self.params.clone()
    }

    fn method(&self) -> String {
        self.method.clone()
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn query(&self) -> String {
        self.query.clone()
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn headers(&self) -> HeaderMap {
        self.headers.clone()
    }

    async fn body(&mut self) -> Result<Bytes> {
        match self.body.take() {
            Some(body) => Ok(body
                .collect()
                .await
                .map_err(|e| eyre!("failed to read body: {e}"))?
                .to_bytes()),
            None => Ok(Bytes::new()),
        }
    }

    async fn finish(&mut self, response: Response<Body>) -> Result<()> {
        match self.responder.take() {
            Some(tx) => tx
                .send(response)
                .map_err(|_| eyre!("response channel closed")),
            None => Err(eyre!("response already written")),
        }
    }
}

fn plain_response(status: u16, text: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(text.to_string()));
    *response.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    response
}

fn compile_pattern(uri: &str) -> Vec<Segment> {
    uri.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if segment == "*" {
                Segment::Tail
            } else if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Segment::Param(name.to_string())
            } else {
                Segment::Literal(segment.to_string())
            }
        })
        .collect()
}

/// Match a compiled pattern against a path; returns the literal-segment
/// count (for specificity ranking) and the extracted parameters.
fn match_pattern(pattern: &[Segment], path: &str) -> Option<(usize, Map)> {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let mut params = Map::new();
    let mut literals = 0;

    let mut i = 0;
    for segment in pattern {
        match segment {
            Segment::Tail => return Some((literals, params)),
            Segment::Literal(expected) => {
                if segments.get(i) != Some(&expected.as_str()) {
                    return None;
                }
                literals += 1;
            }
            Segment::Param(name) => {
                let value = segments.get(i)?;
                params.insert(name.clone(), Value::String((*value).to_string()));
            }
        }
        i += 1;
    }

    (i == segments.len()).then_some((literals, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patterns_extract_params() {
        let pattern = compile_pattern("/user/{id}/posts");
        let (literals, params) = match_pattern(&pattern, "/user/42/posts").unwrap();
        assert_eq!(literals, 2);
        assert_eq!(params.get("id"), Some(&json!("42")));

        assert!(match_pattern(&pattern, "/user/42").is_none());
        assert!(match_pattern(&pattern, "/user/42/posts/extra").is_none());
    }

    #[test]
    fn root_and_tail_patterns() {
        let root = compile_pattern("/");
        assert!(match_pattern(&root, "/").is_some());
        assert!(match_pattern(&root, "/x").is_none());

        let tail = compile_pattern("/static/*");
        assert!(match_pattern(&tail, "/static/css/site.css").is_some());
    }

    fn bare_connect() -> HyperConnect {
        HyperConnect {
            config: HttpConfig::default(),
            routes: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            listener: TokioMutex::new(None),
            serving: TokioMutex::new(None),
            workload: Arc::new(AtomicI64::new(0)),
        }
    }

    #[tokio::test]
    async fn resolve_prefers_host_specific_routes() {
        let concrete = bare_connect();
        concrete
            .register(
                "www.page.*",
                HttpRegister {
                    site: "www".into(),
                    uris: vec!["/page".into()],
                    methods: vec![],
                    hosts: vec!["www.example.com".into()],
                },
            )
            .unwrap();
        concrete
            .register(
                ".page.*",
                HttpRegister {
                    site: "".into(),
                    uris: vec!["/page".into()],
                    methods: vec![],
                    hosts: vec![],
                },
            )
            .unwrap();

        let (name, site, _) = concrete.resolve("www.example.com", "GET", "/page");
        assert_eq!(name, "www.page.*");
        assert_eq!(site, "www");

        let (name, site, _) = concrete.resolve("other.example.com", "GET", "/page");
        assert_eq!(name, ".page.*");
        assert_eq!(site, "");
    }

    #[tokio::test]
    async fn method_specific_routes_filter() {
        let concrete = bare_connect();
        concrete
            .register(
                ".add.post",
                HttpRegister {
                    site: "".into(),
                    uris: vec!["/add".into()],
                    methods: vec!["post".into()],
                    hosts: vec![],
                },
            )
            .unwrap();

        let (name, _, _) = concrete.resolve("x", "POST", "/add");
        assert_eq!(name, ".add.post");
        let (name, _, _) = concrete.resolve("x", "GET", "/add");
        assert_eq!(name, "");
    }
}
