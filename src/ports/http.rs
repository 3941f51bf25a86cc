//! HTTP driver port.
//!
//! A driver owns the listener: it accepts connections, matches the request
//! against the routes the module registered, and hands each request to the
//! module as an [`HttpThread`] carrying the resolved route name, the matched
//! site and the extracted path parameters. The module writes the response
//! back through [`HttpThread::finish`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use eyre::Result;
use hyper::Response;

use crate::defs::Map;
use crate::http::HttpConfig;

/// Driver-visible route registration.
#[derive(Debug, Clone, Default)]
pub struct HttpRegister {
    pub site: String,
    pub uris: Vec<String>,
    pub methods: Vec<String>,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpHealth {
    pub workload: i64,
}

/// The module's request entry point, installed with [`HttpConnect::accept`].
pub type HttpHandler = Arc<
    dyn Fn(Box<dyn HttpThread>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

#[async_trait]
pub trait HttpDriver: Send + Sync {
    async fn connect(&self, config: HttpConfig) -> Result<Arc<dyn HttpConnect>>;
}

#[async_trait]
pub trait HttpConnect: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn health(&self) -> Result<HttpHealth>;
    async fn close(&self) -> Result<()>;

    fn accept(&self, handler: HttpHandler) -> Result<()>;
    fn register(&self, name: &str, config: HttpRegister) -> Result<()>;

    async fn start(&self) -> Result<()>;
    async fn start_tls(&self, cert_file: &str, key_file: &str) -> Result<()>;
}

/// One in-flight request, owned by a single serve call end to end.
#[async_trait]
pub trait HttpThread: Send {
    /// Resolved route name, empty when nothing matched.
    fn name(&self) -> String;
    /// Pre-resolved site key, empty when the driver leaves resolution to the
    /// module's host index.
    fn site(&self) -> String;
    /// Parameters extracted from the matched uri pattern.
    fn params(&self) -> Map;

    fn method(&self) -> String;
    fn uri(&self) -> String;
    fn path(&self) -> String;
    fn query(&self) -> String;
    fn host(&self) -> String;
    /// Peer address of the connection.
    fn remote(&self) -> String;
    fn headers(&self) -> HeaderMap;

    /// Read the request body; callable once.
    async fn body(&mut self) -> Result<Bytes>;

    /// Write the response and release the connection; callable once.
    async fn finish(&mut self, response: Response<Body>) -> Result<()>;
}
