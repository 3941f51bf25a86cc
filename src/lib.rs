//! Strata - an in-process framework for multi-tenant HTTP services.
//!
//! Strata couples a **module kernel** (configure → initialize → connect →
//! launch → terminate over every pluggable subsystem) with a driver-backed
//! **request pipeline**: requests resolve to named routes across virtual
//! sites, run through layered filter/handler chains, have their parameters
//! declaratively validated, coerced and encrypted, authenticate by bearer
//! token, and render one of a closed set of response bodies.
//!
//! # Features
//! - Named routes with per-site fan-out and per-method expansion
//! - Declarative parameter mapping (defaults, validation, codec-backed
//!   encode/decrypt, nested schemas)
//! - Bearer tokens (`header.payload.hmac`) with validity windows
//! - Sharded cache/session/mutex over a weighted consistent-hash ring
//! - A typed method engine with normalized dispatch shapes
//! - Static file fallback, CORS gate, client-signature validation,
//!   session-sign and entity-find gates
//! - Pluggable HTTP/store/view drivers; defaults bundled in [`adapters`]
//!
//! # Quick Example
//! ```no_run
//! use strata::http::{Access, Router, http_func};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! strata::register(
//!     "hello",
//!     Router {
//!         uri: "/".into(),
//!         action: Some(http_func(|ctx: &mut Access| Box::pin(async move {
//!             ctx.text("hello world", None);
//!         }))),
//!         ..Router::default()
//!     },
//! );
//! strata::run(None).await
//! # }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (driver traits) from **adapters**
//! (implementations) and keeps the pipeline inside the modules. Every
//! module is a process-wide singleton owned by the kernel; registries are
//! built during the register/configure phase and are effectively immutable
//! once launch returns.
//!
//! # Error Handling
//! Transport and lifecycle failures use `eyre::Result` with context
//! attached. Domain outcomes (validation, auth, lookups) are [`result::Res`]
//! values carrying a state key that localizes at render time.

pub mod adapters;
pub mod basic;
pub mod codec;
pub mod config;
pub mod context;
pub mod defs;
pub mod engine;
pub mod http;
pub mod kernel;
pub mod ports;
pub mod result;
pub mod store;
pub mod token;
pub mod tracing_setup;
pub mod utils;
pub mod view;

pub use crate::context::Context;
pub use crate::defs::{Map, Value};
pub use crate::kernel::{
    configure, identify, mode, ready, ready_with, register, register_with, run, setting, Mode,
    Module, Registry,
};
pub use crate::result::{Res, FAIL, INVALID, NOTHING, OK, RETRY, UNAUTHORIZED};
