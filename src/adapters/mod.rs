//! Bundled driver implementations.
//!
//! `hyper_server` is the default HTTP listener; `memory` provides the
//! default cache/session/mutex backends; `text_view` is a minimal
//! substitution renderer. Applications register richer drivers over these.

pub mod hyper_server;
pub mod memory;
pub mod text_view;
