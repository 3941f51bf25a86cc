//! Driver ports.
//!
//! Traits that concrete back-ends implement: the HTTP listener, the three
//! sharded stores and the view renderer. Business logic depends only on
//! these interfaces; the bundled implementations live in `adapters`.

pub mod cache;
pub mod http;
pub mod mutex;
pub mod session;
pub mod view;

use thiserror::Error;

/// Error type shared by store driver implementations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PortError {
    #[error("invalid connection")]
    InvalidConnection,
    #[error("key is locked: {0}")]
    Locked(String),
    #[error("driver error: {0}")]
    Driver(String),
}
