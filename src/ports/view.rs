//! View renderer port.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;

use crate::view::{ViewBody, ViewConfig};

#[async_trait]
pub trait ViewDriver: Send + Sync {
    async fn connect(&self, config: ViewConfig) -> Result<Arc<dyn ViewConnect>>;
}

#[async_trait]
pub trait ViewConnect: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Render a view to markup.
    async fn parse(&self, body: ViewBody) -> Result<String>;
}
