//! Distributed mutex driver port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;

use crate::store::StoreConfig;

#[async_trait]
pub trait MutexDriver: Send + Sync {
    async fn connect(&self, name: &str, config: StoreConfig) -> Result<Arc<dyn MutexConnect>>;
}

#[async_trait]
pub trait MutexConnect: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Acquire `key` or fail if it is already held; the lock expires on its
    /// own after `expiry`.
    async fn lock(&self, key: &str, expiry: Duration) -> Result<()>;
    async fn unlock(&self, key: &str) -> Result<()>;
}
