//! Cache driver port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;

use crate::defs::Value;
use crate::store::StoreConfig;

#[async_trait]
pub trait CacheDriver: Send + Sync {
    async fn connect(&self, name: &str, config: StoreConfig) -> Result<Arc<dyn CacheConnect>>;
}

#[async_trait]
pub trait CacheConnect: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn read(&self, key: &str) -> Result<Option<Value>>;
    async fn write(&self, key: &str, value: Value, expiry: Duration) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Atomic counter: initialize at `start`, then advance by `step`.
    async fn serial(&self, key: &str, start: i64, step: i64) -> Result<i64>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    async fn clear(&self, prefix: &str) -> Result<()>;
}
