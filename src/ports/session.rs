//! Session driver port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;

use crate::defs::Map;
use crate::store::StoreConfig;

#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn connect(&self, name: &str, config: StoreConfig) -> Result<Arc<dyn SessionConnect>>;
}

#[async_trait]
pub trait SessionConnect: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn read(&self, id: &str) -> Result<Option<Map>>;
    async fn write(&self, id: &str, value: Map, expiry: Duration) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn clear(&self, prefix: &str) -> Result<()>;
}
