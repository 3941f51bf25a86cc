//! In-memory store drivers.
//!
//! Default backends for cache, session and mutex. Entries carry their own
//! deadline and read paths treat expired entries as absent; there is no
//! background sweeper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyre::Result;
use scc::hash_map::Entry;
use scc::HashMap;

use crate::defs::{Map, Value};
use crate::ports::cache::{CacheConnect, CacheDriver};
use crate::ports::mutex::{MutexConnect, MutexDriver};
use crate::ports::session::{SessionConnect, SessionDriver};
use crate::ports::PortError;
use crate::store::StoreConfig;

fn deadline(expiry: Duration) -> Option<Instant> {
    (!expiry.is_zero()).then(|| Instant::now() + expiry)
}

fn alive(deadline: &Option<Instant>) -> bool {
    deadline.map(|d| d > Instant::now()).unwrap_or(true)
}

// ---- cache ----

#[derive(Default)]
pub struct MemoryCacheDriver;

impl MemoryCacheDriver {
    pub fn new() -> MemoryCacheDriver {
        MemoryCacheDriver
    }
}

#[async_trait]
impl CacheDriver for MemoryCacheDriver {
    async fn connect(&self, _name: &str, _config: StoreConfig) -> Result<Arc<dyn CacheConnect>> {
        Ok(Arc::new(MemoryCacheConnect { data: HashMap::new() }))
    }
}

struct MemoryCacheConnect {
    data: HashMap<String, (Value, Option<Instant>)>,
}

#[async_trait]
impl CacheConnect for MemoryCacheConnect {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .get_async(key)
            .await
            .filter(|entry| alive(&entry.get().1))
            .map(|entry| entry.get().0.clone()))
    }

    async fn write(&self, key: &str, value: Value, expiry: Duration) -> Result<()> {
        let entry = (value, deadline(expiry));
        match self.data.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = entry;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .data
            .get_async(key)
            .await
            .map(|entry| alive(&entry.get().1))
            .unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove_async(key).await;
        Ok(())
    }

    async fn serial(&self, key: &str, start: i64, step: i64) -> Result<i64> {
        let current = match self.data.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                let next = match &occupied.get().0 {
                    Value::Number(n) if alive(&occupied.get().1) => {
                        n.as_i64().unwrap_or(start) + step
                    }
                    _ => start,
                };
                *occupied.get_mut() = (Value::from(next), None);
                next
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry((Value::from(start), None));
                start
            }
        };
        Ok(current)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.data
            .iter_async(|key, (_, deadline)| {
                if key.starts_with(prefix) && alive(deadline) {
                    keys.push(key.clone());
                }
                true
            })
            .await;
        Ok(keys)
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let prefix = prefix.to_string();
        self.data
            .retain_async(|key, _| !key.starts_with(&prefix))
            .await;
        Ok(())
    }
}

// ---- session ----

#[derive(Default)]
pub struct MemorySessionDriver;

impl MemorySessionDriver {
    pub fn new() -> MemorySessionDriver {
        MemorySessionDriver
    }
}

#[async_trait]
impl SessionDriver for MemorySessionDriver {
    async fn connect(&self, _name: &str, _config: StoreConfig) -> Result<Arc<dyn SessionConnect>> {
        Ok(Arc::new(MemorySessionConnect { data: HashMap::new() }))
    }
}

struct MemorySessionConnect {
    data: HashMap<String, (Map, Option<Instant>)>,
}

#[async_trait]
impl SessionConnect for MemorySessionConnect {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<Map>> {
        Ok(self
            .data
            .get_async(id)
            .await
            .filter(|entry| alive(&entry.get().1))
            .map(|entry| entry.get().0.clone()))
    }

    async fn write(&self, id: &str, value: Map, expiry: Duration) -> Result<()> {
        let entry = (value, deadline(expiry));
        match self.data.entry_async(id.to_string()).await {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = entry;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.data.remove_async(id).await;
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let prefix = prefix.to_string();
        self.data
            .retain_async(|key, _| !key.starts_with(&prefix))
            .await;
        Ok(())
    }
}

// ---- mutex ----

#[derive(Default)]
pub struct MemoryMutexDriver;

impl MemoryMutexDriver {
    pub fn new() -> MemoryMutexDriver {
        MemoryMutexDriver
    }
}

#[async_trait]
impl MutexDriver for MemoryMutexDriver {
    async fn connect(&self, _name: &str, _config: StoreConfig) -> Result<Arc<dyn MutexConnect>> {
        Ok(Arc::new(MemoryMutexConnect { held: HashMap::new() }))
    }
}

struct MemoryMutexConnect {
    held: HashMap<String, Instant>,
}

#[async_trait]
impl MutexConnect for MemoryMutexConnect {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn lock(&self, key: &str, expiry: Duration) -> Result<()> {
        let now = Instant::now();
        match self.held.entry_async(key.to_string()).await {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    return Err(PortError::Locked(key.to_string()).into());
                }
                *occupied.get_mut() = now + expiry;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(now + expiry);
            }
        }
        Ok(())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.held.remove_async(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn cache_expiry_hides_entries() {
        let driver = MemoryCacheDriver::new();
        let connect = driver
            .connect("t", StoreConfig::with_expiry(Duration::from_secs(1)))
            .await
            .unwrap();

        connect
            .write("gone", json!(1), Duration::from_millis(10))
            .await
            .unwrap();
        connect.write("kept", json!(2), Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connect.read("gone").await.unwrap(), None);
        assert_eq!(connect.read("kept").await.unwrap(), Some(json!(2)));
        assert_eq!(connect.keys("").await.unwrap(), vec!["kept".to_string()]);
    }
}
