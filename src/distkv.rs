//! Optional external key-value store used for remote setpoint distribution
//! and solar yield publishing. The network client lives outside this crate;
//! the in-memory implementation backs the `sim` mode and the tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

#[async_trait]
pub trait DistStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Idempotent: storing the present value again is a no-op.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

#[async_trait]
impl DistStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.map.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }
}
