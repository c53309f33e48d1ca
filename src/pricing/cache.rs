//! Price cache: Redis in production, a TTL map for tests and local runs

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::PriceError;

/// `"{symbol}:price:{timestamp}"`
pub fn price_key(symbol: &str, timestamp: u64) -> String {
    format!("{}:price:{}", symbol, timestamp)
}

#[async_trait]
pub trait PriceCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PriceError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PriceError>;
}

// ============================================
// REDIS
// ============================================

pub struct RedisPriceCache {
    manager: ConnectionManager,
}

impl RedisPriceCache {
    pub async fn connect(url: &str) -> Result<Self, PriceError> {
        let client = Client::open(url).map_err(|e| PriceError::Cache(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| PriceError::Cache(e.to_string()))?;

        debug!("Redis price cache connected");

        Ok(Self { manager })
    }
}

#[async_trait]
impl PriceCache for RedisPriceCache {
    async fn get(&self, key: &str) -> Result<Option<String>, PriceError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(|e| PriceError::Cache(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PriceError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| PriceError::Cache(e.to_string()))?;
        trace!("Cached {} = {} for {}s", key, value, ttl.as_secs());
        Ok(())
    }
}

// ============================================
// IN-MEMORY
// ============================================

#[derive(Default)]
pub struct MemoryPriceCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryPriceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriceCache for MemoryPriceCache {
    async fn get(&self, key: &str) -> Result<Option<String>, PriceError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), PriceError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| now < *expires_at);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }
}
