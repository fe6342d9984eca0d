use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::models::DcaRecord;
use crate::Result;

const DEFAULT_KEY: &str = "perpbot:dca";

/// Durable symbol -> {side, DCA count} map that survives restarts
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, DcaRecord>>;

    /// Overwrite the stored map with `records`
    async fn save(&self, records: &HashMap<String, DcaRecord>) -> Result<()>;
}

/// Process-local store, used for paper runs without Redis and in tests
#[derive(Default)]
pub struct MemorySnapshotStore {
    records: Mutex<HashMap<String, DcaRecord>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: HashMap<String, DcaRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn records(&self) -> HashMap<String, DcaRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<HashMap<String, DcaRecord>> {
        Ok(self.records())
    }

    async fn save(&self, records: &HashMap<String, DcaRecord>) -> Result<()> {
        *self.records.lock().unwrap_or_else(|p| p.into_inner()) = records.clone();
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}

/// Redis-backed store
///
/// One hash per bot: field = symbol, value = JSON `DcaRecord`.
pub struct RedisSnapshotStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisSnapshotStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_key(redis_url, DEFAULT_KEY).await
    }

    pub async fn with_key(redis_url: &str, key: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn load(&self) -> Result<HashMap<String, DcaRecord>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(&self.key).await?;

        let mut records = HashMap::with_capacity(raw.len());
        for (symbol, json) in raw {
            match serde_json::from_str::<DcaRecord>(&json) {
                Ok(record) => {
                    records.insert(symbol, record);
                }
                Err(e) => tracing::warn!(symbol = %symbol, "Skipping unreadable DCA record: {}", e),
            }
        }

        tracing::info!("Loaded {} DCA records from Redis", records.len());
        Ok(records)
    }

    async fn save(&self, records: &HashMap<String, DcaRecord>) -> Result<()> {
        let mut items = Vec::with_capacity(records.len());
        for (symbol, record) in records {
            items.push((symbol.clone(), serde_json::to_string(record)?));
        }

        // Replace the hash in one transaction so readers never see a partial map
        let mut pipe = redis::pipe();
        pipe.atomic().del(&self.key).ignore();
        if !items.is_empty() {
            pipe.hset_multiple(&self.key, &items).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!("Saved {} DCA records to Redis", items.len());
        Ok(())
    }
}
