//! Narrow key/value interface backing the session directory.
//!
//! The relay needs only string keys and values, batched reads and writes,
//! deletion, prefix enumeration, and a liveness probe. [`MemoryStore`] keeps
//! everything in-process (single instance deployments and tests, where
//! several relay instances can share one `Arc<MemoryStore>`); [`RedisStore`]
//! talks to a shared Redis so every instance sees the same directory.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;

use crate::error::StoreError;

const SCAN_BATCH: usize = 500;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Values in the same order as `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Grouped write. Not atomic across keys.
    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn reconnect(&self) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

/// Open the backend named by a directory URL.
pub fn open(url: &str, timeout: Duration) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    if url == "memory://" || url.is_empty() {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisStore::open(url, timeout)?));
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    available: AtomicBool,
    reconnects: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.check()?;
        let entries = self.entries.lock();
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    async fn set_many(&self, pairs: &[(String, String)]) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.lock();
        for (key, value) in pairs {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock();
        Ok(keys.iter().filter(|key| entries.remove(*key).is_some()).count())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

pub struct RedisStore {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisStore {
    /// `timeout` bounds each call, connecting included.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: RwLock::new(None),
            timeout,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut slot = self.conn.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn query<T>(&self, cmd: &redis::Cmd) -> Result<T, StoreError>
    where
        T: redis::FromRedisValue + Send,
    {
        let attempt = async {
            let mut conn = self.connection().await?;
            Ok::<T, StoreError>(cmd.query_async::<_, T>(&mut conn).await?)
        };
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                // A connection that stopped answering is not reused.
                if let Ok(mut slot) = self.conn.try_write() {
                    *slot = None;
                }
                tracing::warn!(target = "session_relay::store", backend = %self.describe(), timeout_ms = self.timeout.as_millis() as u64, "redis call timed out");
                Err(self.timed_out())
            }
        }
    }

    fn timed_out(&self) -> StoreError {
        StoreError::Unavailable(format!(
            "redis did not answer within {}ms",
            self.timeout.as_millis()
        ))
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        self.query(&cmd).await
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("MSET");
        for (key, value) in entries {
            cmd.arg(key).arg(value);
        }
        self.query(&cmd).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.query(&cmd).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.query(&cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply {reply}")))
        }
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let connect = async {
            let mut slot = self.conn.write().await;
            *slot = None;
            let conn = self.client.get_multiplexed_async_connection().await?;
            *slot = Some(conn);
            Ok::<(), StoreError>(())
        };
        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| self.timed_out())?
    }

    fn describe(&self) -> String {
        let info = self.client.get_connection_info();
        format!("redis {:?}", info.addr)
    }
}
