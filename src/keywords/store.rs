//! External key-value mirror of the stream keywords.
//!
//! Each mirrored keyword becomes `HSET <prefix><short-key> value <value>`,
//! written as one atomic pipeline per push.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::KeywordValue;
use crate::error::{AppResult, CamstackError};

/// Hash field every mirrored key is written to.
pub const VALUE_FIELD: &str = "value";

/// Destination of the keyword mirror.
#[async_trait]
pub trait KeywordStore: Send + Sync {
    /// Write `(store key, value)` pairs in one transaction.
    async fn push(&self, entries: &[(String, KeywordValue)]) -> AppResult<()>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Redis-compatible store.
pub struct RedisStore {
    url: String,
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Does not connect: the first push does.
    pub fn open(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            url: url.to_string(),
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl KeywordStore for RedisStore {
    async fn push(&self, entries: &[(String, KeywordValue)]) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut con = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            match value {
                KeywordValue::Int(i) => pipe.hset(key, VALUE_FIELD, *i).ignore(),
                KeywordValue::Float(x) => pipe.hset(key, VALUE_FIELD, *x).ignore(),
                KeywordValue::Bool(b) => pipe.hset(key, VALUE_FIELD, i64::from(*b)).ignore(),
                KeywordValue::Str(s) => pipe.hset(key, VALUE_FIELD, s.as_str()).ignore(),
            };
        }

        let res: Result<(), redis::RedisError> = pipe.query_async(&mut con).await;
        if let Err(e) = res {
            // Reconnect on the next push
            *self.conn.lock().await = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("redis at {}", self.url)
    }
}

/// In-process store, used when no external store is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    hashes: Mutex<BTreeMap<String, BTreeMap<String, KeywordValue>>>,
    unavailable: AtomicBool,
    pushes: AtomicU64,
}

impl MemoryStore {
    /// Empty, available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The `value` field of `key`, if mirrored.
    pub fn get(&self, key: &str) -> Option<KeywordValue> {
        self.hashes
            .lock()
            .get(key)
            .and_then(|h| h.get(VALUE_FIELD))
            .cloned()
    }

    /// Keys mirrored so far.
    pub fn keys(&self) -> Vec<String> {
        self.hashes.lock().keys().cloned().collect()
    }

    /// Simulate an outage: pushes fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successful pushes so far.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeywordStore for MemoryStore {
    async fn push(&self, entries: &[(String, KeywordValue)]) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CamstackError::ExternalStoreUnavailable(
                "memory store marked unavailable".into(),
            ));
        }
        let mut hashes = self.hashes.lock();
        for (key, value) in entries {
            hashes
                .entry(key.clone())
                .or_default()
                .insert(VALUE_FIELD.to_string(), value.clone());
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory store".to_string()
    }
}

/// Store that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl KeywordStore for NullStore {
    async fn push(&self, _entries: &[(String, KeywordValue)]) -> AppResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "disabled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_hashes_values() {
        let store = MemoryStore::new();
        store
            .push(&[
                ("x_CEXPO".into(), KeywordValue::Float(0.001)),
                ("x_CNAME".into(), KeywordValue::Str("Simulated".into())),
            ])
            .await
            .unwrap();
        assert_eq!(store.get("x_CEXPO"), Some(KeywordValue::Float(0.001)));
        assert_eq!(store.keys().len(), 2);
        assert_eq!(store.push_count(), 1);
    }

    #[tokio::test]
    async fn memory_store_outage() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store
            .push(&[("x_CTEMP".into(), KeywordValue::Float(1.0))])
            .await
            .unwrap_err();
        assert!(matches!(err, CamstackError::ExternalStoreUnavailable(_)));
        assert!(store.get("x_CTEMP").is_none());
    }

    #[tokio::test]
    async fn redis_store_reports_unreachable_server() {
        // Nothing listens on port 1
        let store = RedisStore::open("redis://127.0.0.1:1/").unwrap();
        let err = store
            .push(&[("x_CTEMP".into(), KeywordValue::Float(1.0))])
            .await
            .unwrap_err();
        assert!(matches!(err, CamstackError::ExternalStoreUnavailable(_)));
        assert!(RedisStore::open("not a url").is_err());
    }
}
