//! Best-effort key/value cache.
//!
//! Every failure is reported as a [`CacheError`] that callers treat as a miss;
//! nothing here is allowed to fail a request.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, IntoConnectionInfo};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RedisConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,
    #[error("cache transport error: {0}")]
    Transport(String),
    #[error("cache codec error: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<T, CacheError> {
    let raw = cache.get(key).await?;
    Ok(serde_json::from_str(&raw)?)
}

pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, raw, ttl).await
}

/// Runs a redis call under `limit`; a stalled server surfaces as a transport error.
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, CacheError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(CacheError::from),
        Err(_) => Err(CacheError::Transport(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Redis-backed cache over a reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    response_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, CacheError> {
        let mut info = cfg.url.as_str().into_connection_info()?;
        if let Some(password) = &cfg.password {
            info.redis.password = Some(password.clone());
        }
        info.redis.db = cfg.db;

        let client = Client::open(info)?;
        let conn = bounded(cfg.connect_timeout(), "redis connect", ConnectionManager::new(client)).await?;
        info!(db = cfg.db, "redis cache connected");
        Ok(Self {
            conn,
            response_timeout: cfg.response_timeout(),
        })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> =
            bounded(self.response_timeout, "redis GET", conn.get(key)).await?;
        value.ok_or(CacheError::Miss)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        bounded(
            self.response_timeout,
            "redis SETEX",
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
        )
        .await?;
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        bounded(self.response_timeout, "redis DEL", conn.del::<_, ()>(key)).await?;
        Ok(())
    }
}

/// Stand-in used when Redis is unreachable at startup: every read misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Result<String, CacheError> {
        Err(CacheError::Miss)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
