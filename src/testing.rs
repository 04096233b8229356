//! In-process doubles for the store and cache traits.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::{
    cache::{Cache, CacheError},
    users::{
        repo::{StoreError, UserStore},
        repo_types::{NewUser, User},
    },
};

#[derive(Default)]
struct StoreInner {
    next_id: i64,
    rows: HashMap<i64, User>,
    hidden_usernames: HashSet<String>,
    down: bool,
}

/// Mirrors the Postgres store: monotonic ids and a unique username index.
#[derive(Default)]
pub struct InMemoryUserStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryUserStore {
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Makes `get_by_username` miss for `username` while `create` still
    /// enforces uniqueness, as when a concurrent insert wins the race.
    pub fn hide_from_username_lookup(&self, username: &str) {
        self.inner.lock().hidden_usernames.insert(username.to_owned());
    }

    pub fn set_down(&self, down: bool) {
        self.inner.lock().down = down;
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.lock();
        if inner.rows.values().any(|u| u.username == user.username) {
            return Err(StoreError::DuplicateKey);
        }
        inner.next_id += 1;
        let now = OffsetDateTime::now_utc();
        let row = User {
            id: inner.next_id,
            username: user.username,
            password_hash: user.password_hash,
            email: user.email,
            created_at: now,
            updated_at: now,
        };
        inner.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        self.inner.lock().rows.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_by_username(&self, username: &str) -> Result<User, StoreError> {
        let inner = self.inner.lock();
        if inner.hidden_usernames.contains(username) {
            return Err(StoreError::NotFound);
        }
        inner
            .rows
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update(&self, user: &User) -> Result<User, StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.rows.get_mut(&user.id).ok_or(StoreError::NotFound)?;
        *row = User {
            updated_at: OffsetDateTime::now_utc(),
            ..user.clone()
        };
        Ok(row.clone())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .rows
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.inner.lock().down {
            return Err(StoreError::Backend(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

/// Key/value map with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    /// Live value for `key`, bypassing the trait.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(v, _)| v.clone())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        self.raw(key).ok_or(CacheError::Miss)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Cache whose transport is always down.
pub struct FailingCache;

#[async_trait]
impl Cache for FailingCache {
    async fn get(&self, _key: &str) -> Result<String, CacheError> {
        Err(CacheError::Transport("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Transport("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Transport("connection refused".into()))
    }
}
