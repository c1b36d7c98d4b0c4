//! Recipient cache
//!
//! Best-effort hint mapping a username to the session it was last seen on.
//! The hub validates every hit against its live registry before using it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::types::SessionId;

/// Key namespace for recipient entries
pub const KEY_PREFIX: &str = "cache:user:";

/// Cache key for a username
pub fn recipient_key(username: &str) -> String {
    format!("{}{}", KEY_PREFIX, username)
}

/// Last-known location of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub username: String,
    pub session_id: SessionId,
}

impl SessionDescriptor {
    pub fn encode(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Key/value cache with per-entry expiry
#[async_trait]
pub trait RecipientCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
}

/// Fetch and decode the descriptor cached for `username`
pub async fn lookup(
    cache: &dyn RecipientCache,
    username: &str,
) -> Result<Option<SessionDescriptor>, CacheError> {
    match cache.get(&recipient_key(username)).await? {
        Some(raw) => Ok(Some(SessionDescriptor::decode(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and store a descriptor under its username
pub async fn remember(
    cache: &dyn RecipientCache,
    descriptor: &SessionDescriptor,
    ttl: Duration,
) -> Result<(), CacheError> {
    cache
        .set(&recipient_key(&descriptor.username), descriptor.encode()?, ttl)
        .await
}

/// In-memory [`RecipientCache`]
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, (String, Instant)>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Backend("memory cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl RecipientCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        let live = entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone());
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries()?
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}
