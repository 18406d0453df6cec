//! Oracle Response Cache
//!
//! Bounded LRU with a time-to-live, constructed once and injected into the
//! oracle stack. Keys hash the model and the full message list, so two
//! sessions only share an entry when they sent the exact same conversation.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{Oracle, OracleError, OracleReply, OracleRequest};

struct Entry {
    reply: OracleReply,
    inserted_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Least recently used first.
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn key(request: &OracleRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        hasher.update(request.temperature.to_bits().to_le_bytes());
        for message in &request.messages {
            hasher.update([0u8]);
            hasher.update(serde_json::to_string(&message.role).unwrap_or_default().as_bytes());
            hasher.update([1u8]);
            hasher.update(message.content.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<OracleReply> {
        let mut inner = self.inner.lock().await;
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };
        if expired {
            inner.remove(key);
            return None;
        }
        inner.touch(key);
        inner.entries.get(key).map(|e| e.reply.clone())
    }

    pub async fn set(&self, key: String, reply: OracleReply) {
        let mut inner = self.inner.lock().await;
        inner.touch(&key);
        inner.entries.insert(key, Entry { reply, inserted_at: Instant::now() });

        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(evict) => {
                    inner.entries.remove(&evict);
                }
                None => break,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.order.clear();
    }
}

/// Oracle that answers from a [`ResponseCache`] before delegating.
pub struct CachedOracle {
    inner: Arc<dyn Oracle>,
    cache: Arc<ResponseCache>,
}

impl CachedOracle {
    pub fn new(inner: Arc<dyn Oracle>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Oracle for CachedOracle {
    async fn call(&self, request: OracleRequest) -> Result<OracleReply, OracleError> {
        let key = ResponseCache::key(&request);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::debug!("Oracle cache hit for model {}", request.model);
            return Ok(cached);
        }

        let reply = self.inner.call(request).await?;
        self.cache.set(key, reply.clone()).await;
        Ok(reply)
    }
}
