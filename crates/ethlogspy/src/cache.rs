//! Short-TTL response cache for intercepted requests.
//!
//! Keys are canonical request envelopes, values the serialised response
//! payloads. Eviction is TTL-only; only successful local serves populate the
//! cache, so a fall-through or query error is never remembered.

use std::time::Duration;

use moka::future::Cache;

pub struct ResponseCache {
    inner: Cache<String, String>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        let inner = Cache::builder().time_to_live(ttl).build();
        Self { inner }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: String, payload: String) {
        self.inner.insert(key, payload).await;
    }
}
