//! TTL cache of normalized results.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::normalizer::EvidenceEvent;

/// `cache:` config section. A zero TTL disables caching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl_seconds() -> u64 {
    300
}
fn default_max_entries() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

/// SHA-256 over tool, method and arguments.
pub fn cache_key(tool: &str, method: &str, arguments: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(arguments.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Cached {
    event: EvidenceEvent,
    stored_at: Instant,
}

pub struct ResultCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, Cached>>,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_seconds),
            max_entries: config.max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// A live entry for `key`.
    pub async fn get(&self, key: &str) -> Option<EvidenceEvent> {
        if !self.is_enabled() {
            return None;
        }
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|c| c.stored_at.elapsed() < self.ttl)
            .map(|c| c.event.clone())
    }

    pub async fn insert(&self, key: String, event: EvidenceEvent) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, c| c.stored_at.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, c)| c.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Cached {
                event,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, c| c.stored_at.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::invoker::normalizer::normalize;

    fn event(tool: &str) -> EvidenceEvent {
        normalize(tool, None, json!({"content": "x"}))
    }

    #[test]
    fn test_key_depends_on_every_part() {
        let base = cache_key("search", "tools/call", &json!({"q": 1}));
        assert_eq!(base, cache_key("search", "tools/call", &json!({"q": 1})));
        assert_ne!(base, cache_key("search2", "tools/call", &json!({"q": 1})));
        assert_ne!(base, cache_key("search", "tools/list", &json!({"q": 1})));
        assert_ne!(base, cache_key("search", "tools/call", &json!({"q": 2})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = ResultCache::new(&CacheConfig {
            ttl_seconds: 10,
            max_entries: 8,
        });
        cache.insert("k".into(), event("search")).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_oldest() {
        let cache = ResultCache::new(&CacheConfig {
            ttl_seconds: 60,
            max_entries: 2,
        });
        cache.insert("a".into(), event("a")).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("b".into(), event("b")).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("c".into(), event("c")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_disables() {
        let cache = ResultCache::new(&CacheConfig {
            ttl_seconds: 0,
            max_entries: 8,
        });
        cache.insert("k".into(), event("search")).await;
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.len().await, 0);
    }
}
