// Copyright 2025 Tokenlens (https://github.com/sochdb/tokenlens)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Conversation tree cache.
//!
//! Fetching and normalizing a conversation tree is the expensive part
//! of an accounting pass, so normalized trees are kept for a few
//! minutes keyed by conversation id. User selections live in the state
//! store instead; evicting a tree never resets user choices.

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokenlens_core::NormalizedConversation;

/// Configuration for the tree cache.
#[derive(Debug, Clone)]
pub struct TreeCacheConfig {
    /// Maximum number of cached conversations.
    pub max_entries: u64,
    /// Time-to-live for cache entries.
    pub ttl: Duration,
}

impl Default for TreeCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            ttl: Duration::from_secs(300),
        }
    }
}

/// A cached normalized conversation.
#[derive(Debug, Clone)]
pub struct CachedConversation {
    pub conversation: Arc<NormalizedConversation>,
    pub fetched_at: DateTime<Utc>,
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct TreeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: u64,
}

/// TTL cache of normalized conversation trees.
pub struct TreeCache {
    cache: Cache<String, CachedConversation>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TreeCache {
    pub fn new(config: TreeCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a cached conversation if it is still within its TTL.
    pub fn get(&self, conversation_id: &str) -> Option<CachedConversation> {
        match self.cache.get(conversation_id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, conversation_id: impl Into<String>, conversation: Arc<NormalizedConversation>) {
        self.cache.insert(
            conversation_id.into(),
            CachedConversation {
                conversation,
                fetched_at: Utc::now(),
            },
        );
    }

    /// Drop one conversation immediately. Used by manual refresh and
    /// whenever the conversation is mutated in bulk.
    pub fn invalidate(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TreeCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        TreeCacheStats {
            hits,
            misses,
            hit_rate,
            entry_count: self.cache.entry_count(),
        }
    }
}

impl Default for TreeCache {
    fn default() -> Self {
        Self::new(TreeCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: &str) -> Arc<NormalizedConversation> {
        Arc::new(NormalizedConversation::empty(id))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = TreeCache::default();
        cache.insert("c1", conversation("c1"));
        let entry = cache.get("c1").unwrap();
        assert_eq!(entry.conversation.conversation_id, "c1");
    }

    #[test]
    fn test_miss_then_hit_counted() {
        let cache = TreeCache::default();
        assert!(cache.get("c1").is_none());
        cache.insert("c1", conversation("c1"));
        assert!(cache.get("c1").is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = TreeCache::default();
        cache.insert("c1", conversation("c1"));
        cache.invalidate("c1");
        assert!(cache.get("c1").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = TreeCache::new(TreeCacheConfig {
            max_entries: 8,
            ttl: Duration::from_millis(10),
        });
        cache.insert("c1", conversation("c1"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("c1").is_none());
    }
}
