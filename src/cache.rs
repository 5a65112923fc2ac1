#![allow(dead_code)]
//! Cache for built (unselected) tree item maps.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::tree::ItemMap;

/// Cache store collaborator: get/set with a lifetime and invalidation tags.
pub trait TreeCache: Send + Sync {
    fn get(&self, key: &str) -> Option<ItemMap>;

    fn set(&self, key: &str, items: ItemMap, ttl: Duration, tags: &[String]);

    /// Drop every entry carrying `tag`. Returns how many were dropped.
    fn invalidate_tag(&self, tag: &str) -> usize;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    items: ItemMap,
    /// `None` when the lifetime is past what `Instant` can represent.
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory cache. Expired entries read as misses and are evicted on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let store = self.inner.read().unwrap();
        store.values().filter(|e| e.is_live(now)).count()
    }
}

impl TreeCache for MemoryCache {
    fn get(&self, key: &str) -> Option<ItemMap> {
        let now = Instant::now();
        {
            let store = self.inner.read().unwrap();
            match store.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.items.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut store = self.inner.write().unwrap();
        if store.get(key).map(|e| !e.is_live(now)).unwrap_or(false) {
            store.remove(key);
            tracing::debug!("MemoryCache: evicted expired '{}'", key);
        }
        None
    }

    fn set(&self, key: &str, items: ItemMap, ttl: Duration, tags: &[String]) {
        let count = items.len();
        let entry = CacheEntry {
            items,
            expires_at: Instant::now().checked_add(ttl),
            tags: tags.to_vec(),
        };
        let mut store = self.inner.write().unwrap();
        store.insert(key.to_string(), entry);
        tracing::debug!("MemoryCache: stored '{}' ({} items, ttl {:?})", key, count, ttl);
    }

    fn invalidate_tag(&self, tag: &str) -> usize {
        let mut store = self.inner.write().unwrap();
        let before = store.len();
        store.retain(|_, entry| !entry.tags.iter().any(|t| t == tag));
        let dropped = before - store.len();
        tracing::debug!("MemoryCache: invalidated tag '{}' ({} entries)", tag, dropped);
        dropped
    }
}
