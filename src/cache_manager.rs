/**
Cache manager for query groups

A registry mapping store keys to cache groups. Queries borrow their group
from here so a kept-alive group can be picked up again by the next query
built with the same key. Groups of different data types share one registry.
*/
use crate::cache::CacheGroup;
use crate::equality::Structural;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info, warn};

/// Process-wide registry for callers that do not inject their own
static SHARED: OnceLock<Arc<CacheManager>> = OnceLock::new();

/// Type-independent lifecycle of a registered group
pub trait GroupLifecycle: Send + Sync {
    fn is_destroyed(&self) -> bool;
    fn freeze(&self);
    fn destroy(&self);
}

impl<A, P> GroupLifecycle for CacheGroup<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn is_destroyed(&self) -> bool {
        Self::is_destroyed(self)
    }

    fn freeze(&self) {
        Self::freeze(self);
    }

    fn destroy(&self) {
        Self::destroy(self);
    }
}

struct Entry {
    lifecycle: Arc<dyn GroupLifecycle>,
    typed: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct CacheManager {
    caches: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("keys", &self.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

impl CacheManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared registry, created on first use
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::clone(SHARED.get_or_init(|| {
            info!("📦 Shared cache manager initialized");
            Arc::new(Self::new())
        }))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `group` under `key`, replacing any previous entry
    pub fn set_cache<A, P>(&self, key: impl Into<String>, group: Arc<CacheGroup<A, P>>)
    where
        A: Structural + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        let key = key.into();
        debug!("📦 Cache group registered: {}", key);
        self.lock().insert(
            key,
            Entry {
                lifecycle: Arc::clone(&group) as Arc<dyn GroupLifecycle>,
                typed: group,
            },
        );
    }

    /// Live group for `key`. Dead entries are evicted on lookup.
    #[must_use]
    pub fn get_cache<A, P>(&self, key: &str) -> Option<Arc<CacheGroup<A, P>>>
    where
        A: Structural + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        let mut caches = self.lock();
        let entry = caches.get(key)?;
        if entry.lifecycle.is_destroyed() {
            caches.remove(key);
            debug!("🧹 Purged destroyed cache group: {}", key);
            return None;
        }
        let typed = Arc::clone(&entry.typed);
        drop(caches);
        match typed.downcast::<CacheGroup<A, P>>() {
            Ok(group) => Some(group),
            Err(_) => {
                warn!("⚠️  Cache group {} holds a different data type, ignoring it", key);
                None
            }
        }
    }

    /// Remove and destroy the group for `key`
    pub fn remove_cache(&self, key: &str) {
        let removed = self.lock().remove(key);
        if let Some(entry) = removed {
            entry.lifecycle.destroy();
            debug!("🗑️ Cache group removed: {}", key);
        }
    }

    /// Freeze the group for `key`, keeping it registered for reuse
    pub fn freeze_cache(&self, key: &str) {
        let lifecycle = self.live(key);
        if let Some(lifecycle) = lifecycle {
            lifecycle.freeze();
            debug!("🧊 Cache group kept alive: {}", key);
        }
    }

    /// Whether a live group is registered for `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Number of registered entries, dead ones included until looked up
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn live(&self, key: &str) -> Option<Arc<dyn GroupLifecycle>> {
        let mut caches = self.lock();
        let entry = caches.get(key)?;
        if entry.lifecycle.is_destroyed() {
            caches.remove(key);
            debug!("🧹 Purged destroyed cache group: {}", key);
            return None;
        }
        Some(Arc::clone(&entry.lifecycle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, ConnectOptions};
    use serde_json::{json, Value};

    fn connected(key: &str) -> Arc<CacheGroup<Value, ()>> {
        let group = Arc::new(CacheGroup::new(key, Arc::new(json!([]))));
        group
            .connect(ConnectOptions {
                cache_key: CacheKey::Init,
                easing: false,
                stale_time: None,
                max: 1,
            })
            .unwrap();
        group
    }

    #[test]
    fn test_get_returns_registered_group() {
        let manager = CacheManager::new();
        let group = connected("users");
        manager.set_cache("users", Arc::clone(&group));

        let found = manager.get_cache::<Value, ()>("users").unwrap();
        assert!(Arc::ptr_eq(&found, &group));
        assert!(manager.get_cache::<Value, ()>("missing").is_none());
    }

    #[test]
    fn test_type_mismatch_is_not_returned() {
        let manager = CacheManager::new();
        manager.set_cache("users", connected("users"));
        assert!(manager.get_cache::<Value, u32>("users").is_none());
        assert!(manager.contains("users"));
    }

    #[test]
    fn test_remove_destroys_and_freeze_keeps() {
        let manager = CacheManager::new();
        let kept = connected("kept");
        let removed = connected("removed");
        manager.set_cache("kept", Arc::clone(&kept));
        manager.set_cache("removed", Arc::clone(&removed));

        manager.freeze_cache("kept");
        manager.remove_cache("removed");

        assert!(!kept.is_destroyed());
        assert!(!kept.is_connected());
        assert!(manager.contains("kept"));
        assert!(removed.is_destroyed());
        assert!(!manager.contains("removed"));
    }

    #[test]
    fn test_dead_groups_are_purged_on_lookup() {
        let manager = CacheManager::new();
        let group = connected("orders");
        manager.set_cache("orders", Arc::clone(&group));
        group.destroy();

        assert_eq!(manager.len(), 1);
        assert!(manager.get_cache::<Value, ()>("orders").is_none());
        assert!(manager.is_empty());
    }
}
