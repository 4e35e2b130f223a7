/**
Query client

Owns the environment signals and the cache manager, and keeps one handle per
store key. Registering a key twice hands back the live handle. Destroyed
handles are dropped from the registry lazily, the next time it is touched.
*/
use crate::cache::Defaults;
use crate::cache_manager::CacheManager;
use crate::environment::Environment;
use crate::equality::Structural;
use crate::error::{Error, Result};
use crate::query::{Query, QueryOptions};
use crate::store::Store;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

trait Registered: Send + Sync {
    fn destroy(&self);
    fn is_destroyed(&self) -> bool;
}

impl<A, P> Registered for Query<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Serialize + Send + Sync + 'static,
{
    fn destroy(&self) {
        Self::destroy(self);
    }

    fn is_destroyed(&self) -> bool {
        Self::is_destroyed(self)
    }
}

impl<A, P> Registered for Store<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn destroy(&self) {
        Self::destroy(self);
    }

    fn is_destroyed(&self) -> bool {
        Self::is_destroyed(self)
    }
}

struct Registration {
    id: Uuid,
    lifecycle: Arc<dyn Registered>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl Registration {
    fn new<H>(handle: H) -> Self
    where
        H: Registered + Clone + Any + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            lifecycle: Arc::new(handle.clone()),
            typed: Arc::new(handle),
        }
    }

    fn downcast<H: Clone + 'static>(&self) -> Option<H> {
        self.typed.downcast_ref::<H>().cloned()
    }
}

pub struct QueryClient {
    manager: Arc<CacheManager>,
    environment: Environment,
    defaults: Defaults,
    handles: Mutex<HashMap<String, Registration>>,
    destroyed: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("keys", &self.lock().keys().cloned().collect::<Vec<_>>())
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// Client with a private cache manager and the process-wide [`Defaults`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_manager(Arc::new(CacheManager::new()), Defaults::global().clone())
    }

    #[must_use]
    pub fn with_manager(manager: Arc<CacheManager>, defaults: Defaults) -> Self {
        let mut environment = Environment::new();
        let destroyed = environment.take_destroyed();
        Self {
            manager,
            environment,
            defaults,
            handles: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(destroyed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Network and window signals shared by every registered query
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.environment
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    #[must_use]
    pub const fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Drop registrations whose handle announced its destruction
    fn purge(&self) {
        let mut keys = Vec::new();
        if let Some(rx) = self
            .destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            while let Ok(key) = rx.try_recv() {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return;
        }
        let mut handles = self.lock();
        for key in keys {
            if handles.get(&key).is_some_and(|entry| entry.lifecycle.is_destroyed()) {
                if let Some(entry) = handles.remove(&key) {
                    debug!("🧹 Unregistered destroyed handle {} ({})", key, entry.id);
                }
            }
        }
    }

    fn existing<H: Clone + 'static>(&self, key: &str) -> Option<Result<H>> {
        let handles = self.lock();
        let entry = handles.get(key).filter(|entry| !entry.lifecycle.is_destroyed())?;
        warn!("⚠️ Store key {} is already registered, returning the live handle", key);
        Some(
            entry
                .downcast::<H>()
                .ok_or_else(|| Error::Custom(format!("store key {key} is registered with another type"))),
        )
    }

    fn insert<H>(&self, key: &str, handle: &H)
    where
        H: Registered + Clone + Any + 'static,
    {
        let registration = Registration::new(handle.clone());
        info!("📋 Registered {} ({})", key, registration.id);
        if let Some(previous) = self.lock().insert(key.to_string(), registration) {
            debug!("Replaced destroyed registration {}", previous.id);
        }
    }

    /// Build and register a query, or return the live one already under this key
    ///
    /// # Errors
    ///
    /// Returns an error if the key is taken by a handle of another type, or
    /// if building the query fails
    pub fn register_query<A, P>(&self, options: QueryOptions<A, P>) -> Result<Query<A, P>>
    where
        A: Structural + Send + Sync + 'static,
        P: Clone + Serialize + Send + Sync + 'static,
    {
        self.purge();
        if let Some(existing) = self.existing::<Query<A, P>>(&options.key) {
            return existing;
        }
        let key = options.key.clone();
        let query = Query::with_defaults(
            options,
            Arc::clone(&self.manager),
            self.environment.notifiers(),
            &self.defaults,
        )?;
        self.insert(&key, &query);
        Ok(query)
    }

    /// Build and register a store, or return the live one already under this key
    ///
    /// # Errors
    ///
    /// Returns an error if the key is taken by a handle of another type, or
    /// if building the store fails
    pub fn register_store<A, P>(&self, options: QueryOptions<A, P>) -> Result<Store<A, P>>
    where
        A: Structural + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        self.purge();
        if let Some(existing) = self.existing::<Store<A, P>>(&options.key) {
            return existing;
        }
        let key = options.key.clone();
        let store = Store::with_defaults(options, Some(self.environment.notifiers()), &self.defaults)?;
        self.insert(&key, &store);
        Ok(store)
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.purge();
        self.lock().get(key).is_some_and(|entry| !entry.lifecycle.is_destroyed())
    }

    #[must_use]
    pub fn get_query<A, P>(&self, key: &str) -> Option<Query<A, P>>
    where
        A: 'static,
        P: 'static,
    {
        self.purge();
        self.lock().get(key)?.downcast()
    }

    #[must_use]
    pub fn get_store<A, P>(&self, key: &str) -> Option<Store<A, P>>
    where
        A: 'static,
        P: 'static,
    {
        self.purge();
        self.lock().get(key)?.downcast()
    }

    /// Destroy and forget the handle under `key`. Returns `false` if none.
    pub fn unregister(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(entry) => {
                entry.lifecycle.destroy();
                info!("🗑️ Unregistered {} ({})", key, entry.id);
                true
            }
            None => false,
        }
    }

    /// Destroy every registered handle
    pub fn clear(&self) {
        let drained: Vec<(String, Registration)> = self.lock().drain().collect();
        for (key, entry) in drained {
            entry.lifecycle.destroy();
            debug!("🗑️ Unregistered {} ({})", key, entry.id);
        }
        self.purge();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.purge();
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
