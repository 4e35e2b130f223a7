use super::options::{CachingKey, QueryOptions, ResolvedOptions};
use super::response::{Response, ResponseKind};
use super::scheduler::{
    Refetch, RefetchOutcome, RefetchSource, Runner, Settle, Switch, Trigger, run_interval, run_signal,
};
use crate::cache::config::CACHING_KEY_FIELD;
use crate::cache::{CacheGroup, CacheKey, ConnectOptions, Defaults, QueryError, Status};
use crate::cache_manager::CacheManager;
use crate::clock::now_millis;
use crate::environment::Notifiers;
use crate::equality::Structural;
use crate::error::{Error, Result};
use crate::notify::{Subject, distinct_by_depth};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct RefetchScheduling {
    token: CancellationToken,
    interval: mpsc::UnboundedSender<Duration>,
}

struct QueryShared<A, P> {
    key: String,
    options: ResolvedOptions,
    caching_key: Option<CachingKey<P>>,
    group: Arc<CacheGroup<A, P>>,
    manager: Arc<CacheManager>,
    notifiers: Notifiers,
    runtime: Handle,
    triggers: mpsc::UnboundedSender<Trigger<A, P>>,
    responses: Subject<Response<A, P>>,
    switch: Arc<Switch>,
    refetch: Mutex<Option<RefetchScheduling>>,
    refetch_disabled: AtomicBool,
    destroyed: AtomicBool,
    /// Serializes settles and refetch decisions against `destroy`
    settle_lock: Mutex<()>,
}

impl<A, P> Drop for QueryShared<A, P> {
    fn drop(&mut self) {
        self.switch.shutdown().cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cache key for `param`: an explicit `caching_key` field wins, then the
/// configured mapping, then the whole serialized param. Capacity 0 always
/// maps to the init snapshot.
fn cache_key_for<P: Serialize>(param: &P, caching: usize, caching_key: Option<&CachingKey<P>>) -> Result<CacheKey> {
    if caching == 0 {
        return Ok(CacheKey::Init);
    }
    let value = serde_json::to_value(param)?;
    if let Some(explicit) = value.get(CACHING_KEY_FIELD) {
        return Ok(CacheKey::Value(explicit.clone()));
    }
    let key = match caching_key {
        Some(CachingKey::Field(field)) => value.get(field).cloned().unwrap_or_default(),
        Some(CachingKey::Map(map)) => map(param),
        None => value,
    };
    Ok(CacheKey::Value(key))
}

/// Query orchestrator: one cache group per key, at most one attempt in
/// flight, retries, and refetches driven by reconnect, focus and interval
/// sources.
///
/// Cloning yields another handle to the same query.
pub struct Query<A, P> {
    shared: Arc<QueryShared<A, P>>,
}

impl<A, P> Clone for Query<A, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, P> std::fmt::Debug for Query<A, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.shared.key)
            .field("destroyed", &self.shared.destroyed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<A, P> Query<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Serialize + Send + Sync + 'static,
{
    /// Build a query using the process-wide [`Defaults`]
    ///
    /// # Errors
    ///
    /// Returns an error outside a tokio runtime or if the prefetch param
    /// cannot be serialized into a cache key
    pub fn new(options: QueryOptions<A, P>, manager: Arc<CacheManager>, notifiers: Notifiers) -> Result<Self> {
        Self::with_defaults(options, manager, notifiers, Defaults::global())
    }

    /// # Errors
    ///
    /// Returns an error outside a tokio runtime or if the prefetch param
    /// cannot be serialized into a cache key
    pub fn with_defaults(
        options: QueryOptions<A, P>,
        manager: Arc<CacheManager>,
        notifiers: Notifiers,
        defaults: &Defaults,
    ) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let resolved = options.resolve(defaults);
        let QueryOptions {
            key,
            init_state,
            query,
            caching_key,
            prefetch,
            ..
        } = options;

        let (group, reused) = match manager.get_cache::<A, P>(&key) {
            Some(group) => {
                info!("♻️ Query {} adopting cached group ({} keys)", key, group.len());
                (group, true)
            }
            None => {
                let group = Arc::new(CacheGroup::new(key.clone(), init_state));
                manager.set_cache(key.clone(), Arc::clone(&group));
                (group, false)
            }
        };

        let cache_key = match prefetch.as_ref() {
            Some(param) => cache_key_for(param, resolved.caching, caching_key.as_ref())?,
            None if reused => group.current_key(),
            None => CacheKey::Init,
        };
        group.connect(ConnectOptions {
            cache_key,
            easing: resolved.easing,
            stale_time: Some(resolved.stale_time),
            max: resolved.caching,
        })?;

        let switch = Arc::new(Switch::new(CancellationToken::new()));
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            key: key.clone(),
            query,
            retry: resolved.retry,
            retry_delay: resolved.retry_delay,
            switch: Arc::clone(&switch),
            runtime: runtime.clone(),
        };
        let shared = Arc::new(QueryShared {
            key,
            options: resolved,
            caching_key,
            group,
            manager,
            notifiers,
            runtime,
            triggers,
            responses: Subject::publish(),
            switch,
            refetch: Mutex::new(None),
            refetch_disabled: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            settle_lock: Mutex::new(()),
        });
        runner.spawn(Arc::downgrade(&shared), trigger_rx);
        debug!("🆕 Query {} created", shared.key);

        let query = Self { shared };
        if let Some(param) = prefetch {
            query.fetch(param)?;
        } else if reused && query.shared.group.current_cache()?.ever_fetched() {
            query.shared.set_refetch_strategy(true);
            if query.shared.refetch_attempt(RefetchSource::Remount) != RefetchOutcome::Issued {
                query.shared.arm_default_interval();
            }
        }
        Ok(query)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    #[must_use]
    pub fn options(&self) -> &ResolvedOptions {
        &self.shared.options
    }

    #[must_use]
    pub fn init_data(&self) -> Arc<A> {
        self.shared.group.init_state()
    }

    /// The cache group backing this query
    #[must_use]
    pub fn group(&self) -> Arc<CacheGroup<A, P>> {
        Arc::clone(&self.shared.group)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::QueryDestroyed(self.shared.key.clone()));
        }
        Ok(())
    }

    /// Switch to the cache key of `param`, mark it loading and queue a fetch
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed or `param` cannot be
    /// serialized into a cache key
    pub fn fetch(&self, param: P) -> Result<()> {
        self.ensure_alive()?;
        let shared = &self.shared;
        let cache_key = cache_key_for(&param, shared.options.caching, shared.caching_key.as_ref())?;
        let cache = shared.group.create_and_switch(&cache_key)?;
        shared.set_refetch_strategy(true);
        cache.prepare_fetching(param.clone());
        debug!("📝 SCHEDULED: {} ({})", shared.key, cache_key);
        shared
            .triggers
            .send(Trigger {
                param,
                cache,
                refetch: false,
            })
            .map_err(|_| Error::QueryDestroyed(shared.key.clone()))
    }

    /// Fetch again with the current snapshot's last param, ignoring staleness
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn reload(&self) -> Result<()> {
        self.ensure_alive()?;
        let shared = &self.shared;
        if shared.refetch_disabled.load(Ordering::SeqCst) {
            debug!("⏭️ Reload of {} skipped, refetch disabled", shared.key);
            return Ok(());
        }
        let cache = shared.group.current_cache()?;
        let Some(param) = cache.latest_param() else {
            debug!("⏭️ Reload of {} skipped, never fetched", shared.key);
            return Ok(());
        };
        cache.prepare_fetching(param.clone());
        shared
            .triggers
            .send(Trigger {
                param,
                cache,
                refetch: true,
            })
            .map_err(|_| Error::QueryDestroyed(shared.key.clone()))
    }

    /// Stop refetch scheduling, drop the in-flight attempt and reset the group
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn reset(&self) -> Result<()> {
        self.ensure_alive()?;
        let shared = &self.shared;
        shared.set_refetch_strategy(false);
        shared.switch.invalidate();
        shared.group.reset()?;
        info!("🔄 Query {} reset", shared.key);
        Ok(())
    }

    /// Apply a local edit to the current snapshot. `Ok(false)` while loading.
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn mutate<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&A) -> A,
    {
        self.ensure_alive()?;
        Ok(self.shared.group.current_cache()?.on_mutate(mutate))
    }

    pub fn disable_refetch(&self, disabled: bool) {
        self.shared.refetch_disabled.store(disabled, Ordering::SeqCst);
        debug!("⏯️ Refetch for {} {}", self.shared.key, if disabled { "disabled" } else { "enabled" });
    }

    #[must_use]
    pub fn is_refetch_disabled(&self) -> bool {
        self.shared.refetch_disabled.load(Ordering::SeqCst)
    }

    /// Cancel all background work, end every stream and release the group.
    /// With keep-alive the group is frozen for the next query with this key.
    pub fn destroy(&self) {
        let shared = &self.shared;
        {
            let _guard = lock(&shared.settle_lock);
            if shared.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            shared.switch.shutdown().cancel();
            lock(&shared.refetch).take();
            shared.responses.complete();
        }

        let registered = shared
            .manager
            .get_cache::<A, P>(&shared.key)
            .is_some_and(|group| Arc::ptr_eq(&group, &shared.group));
        match (shared.options.keep_alive, registered) {
            (true, true) => shared.manager.freeze_cache(&shared.key),
            (true, false) => shared.group.freeze(),
            (false, true) => shared.manager.remove_cache(&shared.key),
            (false, false) => shared.group.destroy(),
        }
        shared.notifiers.announce_destroyed(&shared.key);
        info!(
            "💥 Query {} destroyed (keep alive: {})",
            shared.key, shared.options.keep_alive
        );
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Latest status published by the group
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn current_status(&self) -> Result<Status<A>> {
        self.ensure_alive()?;
        self.shared.group.value()
    }

    /// Full status records, de-duplicated at `status_depth`
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn status(&self) -> Result<BoxStream<'static, Status<A>>> {
        self.ensure_alive()?;
        let states = self.shared.group.state()?;
        Ok(distinct_by_depth(states, self.shared.options.status_depth))
    }

    /// Derived values, de-duplicated at `select_depth`
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn select<T, F>(&self, selector: F) -> Result<BoxStream<'static, T>>
    where
        T: Structural + Clone + Send + 'static,
        F: Fn(&A) -> T + Send + 'static,
    {
        self.ensure_alive()?;
        let states = self.shared.group.state()?;
        let selected = states.map(move |status| selector(&status.data));
        Ok(distinct_by_depth(selected, self.shared.options.select_depth))
    }

    /// The data itself, de-duplicated at `select_depth`
    ///
    /// # Errors
    ///
    /// Returns an error if the query was destroyed
    pub fn select_data(&self) -> Result<BoxStream<'static, Arc<A>>> {
        self.ensure_alive()?;
        let states = self.shared.group.state()?;
        let data = states.map(|status| status.data);
        Ok(distinct_by_depth(data, self.shared.options.select_depth))
    }

    /// One event per settle, refetches included
    #[must_use]
    pub fn response(&self) -> BoxStream<'static, Response<A, P>> {
        self.shared.responses.subscribe().boxed()
    }
}

impl<A, P> QueryShared<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Serialize + Send + Sync + 'static,
{
    /// Start or stop the reconnect, focus and interval sources
    fn set_refetch_strategy(self: &Arc<Self>, enabled: bool) {
        let mut slot = lock(&self.refetch);
        if enabled == slot.is_some() {
            return;
        }
        if !enabled {
            if let Some(scheduling) = slot.take() {
                scheduling.token.cancel();
                debug!("⏹️ Refetch scheduling stopped for {}", self.key);
            }
            return;
        }

        let token = self.switch.shutdown().child_token();
        let (interval, arm) = mpsc::unbounded_channel();
        let owner = Arc::downgrade(self);
        if self.options.refetch_on_reconnect {
            self.runtime.spawn(run_signal(
                owner.clone(),
                self.notifiers.online.clone(),
                self.options.min_valid_reconnect_time,
                RefetchSource::Reconnect,
                token.clone(),
            ));
        }
        if self.options.refetch_on_emerge {
            self.runtime.spawn(run_signal(
                owner.clone(),
                self.notifiers.window_active.clone(),
                self.options.min_valid_focus_time,
                RefetchSource::Focus,
                token.clone(),
            ));
        }
        self.runtime.spawn(run_interval(owner, arm, token.clone()));
        *slot = Some(RefetchScheduling { token, interval });
        debug!("⏱️ Refetch scheduling started for {}", self.key);
    }

    fn arm_interval(&self, length: Duration) {
        if let Some(scheduling) = lock(&self.refetch).as_ref() {
            let _ = scheduling.interval.send(length);
        }
    }

    fn arm_default_interval(&self) {
        if let Some(length) = self.options.refetch_interval {
            self.arm_interval(length);
        }
    }
}

impl<A, P> Settle<A, P> for QueryShared<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Serialize + Send + Sync + 'static,
{
    fn settle(&self, trigger: &Trigger<A, P>, generation: u64, outcome: std::result::Result<A, QueryError>) {
        let _guard = lock(&self.settle_lock);
        if self.destroyed.load(Ordering::SeqCst) || !self.switch.is_current(generation) {
            debug!("🚫 Discarding superseded result for {}", self.key);
            return;
        }
        let kind = match outcome {
            Ok(data) => {
                let data = trigger.cache.on_success(data);
                info!("✅ FETCH SUCCESS: {} ({})", self.key, trigger.cache.key());
                ResponseKind::Success(data)
            }
            Err(error) => {
                trigger.cache.on_error(error.clone());
                ResponseKind::Error(error)
            }
        };
        self.responses.next(Response {
            kind,
            param: trigger.param.clone(),
            refetch: trigger.refetch,
        });
        self.arm_default_interval();
    }

    fn is_background(&self) -> bool {
        self.notifiers.is_background()
    }
}

impl<A, P> Refetch for QueryShared<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Serialize + Send + Sync + 'static,
{
    fn refetch_attempt(&self, source: RefetchSource) -> RefetchOutcome {
        let _guard = lock(&self.settle_lock);
        if self.destroyed.load(Ordering::SeqCst) {
            return RefetchOutcome::Closed;
        }
        if self.refetch_disabled.load(Ordering::SeqCst) {
            debug!("⏭️ REFETCH SKIPPED ({}): {} has refetch disabled", source, self.key);
            return RefetchOutcome::Skipped;
        }
        if self.notifiers.is_background() && !self.options.refetch_on_background {
            debug!("⏸️ REFETCH SUPPRESSED ({}): {} in background mode", source, self.key);
            return RefetchOutcome::Suppressed;
        }
        let Ok(cache) = self.group.current_cache() else {
            return RefetchOutcome::Skipped;
        };
        // A kept-alive snapshot can still be marked loading by an attempt its previous owner abandoned
        if cache.is_loading() && source != RefetchSource::Remount {
            return RefetchOutcome::Skipped;
        }
        let Some(param) = cache.latest_param() else {
            return RefetchOutcome::Skipped;
        };

        let stale_time = self.options.stale_time;
        let untrusted = cache.check_stale_time(stale_time);
        let status = cache.status();
        let stale_ms = i64::try_from(stale_time.as_millis()).unwrap_or(i64::MAX);
        let stale = !status.has_succeeded() || now_millis().saturating_sub(status.timestamp) >= stale_ms;
        if !untrusted && !stale {
            debug!("🎯 REFETCH SKIPPED ({}): {} is fresh", source, self.key);
            return RefetchOutcome::Skipped;
        }

        cache.prepare_fetching(param.clone());
        info!("🔁 REFETCH ({}): {}", source, self.key);
        let sent = self.triggers.send(Trigger {
            param,
            cache,
            refetch: true,
        });
        if sent.is_err() {
            return RefetchOutcome::Closed;
        }
        RefetchOutcome::Issued
    }

    fn interval(&self) -> Option<Duration> {
        self.options.refetch_interval
    }

    fn background_recheck(&self) -> Duration {
        self.options.background_recheck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Clone)]
    struct Page {
        page: u32,
        filter: String,
    }

    #[derive(Serialize, Clone)]
    struct Explicit {
        caching_key: &'static str,
        page: u32,
    }

    #[derive(Serialize, Clone)]
    struct Filtered {
        filter: Page,
    }

    #[test]
    fn test_nested_params_need_a_flat_caching_key() {
        let param = || Filtered { filter: Page { page: 1, filter: "open".into() } };
        let first = cache_key_for(&param(), 5, None).unwrap();
        let second = cache_key_for(&param(), 5, None).unwrap();
        assert!(!first.is_same(&second));

        let by_page = CachingKey::map(|p: &Filtered| json!(p.filter.page));
        let first = cache_key_for(&param(), 5, Some(&by_page)).unwrap();
        let second = cache_key_for(&param(), 5, Some(&by_page)).unwrap();
        assert!(first.is_same(&second));
    }

    #[test]
    fn test_zero_capacity_maps_to_init() {
        let key = cache_key_for(&Page { page: 1, filter: "a".into() }, 0, None).unwrap();
        assert!(key.is_init());
    }

    #[test]
    fn test_cache_key_precedence() {
        let page = Page { page: 2, filter: "open".into() };
        let raw = cache_key_for(&page, 5, None).unwrap();
        assert!(raw.is_same(&json!({ "page": 2, "filter": "open" }).into()));

        let field = CachingKey::Field("page".to_string());
        let mapped = cache_key_for(&page, 5, Some(&field)).unwrap();
        assert!(mapped.is_same(&json!(2).into()));

        let map = CachingKey::map(|p: &Page| json!(p.filter));
        let mapped = cache_key_for(&page, 5, Some(&map)).unwrap();
        assert!(mapped.is_same(&json!("open").into()));

        let explicit = Explicit { caching_key: "fixed", page: 3 };
        let key = cache_key_for(&explicit, 5, Some(&CachingKey::Field("page".into()))).unwrap();
        assert!(key.is_same(&json!("fixed").into()));
    }
}
