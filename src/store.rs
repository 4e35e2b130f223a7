/**
One-shot store

Same snapshot and notification machinery as a query, with a single slot,
no per-key caching and no refetch scheduling.
*/
use crate::cache::{CacheGroup, CacheKey, ConnectOptions, Defaults, QueryError, Status};
use crate::environment::Notifiers;
use crate::equality::Structural;
use crate::error::{Error, Result};
use crate::notify::{Subject, distinct_by_depth};
use crate::query::StoreHandle;
use crate::query::options::{QueryOptions, ResolvedOptions};
use crate::query::response::{Response, ResponseKind};
use crate::query::scheduler::{Runner, Settle, Switch, Trigger};
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct StoreShared<A, P> {
    key: String,
    options: ResolvedOptions,
    group: CacheGroup<A, P>,
    notifiers: Option<Notifiers>,
    triggers: mpsc::UnboundedSender<Trigger<A, P>>,
    responses: Subject<Response<A, P>>,
    switch: Arc<Switch>,
    destroyed: AtomicBool,
    settle_lock: Mutex<()>,
}

impl<A, P> Drop for StoreShared<A, P> {
    fn drop(&mut self) {
        self.switch.shutdown().cancel();
    }
}

impl<A, P> Settle<A, P> for StoreShared<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn settle(&self, trigger: &Trigger<A, P>, generation: u64, outcome: std::result::Result<A, QueryError>) {
        let _guard = self.settle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.destroyed.load(Ordering::SeqCst) || !self.switch.is_current(generation) {
            return;
        }
        let kind = match outcome {
            Ok(data) => ResponseKind::Success(trigger.cache.on_success(data)),
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
    }

    fn is_background(&self) -> bool {
        false
    }
}

/// Single-slot store with switch-to-latest fetching and retries
pub struct Store<A, P> {
    shared: Arc<StoreShared<A, P>>,
}

impl<A, P> Clone for Store<A, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, P> Store<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Build a store using the process-wide [`Defaults`]. Only `key`,
    /// `init_state`, `query`, `retry`, `retry_delay`, `prefetch` and the
    /// stream depths apply.
    ///
    /// # Errors
    ///
    /// Returns an error outside a tokio runtime
    pub fn new(options: QueryOptions<A, P>, notifiers: Option<Notifiers>) -> Result<Self> {
        Self::with_defaults(options, notifiers, Defaults::global())
    }

    /// # Errors
    ///
    /// Returns an error outside a tokio runtime
    pub fn with_defaults(options: QueryOptions<A, P>, notifiers: Option<Notifiers>, defaults: &Defaults) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let resolved = options.resolve(defaults);
        let QueryOptions {
            key,
            init_state,
            query,
            prefetch,
            ..
        } = options;

        let group = CacheGroup::new(key.clone(), init_state);
        group.connect(ConnectOptions {
            cache_key: CacheKey::Init,
            easing: false,
            stale_time: None,
            max: 0,
        })?;

        let switch = Arc::new(Switch::new(CancellationToken::new()));
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let runner = Runner {
            key: key.clone(),
            query,
            retry: resolved.retry,
            retry_delay: resolved.retry_delay,
            switch: Arc::clone(&switch),
            runtime,
        };
        let shared = Arc::new(StoreShared {
            key,
            options: resolved,
            group,
            notifiers,
            triggers,
            responses: Subject::publish(),
            switch,
            destroyed: AtomicBool::new(false),
            settle_lock: Mutex::new(()),
        });
        runner.spawn(Arc::downgrade(&shared), trigger_rx);
        debug!("🆕 Store {} created", shared.key);

        let store = Self { shared };
        if let Some(param) = prefetch {
            store.fetch(param)?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    #[must_use]
    pub fn init_data(&self) -> Arc<A> {
        self.shared.group.init_state()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::QueryDestroyed(self.shared.key.clone()));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the store was destroyed
    pub fn fetch(&self, param: P) -> Result<()> {
        self.ensure_alive()?;
        let cache = self.shared.group.current_cache()?;
        cache.prepare_fetching(param.clone());
        self.shared
            .triggers
            .send(Trigger {
                param,
                cache,
                refetch: false,
            })
            .map_err(|_| Error::QueryDestroyed(self.shared.key.clone()))
    }

    /// Drop the in-flight attempt and return to the initial value
    ///
    /// # Errors
    ///
    /// Returns an error if the store was destroyed
    pub fn reset(&self) -> Result<()> {
        self.ensure_alive()?;
        self.shared.switch.invalidate();
        self.shared.group.reset()
    }

    /// # Errors
    ///
    /// Returns an error if the store was destroyed
    pub fn mutate<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&A) -> A,
    {
        self.ensure_alive()?;
        Ok(self.shared.group.current_cache()?.on_mutate(mutate))
    }

    pub fn destroy(&self) {
        let shared = &self.shared;
        {
            let _guard = shared.settle_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            shared.switch.shutdown().cancel();
            shared.responses.complete();
        }
        shared.group.destroy();
        if let Some(notifiers) = shared.notifiers.as_ref() {
            notifiers.announce_destroyed(&shared.key);
        }
        info!("💥 Store {} destroyed", shared.key);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// # Errors
    ///
    /// Returns an error if the store was destroyed
    pub fn current_status(&self) -> Result<Status<A>> {
        self.ensure_alive()?;
        self.shared.group.value()
    }

    /// # Errors
    ///
    /// Returns an error if the store was destroyed
    pub fn status(&self) -> Result<BoxStream<'static, Status<A>>> {
        self.ensure_alive()?;
        let states = self.shared.group.state()?;
        Ok(distinct_by_depth(states, self.shared.options.status_depth))
    }

    /// # Errors
    ///
    /// Returns an error if the store was destroyed
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

    /// # Errors
    ///
    /// Returns an error if the store was destroyed
    pub fn select_data(&self) -> Result<BoxStream<'static, Arc<A>>> {
        self.ensure_alive()?;
        let states = self.shared.group.state()?;
        let data = states.map(|status| status.data);
        Ok(distinct_by_depth(data, self.shared.options.select_depth))
    }

    #[must_use]
    pub fn response(&self) -> BoxStream<'static, Response<A, P>> {
        self.shared.responses.subscribe().boxed()
    }
}

impl<A, P> StoreHandle<A, P> for Store<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        Self::key(self)
    }

    fn fetch(&self, param: P) -> Result<()> {
        Self::fetch(self, param)
    }

    fn reload(&self) -> Result<()> {
        Err(Error::Unsupported("reload is not supported by stores"))
    }

    fn reset(&self) -> Result<()> {
        Self::reset(self)
    }

    fn mutate(&self, mutate: &dyn Fn(&A) -> A) -> Result<bool> {
        Self::mutate(self, mutate)
    }

    fn disable_refetch(&self, _disabled: bool) -> Result<()> {
        Err(Error::Unsupported("disable_refetch is not supported by stores"))
    }

    fn destroy(&self) {
        Self::destroy(self);
    }

    fn is_destroyed(&self) -> bool {
        Self::is_destroyed(self)
    }

    fn status(&self) -> Result<BoxStream<'static, Status<A>>> {
        Self::status(self)
    }

    fn select_data(&self) -> Result<BoxStream<'static, Arc<A>>> {
        Self::select_data(self)
    }

    fn response(&self) -> BoxStream<'static, Response<A, P>> {
        Self::response(self)
    }

    fn init_data(&self) -> Arc<A> {
        Self::init_data(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryFn;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(fail_first: usize) -> (QueryFn<Value, u32>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let query = QueryFn::from_async(move |n: u32| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < fail_first {
                    anyhow::bail!("attempt {call} failed");
                }
                Ok(json!({ "n": n }))
            }
        });
        (query, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_fetch_with_retry() {
        let (query, calls) = counting(1);
        let options = QueryOptions::new("store", json!({}), query)
            .with_retry(1)
            .with_retry_delay(Duration::from_secs(1));
        let store = Store::with_defaults(options, None, &Defaults::default()).unwrap();
        let mut responses = store.response();

        store.fetch(7).unwrap();
        let response = responses.next().await.unwrap();
        assert!(response.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*store.current_status().unwrap().data, json!({ "n": 7 }));
    }

    #[tokio::test]
    async fn test_store_rejects_refetch_controls() {
        let (query, _) = counting(0);
        let store = Store::with_defaults(QueryOptions::new("store", json!({}), query), None, &Defaults::default()).unwrap();
        let handle: &dyn StoreHandle<Value, u32> = &store;
        assert!(matches!(handle.reload(), Err(Error::Unsupported(_))));
        assert!(matches!(handle.disable_refetch(true), Err(Error::Unsupported(_))));

        store.destroy();
        assert!(matches!(store.fetch(1), Err(Error::QueryDestroyed(_))));
    }
}
