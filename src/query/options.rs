use crate::cache::config::{DEFAULT_SELECT_DEPTH, DEFAULT_STATUS_DEPTH, Defaults};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Items produced by one invocation of a query function
pub type QueryStream<A> = BoxStream<'static, anyhow::Result<A>>;

/// Source of query results as a trait object alternative to closures
#[async_trait]
pub trait Fetcher<P: Send + 'static>: Send + Sync {
    type Output: Send + 'static;

    async fn fetch(&self, param: P) -> anyhow::Result<Self::Output>;
}

/// The side-effecting query. Every item of the returned stream is one
/// result; single-shot sources yield exactly one item.
pub struct QueryFn<A, P>(Arc<dyn Fn(P) -> QueryStream<A> + Send + Sync>);

impl<A, P> Clone for QueryFn<A, P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<A, P> fmt::Debug for QueryFn<A, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueryFn")
    }
}

impl<A, P> QueryFn<A, P>
where
    A: Send + 'static,
    P: Send + 'static,
{
    /// Wrap an async function resolving to a single result
    pub fn from_async<F, Fut>(query: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<A>> + Send + 'static,
    {
        Self(Arc::new(move |param| query(param).into_stream().boxed()))
    }

    /// Wrap an ongoing source; each item counts as a fresh success
    pub fn from_stream<F, S>(query: F) -> Self
    where
        F: Fn(P) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<A>> + Send + 'static,
    {
        Self(Arc::new(move |param| query(param).boxed()))
    }

    pub fn from_fetcher<T>(fetcher: Arc<T>) -> Self
    where
        T: Fetcher<P, Output = A> + 'static,
    {
        Self::from_async(move |param| {
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch(param).await }
        })
    }

    #[must_use]
    pub fn call(&self, param: P) -> QueryStream<A> {
        (self.0)(param)
    }
}

/// How a param maps onto its cache key
pub enum CachingKey<P> {
    /// Use this field of the serialized param
    Field(String),
    Map(Arc<dyn Fn(&P) -> serde_json::Value + Send + Sync>),
}

impl<P> Clone for CachingKey<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Field(field) => Self::Field(field.clone()),
            Self::Map(map) => Self::Map(Arc::clone(map)),
        }
    }
}

impl<P> fmt::Debug for CachingKey<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => f.debug_tuple("Field").field(field).finish(),
            Self::Map(_) => f.write_str("Map"),
        }
    }
}

impl<P> CachingKey<P> {
    pub fn map<F>(map: F) -> Self
    where
        F: Fn(&P) -> serde_json::Value + Send + Sync + 'static,
    {
        Self::Map(Arc::new(map))
    }
}

/// Options recognized by queries and stores. Unset values fall back to [`Defaults`].
pub struct QueryOptions<A, P> {
    pub key: String,
    pub init_state: Arc<A>,
    pub query: QueryFn<A, P>,
    pub retry: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub stale_time: Option<Duration>,
    /// Number of cache keys kept besides the initial one
    pub caching: Option<usize>,
    pub keep_alive: bool,
    pub easing: bool,
    /// How a param becomes a cache key. Without it the whole serialized param
    /// is the key, compared one level deep, so params holding nested objects
    /// never match an earlier snapshot. Use [`CachingKey::Field`] or
    /// [`CachingKey::map`] to key such params by a flat value.
    pub caching_key: Option<CachingKey<P>>,
    pub refetch_on_reconnect: bool,
    pub refetch_on_emerge: bool,
    pub refetch_on_background: bool,
    /// `Some(Duration::ZERO)` turns the interval source off
    pub refetch_interval: Option<Duration>,
    pub min_valid_reconnect_time: Option<Duration>,
    pub min_valid_focus_time: Option<Duration>,
    pub prefetch: Option<P>,
    pub select_depth: usize,
    pub status_depth: usize,
}

impl<A, P: Clone> Clone for QueryOptions<A, P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            init_state: Arc::clone(&self.init_state),
            query: self.query.clone(),
            caching_key: self.caching_key.clone(),
            prefetch: self.prefetch.clone(),
            ..*self
        }
    }
}

impl<A, P> fmt::Debug for QueryOptions<A, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("retry", &self.retry)
            .field("caching", &self.caching)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl<A, P> QueryOptions<A, P> {
    pub fn new(key: impl Into<String>, init_state: A, query: QueryFn<A, P>) -> Self {
        Self {
            key: key.into(),
            init_state: Arc::new(init_state),
            query,
            retry: None,
            retry_delay: None,
            stale_time: None,
            caching: None,
            keep_alive: false,
            easing: false,
            caching_key: None,
            refetch_on_reconnect: true,
            refetch_on_emerge: true,
            refetch_on_background: false,
            refetch_interval: None,
            min_valid_reconnect_time: None,
            min_valid_focus_time: None,
            prefetch: None,
            select_depth: DEFAULT_SELECT_DEPTH,
            status_depth: DEFAULT_STATUS_DEPTH,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn with_caching(mut self, caching: usize) -> Self {
        self.caching = Some(caching);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_easing(mut self, easing: bool) -> Self {
        self.easing = easing;
        self
    }

    #[must_use]
    pub fn with_caching_key(mut self, caching_key: CachingKey<P>) -> Self {
        self.caching_key = Some(caching_key);
        self
    }

    #[must_use]
    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_refetch_on_emerge(mut self, enabled: bool) -> Self {
        self.refetch_on_emerge = enabled;
        self
    }

    #[must_use]
    pub fn with_refetch_on_background(mut self, enabled: bool) -> Self {
        self.refetch_on_background = enabled;
        self
    }

    #[must_use]
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_min_valid_reconnect_time(mut self, time: Duration) -> Self {
        self.min_valid_reconnect_time = Some(time);
        self
    }

    #[must_use]
    pub fn with_min_valid_focus_time(mut self, time: Duration) -> Self {
        self.min_valid_focus_time = Some(time);
        self
    }

    #[must_use]
    pub fn with_prefetch(mut self, param: P) -> Self {
        self.prefetch = Some(param);
        self
    }

    #[must_use]
    pub fn with_select_depth(mut self, depth: usize) -> Self {
        self.select_depth = depth;
        self
    }

    #[must_use]
    pub fn with_status_depth(mut self, depth: usize) -> Self {
        self.status_depth = depth;
        self
    }

    /// Fill every unset option from `defaults`
    #[must_use]
    pub fn resolve(&self, defaults: &Defaults) -> ResolvedOptions {
        let stale_time = self.stale_time.unwrap_or(defaults.stale_time);
        let refetch_interval = match self.refetch_interval {
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval.max(defaults.min_refetch_interval)),
            None => Some(stale_time.max(defaults.min_refetch_interval)),
        };
        ResolvedOptions {
            retry: self.retry.unwrap_or(defaults.retry),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            stale_time,
            caching: self
                .caching
                .unwrap_or(defaults.caching)
                .min(defaults.max_caching),
            keep_alive: self.keep_alive,
            easing: self.easing,
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_on_emerge: self.refetch_on_emerge,
            refetch_on_background: self.refetch_on_background,
            refetch_interval,
            min_valid_reconnect_time: self
                .min_valid_reconnect_time
                .unwrap_or(defaults.min_valid_reconnect_time),
            min_valid_focus_time: self
                .min_valid_focus_time
                .unwrap_or(defaults.min_valid_focus_time),
            background_recheck: defaults.background_recheck,
            select_depth: self.select_depth,
            status_depth: self.status_depth,
        }
    }
}

/// Options with every default applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub retry: u32,
    pub retry_delay: Duration,
    pub stale_time: Duration,
    pub caching: usize,
    pub keep_alive: bool,
    pub easing: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_on_emerge: bool,
    pub refetch_on_background: bool,
    /// `None` when the interval source is off
    pub refetch_interval: Option<Duration>,
    pub min_valid_reconnect_time: Duration,
    pub min_valid_focus_time: Duration,
    pub background_recheck: Duration,
    pub select_depth: usize,
    pub status_depth: usize,
}
