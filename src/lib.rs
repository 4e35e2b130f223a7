/**
Client-side query cache

A query owns a group of keyed snapshots, runs at most one fetch at a time
(latest wins), retries failures, and refetches stale data when the network
comes back, the window regains focus, or an interval elapses.
*/
pub mod cache;
pub mod cache_manager;
pub mod client;
pub mod clock;
pub mod environment;
pub mod equality;
pub mod error;
pub mod notify;
pub mod query;
pub mod store;

pub use cache::{CacheGroup, CacheKey, Defaults, QueryError, Snapshot, Status};
pub use cache_manager::CacheManager;
pub use client::QueryClient;
pub use environment::{Environment, Notifiers};
pub use equality::{Structural, deep_equal, shallow_equal_depth};
pub use error::{Error, Result};
pub use query::{
    CachingKey, Fetcher, Query, QueryFn, QueryOptions, RefetchSource, Response, ResponseKind, StoreHandle,
};
pub use store::Store;
