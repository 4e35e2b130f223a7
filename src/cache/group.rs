use super::snapshot::{Snapshot, StatusSink};
use super::status::{CacheKey, Status};
use crate::equality::Structural;
use crate::error::{Error, Result};
use crate::notify::Subject;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Settings applied by [`CacheGroup::connect`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub cache_key: CacheKey,
    /// Withhold never-succeeded, error-free statuses from the outlet
    pub easing: bool,
    /// When set, the connected snapshot is checked for staleness right away
    pub stale_time: Option<Duration>,
    /// Capacity for non-init snapshots; 0 maps every key to the init snapshot
    pub max: usize,
}

struct GroupInner<A, P> {
    queue: VecDeque<Arc<Snapshot<A, P>>>,
    current: Arc<Snapshot<A, P>>,
    max: usize,
    easing: bool,
    outlet: Option<Arc<Subject<Status<A>>>>,
}

/// Bounded set of snapshots for one store key with a "current" pointer.
///
/// The current snapshot's statuses are republished through one outlet that
/// replays its latest value. Switching the current snapshot detaches the
/// previous one from the outlet.
pub struct CacheGroup<A, P> {
    key: String,
    init_state: Arc<A>,
    init: Arc<Snapshot<A, P>>,
    inner: Mutex<GroupInner<A, P>>,
    destroyed: AtomicBool,
}

impl<A, P> CacheGroup<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(key: impl Into<String>, init_state: Arc<A>) -> Self {
        let init = Arc::new(Snapshot::new(CacheKey::Init, Arc::clone(&init_state)));
        Self {
            key: key.into(),
            init_state,
            inner: Mutex::new(GroupInner {
                queue: VecDeque::new(),
                current: Arc::clone(&init),
                max: 0,
                easing: false,
                outlet: None,
            }),
            init,
            destroyed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GroupInner<A, P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the group, failing when it is destroyed or not connected
    fn connected(&self) -> Result<MutexGuard<'_, GroupInner<A, P>>> {
        if self.is_destroyed() {
            return Err(Error::GroupDestroyed(self.key.clone()));
        }
        let inner = self.lock();
        if inner.outlet.is_none() {
            return Err(Error::NotConnected(self.key.clone()));
        }
        Ok(inner)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn init_state(&self) -> Arc<A> {
        Arc::clone(&self.init_state)
    }

    /// (Re)configure the group and point the outlet at the snapshot for `cache_key`.
    ///
    /// Any previous outlet is completed; subscribers must call [`CacheGroup::state`] again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GroupDestroyed`] if the group was destroyed
    pub fn connect(&self, options: ConnectOptions) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::GroupDestroyed(self.key.clone()));
        }
        let mut inner = self.lock();
        inner.max = options.max;
        inner.easing = options.easing;

        let target = self.find_or_create(&mut inner, &options.cache_key);
        // A reused group may hold more keys than the new capacity; the target sits at the back
        let max = inner.max;
        self.evict_beyond(&mut inner, max);
        inner.current.un_notify();
        if let Some(previous) = inner.outlet.take() {
            previous.complete();
        }

        let outlet = Arc::new(Subject::behavior(target.status()));
        inner.outlet = Some(Arc::clone(&outlet));
        inner.current = Arc::clone(&target);
        if let Some(stale_time) = options.stale_time {
            target.check_stale_time(stale_time);
        }
        target.listen(Self::forward(Arc::downgrade(&outlet), inner.easing));
        debug!(
            "🔌 Cache group {} connected to {} (max {}, easing {})",
            self.key, options.cache_key, inner.max, inner.easing
        );
        Ok(())
    }

    /// Find or create the snapshot for `cache_key` and make it current
    ///
    /// # Errors
    ///
    /// Returns an error if the group is destroyed or not connected
    pub fn create_and_switch(&self, cache_key: &CacheKey) -> Result<Arc<Snapshot<A, P>>> {
        let mut inner = self.connected()?;
        let snapshot = self.find_or_create(&mut inner, cache_key);
        Self::swap_with_current(&mut inner, &snapshot);
        Ok(snapshot)
    }

    /// Lookup without switching
    ///
    /// # Errors
    ///
    /// Returns an error if the group is destroyed or not connected
    pub fn get_cache(&self, cache_key: &CacheKey) -> Result<Option<Arc<Snapshot<A, P>>>> {
        let inner = self.connected()?;
        Ok(self.find(&inner, cache_key))
    }

    /// # Errors
    ///
    /// Returns an error if the group is destroyed or not connected
    pub fn current_cache(&self) -> Result<Arc<Snapshot<A, P>>> {
        Ok(Arc::clone(&self.connected()?.current))
    }

    /// Key of the current snapshot, readable while frozen
    #[must_use]
    pub fn current_key(&self) -> CacheKey {
        self.lock().current.key().clone()
    }

    /// Reset the init snapshot, make it current and drop every other snapshot
    ///
    /// # Errors
    ///
    /// Returns an error if the group is destroyed or not connected
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.connected()?;
        self.init.reset();
        let init = Arc::clone(&self.init);
        Self::swap_with_current(&mut inner, &init);
        inner.queue.clear();
        debug!("🔄 Cache group {} reset", self.key);
        Ok(())
    }

    /// Stream of the current snapshot's statuses, replaying the latest one
    ///
    /// # Errors
    ///
    /// Returns an error if the group is destroyed or not connected
    pub fn state(&self) -> Result<UnboundedReceiverStream<Status<A>>> {
        let inner = self.connected()?;
        inner
            .outlet
            .as_ref()
            .map(|outlet| outlet.subscribe())
            .ok_or_else(|| Error::NotConnected(self.key.clone()))
    }

    /// Latest status published through the outlet
    ///
    /// # Errors
    ///
    /// Returns an error if the group is destroyed or not connected
    pub fn value(&self) -> Result<Status<A>> {
        let inner = self.connected()?;
        Ok(inner
            .outlet
            .as_ref()
            .and_then(|outlet| outlet.value())
            .unwrap_or_else(|| inner.current.status()))
    }

    /// Complete the outlet and detach the current snapshot, keeping every snapshot's data
    pub fn freeze(&self) {
        let mut inner = self.lock();
        if let Some(outlet) = inner.outlet.take() {
            outlet.complete();
        }
        inner.current.un_notify();
        debug!("🧊 Cache group {} frozen ({} cached keys)", self.key, inner.queue.len());
    }

    /// Destroy every snapshot and mark the group permanently dead
    pub fn destroy(&self) {
        let mut inner = self.lock();
        if let Some(outlet) = inner.outlet.take() {
            outlet.complete();
        }
        self.init.destroy();
        for snapshot in inner.queue.drain(..) {
            snapshot.destroy();
        }
        inner.current = Arc::clone(&self.init);
        self.destroyed.store(true, Ordering::SeqCst);
        debug!("💥 Cache group {} destroyed", self.key);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.is_destroyed() && self.lock().outlet.is_some()
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.lock().max
    }

    /// Number of non-init snapshots
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    fn find(&self, inner: &GroupInner<A, P>, cache_key: &CacheKey) -> Option<Arc<Snapshot<A, P>>> {
        if cache_key.is_init() || inner.max == 0 {
            return Some(Arc::clone(&self.init));
        }
        inner
            .queue
            .iter()
            .find(|snapshot| snapshot.is_same_key(cache_key))
            .cloned()
    }

    fn find_or_create(&self, inner: &mut GroupInner<A, P>, cache_key: &CacheKey) -> Arc<Snapshot<A, P>> {
        if let Some(found) = self.find(inner, cache_key) {
            // Re-insertion moves the key to the back of the eviction order
            if let Some(index) = inner.queue.iter().position(|s| Arc::ptr_eq(s, &found)) {
                if let Some(moved) = inner.queue.remove(index) {
                    inner.queue.push_back(moved);
                }
            }
            return found;
        }
        let snapshot = Arc::new(Snapshot::new(cache_key.clone(), Arc::clone(&self.init_state)));
        let keep = inner.max.saturating_sub(1);
        self.evict_beyond(inner, keep);
        inner.queue.push_back(Arc::clone(&snapshot));
        snapshot
    }

    /// Drop the oldest-inserted snapshots until at most `keep` remain
    fn evict_beyond(&self, inner: &mut GroupInner<A, P>, keep: usize) {
        while inner.queue.len() > keep {
            let Some(evicted) = inner.queue.pop_front() else {
                break;
            };
            debug!("🗑️ Cache group {} evicted {}", self.key, evicted.key());
        }
    }

    fn swap_with_current(inner: &mut GroupInner<A, P>, snapshot: &Arc<Snapshot<A, P>>) {
        if Arc::ptr_eq(&inner.current, snapshot) {
            return;
        }
        inner.current.un_notify();
        inner.current = Arc::clone(snapshot);
        if let Some(outlet) = inner.outlet.as_ref() {
            snapshot.listen(Self::forward(Arc::downgrade(outlet), inner.easing));
        }
    }

    fn forward(outlet: Weak<Subject<Status<A>>>, easing: bool) -> StatusSink<A> {
        Box::new(move |status: &Status<A>| {
            if easing && status.error.is_none() && !status.has_succeeded() {
                return;
            }
            if let Some(outlet) = outlet.upgrade() {
                outlet.next_unless(status.clone(), |prev| prev.eq_depth(status, 1));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::status::QueryError;
    use futures::{FutureExt, StreamExt};
    use serde_json::{json, Value};

    type Group = CacheGroup<Value, u32>;

    fn group(max: usize) -> Group {
        let group = CacheGroup::new("todos", Arc::new(json!({})));
        group
            .connect(ConnectOptions {
                cache_key: CacheKey::Init,
                easing: false,
                stale_time: None,
                max,
            })
            .unwrap();
        group
    }

    fn key(n: u32) -> CacheKey {
        CacheKey::Value(json!({ "page": n }))
    }

    fn drain<T>(rx: &mut UnboundedReceiverStream<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(Some(item)) = rx.next().now_or_never() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_operations_require_connect() {
        let group: Group = CacheGroup::new("todos", Arc::new(json!({})));
        assert!(matches!(group.create_and_switch(&key(1)), Err(Error::NotConnected(_))));
        assert!(matches!(group.state(), Err(Error::NotConnected(_))));
        assert!(matches!(group.reset(), Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_create_and_switch_reuses_equal_key() {
        let group = group(3);
        let first = group.create_and_switch(&key(1)).unwrap();
        let second = group.create_and_switch(&key(1)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(group.len(), 1);
        assert!(Arc::ptr_eq(&group.current_cache().unwrap(), &first));
    }

    #[test]
    fn test_capacity_evicts_oldest_inserted() {
        let group = group(2);
        let one = group.create_and_switch(&key(1)).unwrap();
        group.create_and_switch(&key(2)).unwrap();
        group.create_and_switch(&key(3)).unwrap();
        assert_eq!(group.len(), 2);
        assert!(group.get_cache(&key(1)).unwrap().is_none());
        let again = group.create_and_switch(&key(1)).unwrap();
        assert!(!Arc::ptr_eq(&one, &again));
        assert!(group.get_cache(&key(2)).unwrap().is_none());
    }

    #[test]
    fn test_reinsertion_refreshes_eviction_order() {
        let group = group(2);
        let one = group.create_and_switch(&key(1)).unwrap();
        group.create_and_switch(&key(2)).unwrap();
        group.create_and_switch(&key(1)).unwrap();
        group.create_and_switch(&key(3)).unwrap();
        assert!(group.get_cache(&key(2)).unwrap().is_none());
        let kept = group.get_cache(&key(1)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&one, &kept));
    }

    #[test]
    fn test_reconnect_with_smaller_capacity_trims_queue() {
        let group = group(5);
        for n in 1..=5 {
            group.create_and_switch(&key(n)).unwrap();
        }
        assert_eq!(group.len(), 5);

        group
            .connect(ConnectOptions {
                cache_key: key(2),
                easing: false,
                stale_time: None,
                max: 2,
            })
            .unwrap();
        assert_eq!(group.max(), 2);
        assert!(group.len() <= group.max());
        assert!(group.current_cache().unwrap().is_same_key(&key(2)));
        assert!(group.get_cache(&key(5)).unwrap().is_some());
        assert!(group.get_cache(&key(1)).unwrap().is_none());

        group.create_and_switch(&key(9)).unwrap();
        assert_eq!(group.len(), 2);
        assert!(group.get_cache(&key(5)).unwrap().is_none());
    }

    #[test]
    fn test_zero_capacity_uses_init_snapshot() {
        let group = group(0);
        let a = group.create_and_switch(&key(1)).unwrap();
        let b = group.create_and_switch(&key(2)).unwrap();
        assert!(a.key().is_init());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_outlet_follows_current_snapshot() {
        let group = group(2);
        let mut rx = group.state().unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        let one = group.create_and_switch(&key(1)).unwrap();
        one.prepare_fetching(1);
        one.on_success(json!({ "page": 1 }));
        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 2);
        assert!(seen[0].loading);
        assert_eq!(*seen[1].data, json!({ "page": 1 }));

        group.create_and_switch(&CacheKey::Init).unwrap();
        one.prepare_fetching(1);
        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].has_succeeded());
    }

    #[tokio::test]
    async fn test_easing_withholds_unfetched_statuses() {
        let group: Group = CacheGroup::new("todos", Arc::new(json!({})));
        group
            .connect(ConnectOptions {
                cache_key: CacheKey::Init,
                easing: true,
                stale_time: None,
                max: 2,
            })
            .unwrap();
        let mut rx = group.state().unwrap();
        drain(&mut rx);

        let snapshot = group.create_and_switch(&key(1)).unwrap();
        snapshot.prepare_fetching(1);
        assert!(drain(&mut rx).is_empty());

        snapshot.on_error(QueryError::new(anyhow::anyhow!("down")));
        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].error.is_some());
    }

    #[tokio::test]
    async fn test_reset_drops_queue_and_switches_to_init() {
        let group = group(2);
        let one = group.create_and_switch(&key(1)).unwrap();
        one.on_success(json!({ "page": 1 }));
        group.reset().unwrap();
        assert!(group.is_empty());
        assert!(group.current_cache().unwrap().key().is_init());
        assert!(!one.is_destroyed());
    }

    #[tokio::test]
    async fn test_freeze_keeps_data_and_destroy_kills_group() {
        let group = group(2);
        let mut rx = group.state().unwrap();
        let one = group.create_and_switch(&key(1)).unwrap();
        one.on_success(json!({ "page": 1 }));

        group.freeze();
        drain(&mut rx);
        assert!(rx.next().await.is_none());
        assert!(!group.is_connected());
        assert!(group.current_key().is_same(&key(1)));
        assert_eq!(*one.status().data, json!({ "page": 1 }));

        group.destroy();
        assert!(group.is_destroyed());
        assert!(one.is_destroyed());
        assert!(matches!(group.state(), Err(Error::GroupDestroyed(_))));
    }
}
