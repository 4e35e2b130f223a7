use super::status::{CacheKey, QueryError, Status};
use crate::clock::now_millis;
use crate::equality::Structural;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Callback receiving every distinct status a snapshot publishes
pub type StatusSink<A> = Box<dyn Fn(&Status<A>) + Send + Sync>;

/// Depth used to decide whether a snapshot's status actually changed
const NOTIFY_DEPTH: usize = 2;

struct Listener<A> {
    last: Option<Status<A>>,
    sink: StatusSink<A>,
}

struct SnapshotState<A, P> {
    status: Status<A>,
    latest_param: Option<P>,
    ever_fetched: bool,
    listeners: Vec<Listener<A>>,
    destroyed: bool,
}

/// The status record of one cache key plus its notification channel.
///
/// Listeners are invoked synchronously, in publication order, while the
/// snapshot lock is held. A sink must not call back into the snapshot.
pub struct Snapshot<A, P> {
    key: CacheKey,
    init: Arc<A>,
    state: Mutex<SnapshotState<A, P>>,
}

impl<A, P> Snapshot<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(key: CacheKey, init: Arc<A>) -> Self {
        Self {
            key,
            state: Mutex::new(SnapshotState {
                status: Status::initial(Arc::clone(&init)),
                latest_param: None,
                ever_fetched: false,
                listeners: Vec::new(),
                destroyed: false,
            }),
            init,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotState<A, P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub fn is_same_key(&self, key: &CacheKey) -> bool {
        self.key.is_same(key)
    }

    #[must_use]
    pub fn status(&self) -> Status<A> {
        self.lock().status.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.lock().status.loading
    }

    /// Param of the most recent fetch, `None` until `prepare_fetching` was called
    #[must_use]
    pub fn latest_param(&self) -> Option<P> {
        let state = self.lock();
        if state.ever_fetched {
            state.latest_param.clone()
        } else {
            None
        }
    }

    #[must_use]
    pub fn ever_fetched(&self) -> bool {
        self.lock().ever_fetched
    }

    pub fn prepare_fetching(&self, param: P) {
        let mut state = self.lock();
        state.latest_param = Some(param);
        state.ever_fetched = true;
        state.status.loading = true;
        state.status.error = None;
        Self::emit(&mut state);
    }

    /// Store a successful result. Returns the data now held by the snapshot,
    /// which is the previous allocation when the new value is deep-equal to it.
    pub fn on_success(&self, data: A) -> Arc<A> {
        let mut state = self.lock();
        if !data.deep_eq(&state.status.data) {
            state.status.data = Arc::new(data);
        }
        let now = now_millis();
        state.status.timestamp = now.max(state.status.timestamp + 1);
        state.status.error = None;
        state.status.loading = false;
        state.status.untrusted_data = false;
        Self::emit(&mut state);
        Arc::clone(&state.status.data)
    }

    pub fn on_error(&self, error: QueryError) {
        let mut state = self.lock();
        state.status.error = Some(error);
        state.status.loading = false;
        state.status.untrusted_data = true;
        Self::emit(&mut state);
    }

    /// Apply a local edit. Refused while a fetch is in flight.
    pub fn on_mutate<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&A) -> A,
    {
        let mut state = self.lock();
        if state.status.loading {
            debug!("mutation of {} refused while loading", self.key);
            return false;
        }
        let mutated = mutate(&state.status.data);
        if !mutated.eq_depth(&state.status.data, 1) {
            state.status.data = Arc::new(mutated);
            state.status.untrusted_data = true;
            Self::emit(&mut state);
        }
        true
    }

    /// Flag the data untrusted once `stale_time` has passed since the last
    /// success. Does not notify. Returns the resulting `untrusted_data`.
    pub fn check_stale_time(&self, stale_time: Duration) -> bool {
        let mut state = self.lock();
        let stale_ms = i64::try_from(stale_time.as_millis()).unwrap_or(i64::MAX);
        if state.status.timestamp.saturating_add(stale_ms) < now_millis() {
            state.status.untrusted_data = true;
        }
        state.status.untrusted_data
    }

    /// Back to the initial value, as if never fetched
    pub fn reset(&self) {
        let mut state = self.lock();
        state.status = Status::initial(Arc::clone(&self.init));
        state.latest_param = None;
        state.ever_fetched = false;
        Self::emit(&mut state);
    }

    /// Register a listener; it immediately receives the current status
    pub fn listen(&self, sink: StatusSink<A>) {
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        let current = state.status.clone();
        sink(&current);
        state.listeners.push(Listener {
            last: Some(current),
            sink,
        });
    }

    /// Stop publishing to every current listener
    pub fn un_notify(&self) {
        self.lock().listeners.clear();
    }

    /// Drop listeners and the data reference; the snapshot stays inert afterwards
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.listeners.clear();
        state.status = Status::initial(Arc::clone(&self.init));
        state.latest_param = None;
        state.destroyed = true;
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn emit(state: &mut SnapshotState<A, P>) {
        if state.destroyed {
            return;
        }
        let status = &state.status;
        for listener in &mut state.listeners {
            if listener
                .last
                .as_ref()
                .is_some_and(|last| last.eq_depth(status, NOTIFY_DEPTH))
            {
                continue;
            }
            (listener.sink)(status);
            listener.last = Some(status.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Seen = Arc<Mutex<Vec<Status<Value>>>>;

    fn snapshot(init: Value) -> Snapshot<Value, u32> {
        Snapshot::new(CacheKey::Init, Arc::new(init))
    }

    fn record(snapshot: &Snapshot<Value, u32>) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        snapshot.listen(Box::new(move |status| {
            sink_seen.lock().unwrap().push(status.clone());
        }));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_makes_data_trusted_and_timestamp_increase() {
        let s = snapshot(json!({}));
        s.prepare_fetching(1);
        s.on_success(json!({ "n": 1 }));
        let first = s.status().timestamp;
        assert!(first > 0);
        assert!(!s.status().untrusted_data);

        s.prepare_fetching(1);
        s.on_success(json!({ "n": 2 }));
        assert!(s.status().timestamp > first);
        assert!(!s.status().loading);
    }

    #[test]
    fn test_success_with_equal_data_keeps_allocation() {
        let s = snapshot(json!({ "list": [1, 2] }));
        let before = s.status().data;
        let after = s.on_success(json!({ "list": [1, 2] }));
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_error_keeps_stale_data() {
        let s = snapshot(json!({}));
        let data = s.on_success(json!({ "ok": true }));
        s.prepare_fetching(2);
        s.on_error(QueryError::new(anyhow::anyhow!("offline")));
        let status = s.status();
        assert!(Arc::ptr_eq(&status.data, &data));
        assert!(status.untrusted_data);
        assert!(status.error.is_some());
        assert!(!status.loading);
    }

    #[test]
    fn test_mutate_refused_while_loading_and_silent() {
        let s = snapshot(json!({ "id": 0 }));
        let seen = record(&s);
        s.prepare_fetching(1);
        let emitted = seen.lock().unwrap().len();

        assert!(!s.on_mutate(|_| json!({ "id": 9 })));
        assert_eq!(seen.lock().unwrap().len(), emitted);
        assert_eq!(*s.status().data, json!({ "id": 0 }));
    }

    #[test]
    fn test_mutate_with_equal_value_does_not_emit() {
        let s = snapshot(json!({ "id": 0 }));
        let seen = record(&s);
        assert!(s.on_mutate(|d| d.clone()));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(s.on_mutate(|_| json!({ "id": 1 })));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(s.status().untrusted_data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_stale_time_flags_without_notifying() {
        let s = snapshot(json!(1));
        s.on_success(json!(2));
        let seen = record(&s);

        assert!(!s.check_stale_time(Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(s.check_stale_time(Duration::from_secs(60)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_latest_param_tracks_prepare() {
        let s = snapshot(json!(null));
        assert_eq!(s.latest_param(), None);
        s.prepare_fetching(7);
        assert_eq!(s.latest_param(), Some(7));
        s.reset();
        assert_eq!(s.latest_param(), None);
    }

    #[test]
    fn test_un_notify_and_destroy_stop_publishing() {
        let s = snapshot(json!(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        s.listen(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        s.un_notify();
        s.prepare_fetching(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        s.destroy();
        assert!(s.is_destroyed());
        assert_eq!(s.listener_count(), 0);
        s.listen(Box::new(|_| panic!("destroyed snapshot must not publish")));
    }
}
