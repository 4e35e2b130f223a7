/**
Background tasks driving a query

One trigger loop per query collapses bursts of triggers and hands the latest
one to an attempt task, cancelling whichever attempt was running before.
Refetch sources (reconnect, focus, interval) each run in their own loop and
only ever ask the owner for a refetch attempt.
*/
use crate::cache::{QueryError, Snapshot};
use crate::query::options::QueryFn;
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A fetch request queued for execution against the snapshot captured at enqueue time
pub struct Trigger<A, P> {
    pub param: P,
    pub cache: Arc<Snapshot<A, P>>,
    pub refetch: bool,
}

/// Receives the results of attempts
pub trait Settle<A, P>: Send + Sync + 'static {
    /// Apply one outcome if `generation` is still the latest
    fn settle(&self, trigger: &Trigger<A, P>, generation: u64, outcome: Result<A, QueryError>);

    /// Retries are skipped while this holds
    fn is_background(&self) -> bool;
}

/// Switch-to-latest bookkeeping: a generation counter plus the token of the running attempt
#[derive(Debug)]
pub struct Switch {
    shutdown: CancellationToken,
    in_flight: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
}

impl Switch {
    #[must_use]
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Cancel the running attempt and start a new generation
    pub fn begin(&self) -> (u64, CancellationToken) {
        let token = self.shutdown.child_token();
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (generation, token)
    }

    /// Make every running attempt stale without starting a new one
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Everything an attempt needs besides its owner
pub struct Runner<A, P> {
    pub key: String,
    pub query: QueryFn<A, P>,
    pub retry: u32,
    pub retry_delay: Duration,
    pub switch: Arc<Switch>,
    pub runtime: Handle,
}

impl<A, P> Clone for Runner<A, P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            query: self.query.clone(),
            retry: self.retry,
            retry_delay: self.retry_delay,
            switch: Arc::clone(&self.switch),
            runtime: self.runtime.clone(),
        }
    }
}

impl<A, P> Runner<A, P>
where
    A: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Spawn the trigger loop; it ends on shutdown or when every sender is gone
    pub fn spawn<S>(self, owner: Weak<S>, triggers: mpsc::UnboundedReceiver<Trigger<A, P>>)
    where
        S: Settle<A, P>,
    {
        let runtime = self.runtime.clone();
        runtime.spawn(self.run_triggers(owner, triggers));
    }

    async fn run_triggers<S>(self, owner: Weak<S>, mut triggers: mpsc::UnboundedReceiver<Trigger<A, P>>)
    where
        S: Settle<A, P>,
    {
        let shutdown = self.switch.shutdown().clone();
        loop {
            let first = tokio::select! {
                () = shutdown.cancelled() => break,
                next = triggers.recv() => match next {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            // Triggers issued in the same tick collapse to the last one
            tokio::task::yield_now().await;
            let mut latest = first;
            let mut collapsed = 0_usize;
            while let Ok(next) = triggers.try_recv() {
                latest = next;
                collapsed += 1;
            }
            if collapsed > 0 {
                debug!("🔄 DEDUP: {} collapsed {} superseded triggers", self.key, collapsed);
            }
            if shutdown.is_cancelled() {
                break;
            }

            let (generation, cancel) = self.switch.begin();
            let runner = self.clone();
            self.runtime
                .spawn(runner.attempt(owner.clone(), latest, generation, cancel));
        }
        debug!("🛑 Trigger loop for {} shutting down", self.key);
    }

    async fn attempt<S>(self, owner: Weak<S>, trigger: Trigger<A, P>, generation: u64, cancel: CancellationToken)
    where
        S: Settle<A, P>,
    {
        let mut retries_left = self.retry;
        let mut attempt = 1_u32;
        'attempts: loop {
            info!(
                "🔄 FETCH START: {} (attempt {}, refetch: {})",
                self.key, attempt, trigger.refetch
            );
            let mut results = self.query.call(trigger.param.clone());
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("🚫 FETCH CANCELLED: {}", self.key);
                        return;
                    }
                    next = results.next() => next,
                };
                let Some(outcome) = next else {
                    return;
                };
                let Some(owner) = owner.upgrade() else {
                    return;
                };
                match outcome {
                    Ok(data) => {
                        owner.settle(&trigger, generation, Ok(data));
                    }
                    Err(e) if retries_left > 0 && !owner.is_background() => {
                        drop(owner);
                        retries_left -= 1;
                        attempt += 1;
                        warn!(
                            "🔄 FETCH RETRY: {} scheduled in {:.1}s after {:#} ({} retries left)",
                            self.key,
                            self.retry_delay.as_secs_f64(),
                            e,
                            retries_left
                        );
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = sleep(self.retry_delay) => {}
                        }
                        continue 'attempts;
                    }
                    Err(e) => {
                        if retries_left > 0 {
                            warn!("⏸️ Skipping retries for {} in background mode", self.key);
                        }
                        error!("❌ FETCH FAILED: {} after {} attempts - {:#}", self.key, attempt, e);
                        owner.settle(&trigger, generation, Err(QueryError::new(e)));
                        return;
                    }
                }
            }
        }
    }
}

/// What asked for a refetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchSource {
    Reconnect,
    Focus,
    Interval,
    /// A query adopted a group that already holds fetched data
    Remount,
}

impl fmt::Display for RefetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reconnect => "reconnect",
            Self::Focus => "focus",
            Self::Interval => "interval",
            Self::Remount => "remount",
        };
        f.write_str(name)
    }
}

/// Result of a refetch attempt, used to decide when the interval fires next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    Issued,
    Skipped,
    /// Held back by background mode
    Suppressed,
    /// The owner is gone
    Closed,
}

/// Owner of refetch scheduling
pub trait Refetch: Send + Sync + 'static {
    fn refetch_attempt(&self, source: RefetchSource) -> RefetchOutcome;

    /// Interval length after a skipped attempt; `None` stops the interval
    fn interval(&self) -> Option<Duration>;

    fn background_recheck(&self) -> Duration;
}

async fn park(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Fire a refetch attempt once `signal` has held `true` for `min_valid`.
/// Dropping back to `false` cancels the pending attempt.
pub async fn run_signal<R: Refetch>(
    owner: Weak<R>,
    mut signal: watch::Receiver<bool>,
    min_valid: Duration,
    source: RefetchSource,
    token: CancellationToken,
) {
    let _ = signal.borrow_and_update();
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            changed = signal.changed() => {
                if changed.is_err() {
                    break;
                }
                let up = *signal.borrow_and_update();
                deadline = up.then(|| Instant::now() + min_valid);
                debug!("📡 {} signal {}", source, if up { "up" } else { "down" });
            }
            () = park(deadline) => {
                deadline = None;
                let Some(owner) = owner.upgrade() else { break };
                if owner.refetch_attempt(source) == RefetchOutcome::Closed {
                    break;
                }
            }
        }
    }
}

/// Interval source. Every message on `arm` restarts the countdown with the given length.
pub async fn run_interval<R: Refetch>(
    owner: Weak<R>,
    mut arm: mpsc::UnboundedReceiver<Duration>,
    token: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            length = arm.recv() => match length {
                Some(length) => deadline = Some(Instant::now() + length),
                None => break,
            },
            () = park(deadline) => {
                deadline = None;
                let Some(owner) = owner.upgrade() else { break };
                match owner.refetch_attempt(RefetchSource::Interval) {
                    RefetchOutcome::Issued => {}
                    RefetchOutcome::Skipped => {
                        deadline = owner.interval().map(|length| Instant::now() + length);
                    }
                    RefetchOutcome::Suppressed => {
                        deadline = Some(Instant::now() + owner.background_recheck());
                    }
                    RefetchOutcome::Closed => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_generations() {
        let switch = Switch::new(CancellationToken::new());
        let (first, first_token) = switch.begin();
        assert!(switch.is_current(first));

        let (second, second_token) = switch.begin();
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert!(!switch.is_current(first));
        assert!(switch.is_current(second));

        switch.invalidate();
        assert!(second_token.is_cancelled());
        assert!(!switch.is_current(second));
    }

    #[test]
    fn test_shutdown_cancels_attempts() {
        let shutdown = CancellationToken::new();
        let switch = Switch::new(shutdown.clone());
        let (_, token) = switch.begin();
        shutdown.cancel();
        assert!(token.is_cancelled());
    }
}
