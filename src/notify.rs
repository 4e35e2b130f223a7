/**
Fan-out notification channels.

`Subject` keeps a list of unbounded senders, one per subscriber, so every
published value reaches every subscriber in publication order. A behavior
subject additionally replays its latest value to new subscribers.
*/
use crate::equality::Structural;
use futures::stream::{BoxStream, Stream, StreamExt};
use pin_project::pin_project;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug)]
pub struct Subject<T> {
    state: Mutex<SubjectState<T>>,
}

#[derive(Debug)]
struct SubjectState<T> {
    value: Option<T>,
    replay: bool,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    completed: bool,
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Subject that replays `initial` (and later the latest value) on subscribe
    #[must_use]
    pub fn behavior(initial: T) -> Self {
        Self {
            state: Mutex::new(SubjectState {
                value: Some(initial),
                replay: true,
                subscribers: Vec::new(),
                completed: false,
            }),
        }
    }

    /// Subject that only delivers values published after subscribing
    #[must_use]
    pub fn publish() -> Self {
        Self {
            state: Mutex::new(SubjectState {
                value: None,
                replay: false,
                subscribers: Vec::new(),
                completed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubjectState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a value. Returns `false` once the subject is completed.
    pub fn next(&self, value: T) -> bool {
        self.next_unless(value, |_| false)
    }

    /// Publish `value` unless `same(latest)` says it is already the latest value.
    /// Returns `true` when the value was published.
    pub fn next_unless<F>(&self, value: T, same: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let mut state = self.lock();
        if state.completed {
            return false;
        }
        if state.value.as_ref().is_some_and(same) {
            return false;
        }
        state
            .subscribers
            .retain(|tx| tx.send(value.clone()).is_ok());
        if state.replay {
            state.value = Some(value);
        }
        true
    }

    /// Latest value of a behavior subject
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// Subscribe; a completed subject yields an already-finished stream
    pub fn subscribe(&self) -> UnboundedReceiverStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.completed {
            if let Some(value) = state.value.as_ref() {
                let _ = tx.send(value.clone());
            }
            state.subscribers.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    /// End every subscriber stream; later publications are ignored
    pub fn complete(&self) {
        let mut state = self.lock();
        state.completed = true;
        state.subscribers.clear();
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

/// Drops items that the comparator considers equal to the previously yielded one
#[pin_project]
pub struct DistinctUntilChanged<S: Stream, F> {
    #[pin]
    inner: S,
    same: F,
    last: Option<S::Item>,
}

impl<S, F> DistinctUntilChanged<S, F>
where
    S: Stream,
    S::Item: Clone,
    F: FnMut(&S::Item, &S::Item) -> bool,
{
    pub fn new(inner: S, same: F) -> Self {
        Self {
            inner,
            same,
            last: None,
        }
    }
}

impl<S, F> Stream for DistinctUntilChanged<S, F>
where
    S: Stream,
    S::Item: Clone,
    F: FnMut(&S::Item, &S::Item) -> bool,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if this.last.as_ref().is_some_and(|prev| (this.same)(prev, &item)) {
                        continue;
                    }
                    *this.last = Some(item.clone());
                    return Poll::Ready(Some(item));
                }
                other => return other,
            }
        }
    }
}

/// Drop items equal to their predecessor at `depth`
pub fn distinct_by_depth<S>(stream: S, depth: usize) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Structural + Clone + Send + 'static,
{
    DistinctUntilChanged::new(stream, move |a: &S::Item, b: &S::Item| a.eq_depth(b, depth)).boxed()
}
