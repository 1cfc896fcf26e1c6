use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::trace;

use super::events::{CompletionEvent, CompletionOutcome, CompletionStream, SubscriptionId};
use crate::work::WorkItemId;

pub type CompletionHandler<S, F> = Box<dyn FnOnce(CompletionOutcome<S, F>) + Send>;

struct CorrelationState<S, F> {
    handlers: HashMap<WorkItemId, CompletionHandler<S, F>>,
    /// Completed and failed subscriptions, held only while a handler is pending.
    subscriptions: Option<(SubscriptionId, SubscriptionId)>,
}

/// Ties a work item id to exactly one completion or failure notification.
///
/// The correlator stays subscribed to the underlying stream only while at least one handler is
/// pending. Handlers run outside the internal lock.
pub struct CompletionCorrelator<S, F> {
    this: Weak<Self>,
    stream: Arc<dyn CompletionStream<S, F>>,
    state: Mutex<CorrelationState<S, F>>,
}

impl<S, F> fmt::Debug for CompletionCorrelator<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pending, subscribed) = match self.state.try_lock() {
            Some(state) => (state.handlers.len(), state.subscriptions.is_some()),
            None => (0, false),
        };
        f.debug_struct("CompletionCorrelator")
            .field("pending", &pending)
            .field("subscribed", &subscribed)
            .finish()
    }
}

impl<S, F> CompletionCorrelator<S, F>
where
    S: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    pub fn new(stream: Arc<dyn CompletionStream<S, F>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            stream,
            state: Mutex::new(CorrelationState {
                handlers: HashMap::new(),
                subscriptions: None,
            }),
        })
    }

    /// Registers `handler` for the next outcome of `id`.
    ///
    /// Returns `false` and drops `handler` when `id` already has one pending.
    pub fn register<H>(&self, id: WorkItemId, handler: H) -> bool
    where
        H: FnOnce(CompletionOutcome<S, F>) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.handlers.contains_key(&id) {
            return false;
        }
        state.handlers.insert(id, Box::new(handler));
        if state.subscriptions.is_none() {
            state.subscriptions = Some(self.subscribe());
            trace!(target: "crawl::correlation", "subscribed to completion stream");
        }
        true
    }

    /// Drops the pending handler for `id` without invoking it.
    pub fn unregister(&self, id: WorkItemId) -> bool {
        let mut state = self.state.lock();
        let removed = state.handlers.remove(&id).is_some();
        if removed && state.handlers.is_empty() {
            self.release_subscriptions(&mut state);
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.state.lock().handlers.len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscriptions.is_some()
    }

    /// Routes one outcome to its handler. Outcomes with no pending handler are ignored.
    pub fn dispatch(&self, outcome: CompletionOutcome<S, F>) {
        let handler = {
            let mut state = self.state.lock();
            let handler = state.handlers.remove(&outcome.id());
            if handler.is_some() && state.handlers.is_empty() {
                self.release_subscriptions(&mut state);
            }
            handler
        };

        if let Some(handler) = handler {
            handler(outcome);
        }
    }

    fn subscribe(&self) -> (SubscriptionId, SubscriptionId) {
        let on_completed = {
            let this = self.this.clone();
            Arc::new(move |event: &CompletionEvent<S>| {
                if let Some(correlator) = this.upgrade() {
                    correlator.dispatch(CompletionOutcome::Completed(event.clone()));
                }
            })
        };
        let on_failed = {
            let this = self.this.clone();
            Arc::new(move |event: &CompletionEvent<F>| {
                if let Some(correlator) = this.upgrade() {
                    correlator.dispatch(CompletionOutcome::Failed(event.clone()));
                }
            })
        };
        (
            self.stream.subscribe_completed(on_completed),
            self.stream.subscribe_failed(on_failed),
        )
    }

    fn release_subscriptions(&self, state: &mut CorrelationState<S, F>) {
        if let Some((completed, failed)) = state.subscriptions.take() {
            self.stream.unsubscribe_completed(completed);
            self.stream.unsubscribe_failed(failed);
            trace!(target: "crawl::correlation", "released completion stream subscriptions");
        }
    }
}
