//! Completion notifications emitted by stage workers.
//!
//! Observers attach to explicit registries whose add/remove calls report success, so a consumer
//! can hold a subscription only as long as it needs one. The in-process bus additionally fans out
//! every outcome on a broadcast channel for passive monitoring.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    error::Result,
    work::{NodeInfo, WorkItemId},
};

/// Handle returned by a subscribe call; pass it back to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Set of observers for one event type.
pub struct ObserverRegistry<E> {
    next_id: AtomicU64,
    observers: Mutex<HashMap<SubscriptionId, Observer<E>>>,
}

impl<E> fmt::Debug for ObserverRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl<E> Default for ObserverRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ObserverRegistry<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, observer: Observer<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().insert(id, observer);
        id
    }

    /// Returns `false` when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every observer registered at the time of the call and returns how many ran.
    ///
    /// Observers run outside the registry lock, so they may subscribe or unsubscribe freely.
    pub fn fire(&self, event: &E) -> usize {
        let snapshot: Vec<Observer<E>> = self.observers.lock().values().cloned().collect();
        for observer in &snapshot {
            observer(event);
        }
        snapshot.len()
    }
}

/// Notification that a stage finished one work item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent<P> {
    pub id: WorkItemId,
    pub node: NodeInfo,
    pub payload: P,
}

impl<P> CompletionEvent<P> {
    pub fn new(id: WorkItemId, node: NodeInfo, payload: P) -> Self {
        Self { id, node, payload }
    }
}

/// Either side of a completion, as delivered to one-shot handlers and the broadcast tap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionOutcome<S, F> {
    Completed(CompletionEvent<S>),
    Failed(CompletionEvent<F>),
}

impl<S, F> CompletionOutcome<S, F> {
    pub fn id(&self) -> WorkItemId {
        match self {
            CompletionOutcome::Completed(event) => event.id,
            CompletionOutcome::Failed(event) => event.id,
        }
    }

    pub fn node(&self) -> &NodeInfo {
        match self {
            CompletionOutcome::Completed(event) => &event.node,
            CompletionOutcome::Failed(event) => &event.node,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, CompletionOutcome::Completed(_))
    }
}

/// Subscription side of a stage's completion channels.
pub trait CompletionStream<S, F>: Send + Sync {
    fn subscribe_completed(&self, observer: Observer<CompletionEvent<S>>) -> SubscriptionId;

    fn unsubscribe_completed(&self, id: SubscriptionId) -> bool;

    fn subscribe_failed(&self, observer: Observer<CompletionEvent<F>>) -> SubscriptionId;

    fn unsubscribe_failed(&self, id: SubscriptionId) -> bool;
}

/// Publishing side used by workers. Broker-backed adapters may fail, hence the `Result`.
#[async_trait]
pub trait CompletionNotifier<S, F>: Send + Sync
where
    S: Send + 'static,
    F: Send + 'static,
{
    async fn notify_completed(&self, event: CompletionEvent<S>) -> Result<()>;

    async fn notify_failed(&self, event: CompletionEvent<F>) -> Result<()>;
}

/// Completion bus for stages hosted by the current process.
pub struct InProcCompletionBus<S, F> {
    completed: ObserverRegistry<CompletionEvent<S>>,
    failed: ObserverRegistry<CompletionEvent<F>>,
    tap: broadcast::Sender<CompletionOutcome<S, F>>,
    tap_capacity: usize,
}

impl<S, F> fmt::Debug for InProcCompletionBus<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcCompletionBus")
            .field("completed_observers", &self.completed.len())
            .field("failed_observers", &self.failed.len())
            .field("tap_capacity", &self.tap_capacity)
            .field("tap_subscribers", &self.tap.receiver_count())
            .finish()
    }
}

impl<S, F> InProcCompletionBus<S, F>
where
    S: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    pub fn new(tap_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(tap_capacity.max(1));
        Self {
            completed: ObserverRegistry::new(),
            failed: ObserverRegistry::new(),
            tap,
            tap_capacity,
        }
    }

    /// Passive feed of every outcome. Slow receivers lag rather than block the bus.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<CompletionOutcome<S, F>> {
        self.tap.subscribe()
    }

    pub fn completed_observers(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_observers(&self) -> usize {
        self.failed.len()
    }
}

impl<S, F> CompletionStream<S, F> for InProcCompletionBus<S, F>
where
    S: Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    fn subscribe_completed(&self, observer: Observer<CompletionEvent<S>>) -> SubscriptionId {
        self.completed.subscribe(observer)
    }

    fn unsubscribe_completed(&self, id: SubscriptionId) -> bool {
        self.completed.unsubscribe(id)
    }

    fn subscribe_failed(&self, observer: Observer<CompletionEvent<F>>) -> SubscriptionId {
        self.failed.subscribe(observer)
    }

    fn unsubscribe_failed(&self, id: SubscriptionId) -> bool {
        self.failed.unsubscribe(id)
    }
}

#[async_trait]
impl<S, F> CompletionNotifier<S, F> for InProcCompletionBus<S, F>
where
    S: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    async fn notify_completed(&self, event: CompletionEvent<S>) -> Result<()> {
        self.completed.fire(&event);
        let _ = self.tap.send(CompletionOutcome::Completed(event));
        Ok(())
    }

    async fn notify_failed(&self, event: CompletionEvent<F>) -> Result<()> {
        self.failed.fire(&event);
        let _ = self.tap.send(CompletionOutcome::Failed(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::work::StageKind;

    fn event<P>(payload: P) -> CompletionEvent<P> {
        CompletionEvent::new(
            WorkItemId::new(),
            NodeInfo::local(StageKind::Ingest),
            payload,
        )
    }

    #[test]
    fn unsubscribe_reports_whether_observer_existed() {
        let registry: ObserverRegistry<u32> = ObserverRegistry::new();
        let id = registry.subscribe(Arc::new(|_| {}));
        assert_eq!(registry.len(), 1);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn observers_may_unsubscribe_themselves_while_firing() {
        let registry: Arc<ObserverRegistry<u32>> = Arc::new(ObserverRegistry::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let id = {
            let registry_ref = Arc::downgrade(&registry);
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            registry.subscribe(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let (Some(registry), Some(id)) = (registry_ref.upgrade(), *slot.lock()) {
                    registry.unsubscribe(id);
                }
            }))
        };
        *slot.lock() = Some(id);

        assert_eq!(registry.fire(&1), 1);
        assert_eq!(registry.fire(&2), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bus_routes_completed_and_failed_separately() {
        let bus: InProcCompletionBus<&'static str, u16> = InProcCompletionBus::new(8);
        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        {
            let completed = Arc::clone(&completed);
            bus.subscribe_completed(Arc::new(move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let failed = Arc::clone(&failed);
            bus.subscribe_failed(Arc::new(move |_| {
                failed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut tap = bus.subscribe_outcomes();

        bus.notify_completed(event("ok")).await.unwrap();
        bus.notify_failed(event(500)).await.unwrap();
        bus.notify_failed(event(404)).await.unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 2);
        assert!(tap.recv().await.unwrap().is_completed());
        assert!(!tap.recv().await.unwrap().is_completed());
    }
}
