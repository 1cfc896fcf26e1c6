//! Bounded task-queue worker shared by every pipeline stage.
//!
//! One background loop per worker pulls items from the stage's inbound queue and hands each one to
//! an independent task. An admission semaphore caps in-flight tasks; a second, initially empty
//! semaphore acts as the pause gate.

use std::{
    any::{Any, type_name},
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::{Semaphore, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    config::WorkerConfig,
    events::{CompletionEvent, CompletionNotifier},
};
use crate::{
    error::{CrawlError, Result},
    queue::InboundQueue,
    store::{KeyValueStore, get_json, put_json},
    work::{ComponentStatus, NodeInfo, QueuedResult, RunState, WorkItem, WorkItemId},
};

/// Stage-specific logic wrapped by [`TaskQueueWorker`].
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    type Item: WorkItem + Serialize;
    type Success: Clone + Send + Sync + 'static;
    type Failure: Clone + Send + Sync + 'static;

    /// Processes one item. `cancel` fires when the worker is cancelled or the item times out.
    async fn process(
        &self,
        item: &Self::Item,
        cancel: CancellationToken,
    ) -> Result<QueuedResult<Self::Success, Self::Failure>>;
}

/// Store key under which a `Waiting` item is parked.
pub fn parked_key(id: WorkItemId) -> String {
    format!("parked/{id}")
}

/// Removes and decodes a parked item so it can be re-submitted.
pub async fn take_parked<T>(store: &dyn KeyValueStore, id: WorkItemId) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    let key = parked_key(id);
    let parked = get_json::<T>(store, &key).await?;
    if parked.is_some() {
        store.remove(&key).await?;
    }
    Ok(parked)
}

enum Lifecycle {
    NotStarted,
    Started {
        cancel: CancellationToken,
        handle: Option<JoinHandle<Result<()>>>,
    },
}

struct WorkerInner<P: RequestProcessor> {
    node: NodeInfo,
    processor: Arc<P>,
    inbound: Arc<dyn InboundQueue<P::Item>>,
    notifier: Arc<dyn CompletionNotifier<P::Success, P::Failure>>,
    store: Arc<dyn KeyValueStore>,
    max_concurrent_items: usize,
    item_timeout: Duration,
    waiting_ttl: Option<Duration>,
    admission: Arc<Semaphore>,
    active: AtomicUsize,
    paused: AtomicBool,
    pause_gate: Semaphore,
    status: watch::Sender<ComponentStatus>,
}

/// Generic stage worker: `NotStarted -> Running <-> Paused -> Completed | Cancelled`.
pub struct TaskQueueWorker<P: RequestProcessor> {
    inner: Arc<WorkerInner<P>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<P: RequestProcessor> fmt::Debug for TaskQueueWorker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.inner.status.borrow();
        f.debug_struct("TaskQueueWorker")
            .field("node", &self.inner.node)
            .field("processor", &type_name::<P>())
            .field("max_concurrent_items", &self.inner.max_concurrent_items)
            .field("item_timeout", &self.inner.item_timeout)
            .field("paused", &self.inner.paused.load(Ordering::Acquire))
            .field("status", &status)
            .finish()
    }
}

impl<P: RequestProcessor> TaskQueueWorker<P> {
    pub fn new(
        node: NodeInfo,
        config: WorkerConfig,
        processor: Arc<P>,
        inbound: Arc<dyn InboundQueue<P::Item>>,
        notifier: Arc<dyn CompletionNotifier<P::Success, P::Failure>>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let max = config.max_concurrent_items.max(1);
        let (status, _) = watch::channel(ComponentStatus::idle(node.stage, max));
        Self {
            inner: Arc::new(WorkerInner {
                node,
                processor,
                inbound,
                notifier,
                store,
                max_concurrent_items: max,
                item_timeout: config.item_timeout(),
                waiting_ttl: None,
                admission: Arc::new(Semaphore::new(max)),
                active: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                pause_gate: Semaphore::new(0),
                status,
            }),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    /// TTL applied to parked `Waiting` items. Ignored once the worker has been started.
    pub fn with_waiting_ttl(mut self, ttl: Option<Duration>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.waiting_ttl = ttl,
            None => warn!(target: "crawl::worker", "waiting ttl ignored on a started worker"),
        }
        self
    }

    pub fn node(&self) -> &NodeInfo {
        &self.inner.node
    }

    /// Latest published status; updated after every processed item and on state changes.
    pub fn status(&self) -> watch::Receiver<ComponentStatus> {
        self.inner.status.subscribe()
    }

    pub fn run_state(&self) -> RunState {
        self.inner.status.borrow().run_state
    }

    /// Per-item tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Spawns the background loop. `initial` must be `Running` or `Paused`.
    pub fn start(&self, initial: RunState, cancel: CancellationToken) -> Result<()> {
        if !matches!(initial, RunState::Running | RunState::Paused) {
            return Err(CrawlError::InvalidState(format!(
                "worker cannot start in state {initial}"
            )));
        }

        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::NotStarted) {
            return Err(CrawlError::InvalidState(format!(
                "{} worker already started",
                self.inner.node.stage
            )));
        }

        self.inner
            .paused
            .store(initial == RunState::Paused, Ordering::Release);
        self.inner.set_run_state(initial);

        let inner = Arc::clone(&self.inner);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { inner.run(loop_cancel).await });
        *lifecycle = Lifecycle::Started {
            cancel,
            handle: Some(handle),
        };

        info!(
            target: "crawl::worker",
            node = %self.inner.node.node_id,
            stage = %self.inner.node.stage,
            max_concurrent_items = self.inner.max_concurrent_items,
            initial = %initial,
            "worker started"
        );
        Ok(())
    }

    /// Stops dequeuing after the current gate acquisition. In-flight items keep running.
    pub fn pause(&self) -> Result<()> {
        self.ensure_started("pause")?;
        self.inner.paused.store(true, Ordering::Release);
        debug!(target: "crawl::worker", stage = %self.inner.node.stage, "pause requested");
        Ok(())
    }

    /// Clears the pause flag and releases one pause-gate permit.
    pub fn resume(&self) -> Result<()> {
        self.ensure_started("resume")?;
        self.inner.paused.store(false, Ordering::Release);
        self.inner.pause_gate.add_permits(1);
        debug!(target: "crawl::worker", stage = %self.inner.node.stage, "resume requested");
        Ok(())
    }

    /// Cancels the token handed to `start`.
    pub fn cancel(&self) -> Result<()> {
        match &*self.lifecycle.lock() {
            Lifecycle::NotStarted => Err(CrawlError::InvalidState(
                "cannot cancel a worker that was never started".into(),
            )),
            Lifecycle::Started { cancel, .. } => {
                cancel.cancel();
                Ok(())
            }
        }
    }

    /// Waits for the background loop to exit and re-raises how it ended.
    ///
    /// `Ok` means the inbound queue closed and every in-flight item finished. Cancellation is
    /// reported as [`CrawlError::Cancelled`].
    pub async fn wait_until_completed(&self) -> Result<()> {
        let handle = match &mut *self.lifecycle.lock() {
            Lifecycle::NotStarted => {
                return Err(CrawlError::InvalidState(
                    "cannot wait on a worker that was never started".into(),
                ));
            }
            Lifecycle::Started { handle, .. } => handle.take(),
        };

        let Some(handle) = handle else {
            return match self.run_state() {
                RunState::Completed => Ok(()),
                RunState::Cancelled => Err(CrawlError::Cancelled(format!(
                    "{} worker loop",
                    self.inner.node.stage
                ))),
                state => Err(CrawlError::InvalidState(format!(
                    "worker loop already awaited (state {state})"
                ))),
            };
        };

        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                self.inner.set_run_state(RunState::Faulted);
                Err(CrawlError::ProcessingFault(format!(
                    "{} worker loop aborted: {join_err}",
                    self.inner.node.stage
                )))
            }
        }
    }

    fn ensure_started(&self, action: &str) -> Result<()> {
        match &*self.lifecycle.lock() {
            Lifecycle::NotStarted => Err(CrawlError::InvalidState(format!(
                "cannot {action} a worker that was never started"
            ))),
            Lifecycle::Started { .. } => Ok(()),
        }
    }
}

enum LoopExit {
    Completed,
    Cancelled,
}

impl<P: RequestProcessor> WorkerInner<P> {
    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let exit = self.pump(&cancel).await;

        // Wait for in-flight items; they observe `cancel` through their child tokens.
        let drained = self
            .admission
            .acquire_many(self.max_concurrent_items as u32)
            .await;
        drop(drained);

        match exit {
            Ok(LoopExit::Completed) => {
                self.set_run_state(RunState::Completed);
                info!(target: "crawl::worker", stage = %self.node.stage, "inbound queue closed; worker completed");
                Ok(())
            }
            Ok(LoopExit::Cancelled) => {
                self.set_run_state(RunState::Cancelled);
                info!(target: "crawl::worker", stage = %self.node.stage, "worker cancelled");
                Err(CrawlError::Cancelled(format!("{} worker loop", self.node.stage)))
            }
            Err(err) => {
                self.set_run_state(RunState::Faulted);
                error!(target: "crawl::worker", stage = %self.node.stage, error = %err, "worker loop faulted");
                Err(err)
            }
        }
    }

    async fn pump(self: &Arc<Self>, cancel: &CancellationToken) -> Result<LoopExit> {
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(LoopExit::Cancelled),
                permit = Arc::clone(&self.admission).acquire_owned() => permit.map_err(|_| {
                    CrawlError::InvalidState("admission gate closed".into())
                })?,
            };

            // A paused iteration keeps its admission slot.
            while self.paused.load(Ordering::Acquire) {
                self.set_run_state(RunState::Paused);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(LoopExit::Cancelled),
                    gate = self.pause_gate.acquire() => match gate {
                        Ok(gate) => gate.forget(),
                        Err(_) => return Err(CrawlError::InvalidState("pause gate closed".into())),
                    },
                }
            }
            self.set_run_state(RunState::Running);

            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }

            let item = match self.inbound.dequeue(cancel).await {
                Ok(item) => item,
                Err(CrawlError::Cancelled(_)) => return Ok(LoopExit::Cancelled),
                Err(CrawlError::QueueClosed(_)) => return Ok(LoopExit::Completed),
                Err(err) => return Err(err),
            };

            let worker = Arc::clone(self);
            let item_cancel = cancel.child_token();
            self.active.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                let id = item.id();
                let outcome = AssertUnwindSafe(worker.handle_item(item, item_cancel))
                    .catch_unwind()
                    .await;
                if let Err(panic) = outcome {
                    error!(
                        target: "crawl::worker",
                        stage = %worker.node.stage,
                        item = %id,
                        panic = %panic_message(panic.as_ref()),
                        "item processing panicked"
                    );
                }
                worker.active.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
                worker.publish_item_status();
            });
        }
    }

    async fn handle_item(&self, item: P::Item, cancel: CancellationToken) {
        let id = item.id();
        let trace_id = item.trace_id();
        trace!(target: "crawl::worker", stage = %self.node.stage, item = %id, trace_id = ?trace_id, "processing item");

        let processed = tokio::time::timeout(
            self.item_timeout,
            self.processor.process(&item, cancel.clone()),
        )
        .await;

        let result = match processed {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(CrawlError::Timeout(format!(
                    "item {id} exceeded {:?}",
                    self.item_timeout
                )))
            }
        };

        match result {
            Ok(QueuedResult::Success(payload)) => {
                let event = CompletionEvent::new(id, self.node.clone(), payload);
                if let Err(err) = self.notifier.notify_completed(event).await {
                    error!(target: "crawl::worker", item = %id, error = %err, "failed to publish completion");
                }
            }
            Ok(QueuedResult::Failed(payload)) => {
                let event = CompletionEvent::new(id, self.node.clone(), payload);
                if let Err(err) = self.notifier.notify_failed(event).await {
                    error!(target: "crawl::worker", item = %id, error = %err, "failed to publish failure");
                }
            }
            Ok(QueuedResult::Waiting) => {
                match put_json(
                    self.store.as_ref(),
                    &parked_key(id),
                    &item,
                    self.waiting_ttl,
                )
                .await
                {
                    Ok(()) => {
                        debug!(target: "crawl::worker", stage = %self.node.stage, item = %id, "item parked until resumed");
                    }
                    Err(err) => {
                        error!(target: "crawl::worker", item = %id, error = %err, "failed to park waiting item");
                    }
                }
            }
            Err(err) if err.is_cancelled() => {
                info!(target: "crawl::worker", stage = %self.node.stage, item = %id, "item processing cancelled");
            }
            Err(err) => {
                error!(
                    target: "crawl::worker",
                    stage = %self.node.stage,
                    item = %id,
                    error = %err,
                    "item processing fault"
                );
            }
        }
    }

    fn set_run_state(&self, run_state: RunState) {
        self.status.send_if_modified(|status| {
            if status.run_state == run_state {
                return false;
            }
            status.run_state = run_state;
            true
        });
    }

    fn publish_item_status(&self) {
        let in_use = self.active.load(Ordering::Acquire);
        let queue_depth = self.inbound.len();
        self.status.send_modify(|status| {
            status.queue_depth = queue_depth;
            status.tasks_in_use = in_use;
        });
        let snapshot = *self.status.borrow();
        trace!(
            target: "crawl::worker",
            stage = %snapshot.stage,
            queue_depth = snapshot.queue_depth,
            tasks_in_use = snapshot.tasks_in_use,
            max_concurrency = snapshot.max_concurrency,
            run_state = %snapshot.run_state,
            "component status"
        );
        if snapshot.tasks_in_use > snapshot.max_concurrency {
            error!(
                target: "crawl::invariant",
                stage = %snapshot.stage,
                tasks_in_use = snapshot.tasks_in_use,
                "tasks in use exceed admission gate size"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::sync::broadcast;

    use super::*;
    use crate::{
        clock::SystemClock,
        orchestration::events::{CompletionOutcome, InProcCompletionBus},
        queue::MemoryQueue,
        store::MemoryStore,
        work::StageKind,
    };

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    enum Behaviour {
        Succeed,
        Fail,
        Wait,
        Panic,
        Stall,
        Sleep(u64),
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Job {
        id: WorkItemId,
        behaviour: Behaviour,
    }

    impl Job {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                id: WorkItemId::new(),
                behaviour,
            }
        }
    }

    impl WorkItem for Job {
        fn id(&self) -> WorkItemId {
            self.id
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedProcessor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
        saw_cancel: AtomicBool,
    }

    #[async_trait]
    impl RequestProcessor for ScriptedProcessor {
        type Item = Job;
        type Success = String;
        type Failure = String;

        async fn process(
            &self,
            item: &Job,
            cancel: CancellationToken,
        ) -> Result<QueuedResult<String, String>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = match &item.behaviour {
                Behaviour::Succeed => Ok(QueuedResult::Success("ok".into())),
                Behaviour::Fail => Ok(QueuedResult::Failed("nope".into())),
                Behaviour::Wait => Ok(QueuedResult::Waiting),
                Behaviour::Panic => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    panic!("processor exploded");
                }
                Behaviour::Stall => {
                    cancel.cancelled().await;
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    Err(CrawlError::Cancelled("stalled item".into()))
                }
                Behaviour::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(QueuedResult::Success("slept".into()))
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Harness {
        worker: TaskQueueWorker<ScriptedProcessor>,
        processor: Arc<ScriptedProcessor>,
        queue: Arc<MemoryQueue<Job>>,
        store: Arc<MemoryStore>,
        outcomes: broadcast::Receiver<CompletionOutcome<String, String>>,
    }

    fn harness(max_concurrent_items: usize, item_timeout_ms: u64) -> Harness {
        let processor = Arc::new(ScriptedProcessor::default());
        let queue = Arc::new(MemoryQueue::new("jobs"));
        let bus = Arc::new(InProcCompletionBus::new(64));
        let store = Arc::new(MemoryStore::new(SystemClock::shared()));
        let outcomes = bus.subscribe_outcomes();
        let worker = TaskQueueWorker::new(
            NodeInfo::local(StageKind::Ingest),
            WorkerConfig {
                max_concurrent_items,
                item_timeout_ms,
            },
            Arc::clone(&processor),
            queue.clone(),
            bus,
            store.clone(),
        );
        Harness {
            worker,
            processor,
            queue,
            store,
            outcomes,
        }
    }

    #[tokio::test]
    async fn lifecycle_misuse_raises_invalid_state() {
        let h = harness(1, 1_000);
        assert!(matches!(h.worker.pause(), Err(CrawlError::InvalidState(_))));
        assert!(matches!(h.worker.resume(), Err(CrawlError::InvalidState(_))));
        assert!(matches!(
            h.worker.start(RunState::Completed, CancellationToken::new()),
            Err(CrawlError::InvalidState(_))
        ));

        let cancel = CancellationToken::new();
        h.worker.start(RunState::Running, cancel.clone()).unwrap();
        assert!(matches!(
            h.worker.start(RunState::Running, cancel.clone()),
            Err(CrawlError::InvalidState(_))
        ));
        h.worker.pause().unwrap();
        h.worker.resume().unwrap();

        cancel.cancel();
        assert!(h.worker.wait_until_completed().await.unwrap_err().is_cancelled());
        assert_eq!(h.worker.run_state(), RunState::Cancelled);
    }

    #[tokio::test]
    async fn routes_each_outcome_and_completes_when_queue_closes() {
        let mut h = harness(2, 1_000);
        let succeed = Job::new(Behaviour::Succeed);
        let fail = Job::new(Behaviour::Fail);
        let wait = Job::new(Behaviour::Wait);
        for job in [&succeed, &fail, &wait] {
            h.queue.push(job.clone()).unwrap();
        }
        h.queue.close();

        h.worker
            .start(RunState::Running, CancellationToken::new())
            .unwrap();
        h.worker.wait_until_completed().await.unwrap();
        assert_eq!(h.worker.run_state(), RunState::Completed);

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        while let Ok(outcome) = h.outcomes.try_recv() {
            match outcome {
                CompletionOutcome::Completed(event) => completed.push(event.id),
                CompletionOutcome::Failed(event) => failed.push(event.id),
            }
        }
        assert_eq!(completed, vec![succeed.id]);
        assert_eq!(failed, vec![fail.id]);

        let parked: Option<Job> = take_parked(h.store.as_ref(), wait.id).await.unwrap();
        assert_eq!(parked, Some(wait.clone()));
        let again: Option<Job> = take_parked(h.store.as_ref(), wait.id).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_items_never_exceed_admission_gate() {
        let h = harness(3, 10_000);
        for _ in 0..10 {
            h.queue.push(Job::new(Behaviour::Sleep(20))).unwrap();
        }
        h.queue.close();

        let mut status = h.worker.status();
        h.worker
            .start(RunState::Running, CancellationToken::new())
            .unwrap();
        h.worker.wait_until_completed().await.unwrap();

        assert_eq!(h.processor.started.load(Ordering::SeqCst), 10);
        assert_eq!(h.processor.peak.load(Ordering::SeqCst), 3);
        let last = *status.borrow_and_update();
        assert!(last.tasks_in_use <= last.max_concurrency);
        assert_eq!(last.max_concurrency, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_dequeue_without_cancelling_in_flight_work() {
        let mut h = harness(2, 10_000);
        let cancel = CancellationToken::new();
        h.worker.start(RunState::Running, cancel.clone()).unwrap();

        h.queue.push(Job::new(Behaviour::Sleep(50))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.processor.started.load(Ordering::SeqCst), 1);

        h.worker.pause().unwrap();
        // The loop is parked in dequeue; this item wakes it and is processed, the next one is not.
        h.queue.push(Job::new(Behaviour::Succeed)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.queue.push(Job::new(Behaviour::Succeed)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.worker.run_state(), RunState::Paused);
        assert_eq!(h.processor.started.load(Ordering::SeqCst), 2);
        assert_eq!(h.queue.len(), 1);
        // The slow item was allowed to finish while paused.
        let mut finished = 0;
        while h.outcomes.try_recv().is_ok() {
            finished += 1;
        }
        assert_eq!(finished, 2);

        h.worker.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.processor.started.load(Ordering::SeqCst), 3);
        assert!(h.queue.is_empty());

        cancel.cancel();
        assert!(h.worker.wait_until_completed().await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_while_paused_exits_without_dequeuing() {
        let h = harness(1, 1_000);
        h.queue.push(Job::new(Behaviour::Succeed)).unwrap();
        let cancel = CancellationToken::new();
        h.worker.start(RunState::Paused, cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.worker.run_state(), RunState::Paused);
        cancel.cancel();

        assert!(h.worker.wait_until_completed().await.unwrap_err().is_cancelled());
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.processor.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn faults_and_timeouts_fire_no_notification() {
        let mut h = harness(1, 30);
        h.queue.push(Job::new(Behaviour::Panic)).unwrap();
        h.queue.push(Job::new(Behaviour::Stall)).unwrap();
        let survivor = Job::new(Behaviour::Succeed);
        h.queue.push(survivor.clone()).unwrap();
        h.queue.close();

        h.worker
            .start(RunState::Running, CancellationToken::new())
            .unwrap();
        h.worker.wait_until_completed().await.unwrap();

        assert_eq!(h.processor.started.load(Ordering::SeqCst), 3);
        let outcome = h.outcomes.try_recv().unwrap();
        assert_eq!(outcome.id(), survivor.id);
        assert!(h.outcomes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_processing_is_contained_and_drained() {
        let mut h = harness(1, 60_000);
        let stalled = Job::new(Behaviour::Stall);
        h.queue.push(stalled.clone()).unwrap();
        let cancel = CancellationToken::new();
        h.worker.start(RunState::Running, cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.processor.started.load(Ordering::SeqCst), 1);
        assert_eq!(h.worker.in_flight(), 1);
        assert!(!h.processor.saw_cancel.load(Ordering::SeqCst));

        cancel.cancel();
        assert!(h.worker.wait_until_completed().await.unwrap_err().is_cancelled());

        // The loop only reports back once the stalled item gave its slot up.
        assert!(h.processor.saw_cancel.load(Ordering::SeqCst));
        assert_eq!(h.worker.in_flight(), 0);
        assert_eq!(h.processor.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(h.worker.run_state(), RunState::Cancelled);
        assert_eq!(h.worker.status().borrow().tasks_in_use, 0);
        assert!(h.outcomes.try_recv().is_err());
        let parked: Option<Job> = take_parked(h.store.as_ref(), stalled.id).await.unwrap();
        assert!(parked.is_none());
    }
}
