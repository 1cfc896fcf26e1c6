use std::{any::type_name, collections::HashSet, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{SharedClock, SystemClock},
    error::{CrawlError, Result},
    orchestration::{
        config::CrawlerConfig,
        correlation::CompletionCorrelator,
        domain::{DomainSuffixParser, SuffixListParser},
        events::{CompletionOutcome, CompletionStream, InProcCompletionBus},
        ingest_scheduler::DomainIngestScheduler,
        schedule_processor::{RobotsRules, ScheduleRequestProcessor, robots_key},
        worker::{RequestProcessor, TaskQueueWorker, take_parked},
    },
    queue::MemoryQueue,
    store::{KeyValueStore, MemoryStore, put_json},
    work::{
        ComponentStatus, CrawlRequest, IngestReport, IngestRequest, NodeInfo, RobotsRequest,
        RunState, ScheduleOutcome, StageFailure, StageKind, WorkItemId,
    },
};

/// Fetch logic plugged into the ingest stage.
pub trait IngestProcessor:
    RequestProcessor<Item = IngestRequest, Success = IngestReport, Failure = StageFailure>
{
}

impl<T> IngestProcessor for T where
    T: RequestProcessor<Item = IngestRequest, Success = IngestReport, Failure = StageFailure>
{
}

type ScheduleBus = InProcCompletionBus<ScheduleOutcome, StageFailure>;
type IngestBus = InProcCompletionBus<IngestReport, StageFailure>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Wires the schedule and ingest stages of one process together.
///
/// The schedule worker feeds the per-domain ingest scheduler, which releases URIs into the ingest
/// queue and learns about finished fetches from the ingest completion bus. Robots lookups are
/// emitted on [`CrawlRuntime::robots_requests`] for an external robots stage.
pub struct CrawlRuntime<P: IngestProcessor> {
    config: CrawlerConfig,
    store: Arc<dyn KeyValueStore>,
    schedule_queue: Arc<MemoryQueue<CrawlRequest>>,
    ingest_queue: Arc<MemoryQueue<IngestRequest>>,
    robots_queue: Arc<MemoryQueue<RobotsRequest>>,
    schedule_bus: Arc<ScheduleBus>,
    ingest_bus: Arc<IngestBus>,
    ingest_scheduler: Arc<DomainIngestScheduler>,
    schedule_worker: TaskQueueWorker<ScheduleRequestProcessor>,
    ingest_worker: TaskQueueWorker<P>,
    /// Ingest items seen without a completion on the previous reclaim pass.
    stalled: Mutex<HashSet<WorkItemId>>,
    shutdown_token: CancellationToken,
}

impl<P: IngestProcessor> fmt::Debug for CrawlRuntime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlRuntime")
            .field("ingest_processor", &type_name::<P>())
            .field("store", &self.store)
            .field("schedule_queue", &self.schedule_queue)
            .field("ingest_queue", &self.ingest_queue)
            .field("robots_queue", &self.robots_queue)
            .field("ingest_scheduler", &self.ingest_scheduler)
            .field("schedule_worker", &self.schedule_worker)
            .field("ingest_worker", &self.ingest_worker)
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<P: IngestProcessor> CrawlRuntime<P> {
    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn ingest_scheduler(&self) -> Arc<DomainIngestScheduler> {
        Arc::clone(&self.ingest_scheduler)
    }

    /// Side requests for the robots stage. Consume these and answer with
    /// [`CrawlRuntime::store_robots_rules`] followed by [`CrawlRuntime::resume_parked`].
    pub fn robots_requests(&self) -> Arc<MemoryQueue<RobotsRequest>> {
        Arc::clone(&self.robots_queue)
    }

    pub fn schedule_outcomes(
        &self,
    ) -> broadcast::Receiver<CompletionOutcome<ScheduleOutcome, StageFailure>> {
        self.schedule_bus.subscribe_outcomes()
    }

    pub fn ingest_outcomes(
        &self,
    ) -> broadcast::Receiver<CompletionOutcome<IngestReport, StageFailure>> {
        self.ingest_bus.subscribe_outcomes()
    }

    pub fn schedule_status(&self) -> watch::Receiver<ComponentStatus> {
        self.schedule_worker.status()
    }

    pub fn ingest_status(&self) -> watch::Receiver<ComponentStatus> {
        self.ingest_worker.status()
    }

    /// Starts both stage workers.
    pub fn start(&self) -> Result<()> {
        self.schedule_worker
            .start(RunState::Running, self.shutdown_token.child_token())?;
        self.ingest_worker
            .start(RunState::Running, self.shutdown_token.child_token())?;
        info!(
            target: "crawl::runtime",
            schedule_concurrency = self.config.scheduler_stage.max_concurrent_items,
            ingest_concurrency = self.config.ingest_stage.max_concurrent_items,
            min_crawl_delay_ms = self.config.throttle.min_crawl_delay_ms,
            "crawl runtime started"
        );
        Ok(())
    }

    /// Queues a request for the schedule stage.
    pub fn submit(&self, request: CrawlRequest) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(CrawlError::Disposed("crawl runtime".into()));
        }
        debug!(target: "crawl::runtime", request = %request.id, uri = %request.uri, depth = request.depth, "request submitted");
        self.schedule_queue.push(request)
    }

    pub fn pause(&self) -> Result<()> {
        self.schedule_worker.pause()?;
        self.ingest_worker.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.schedule_worker.resume()?;
        self.ingest_worker.resume()
    }

    /// Caches robots rules for `host`.
    pub async fn store_robots_rules(&self, host: &str, rules: &RobotsRules) -> Result<()> {
        let key = robots_key(&self.config.scheduler.robots_cache_prefix, host);
        put_json(self.store.as_ref(), &key, rules, None).await
    }

    /// Re-submits a schedule request parked as `Waiting`. Returns `false` if nothing was parked
    /// under `id` (already resumed, expired, or never parked).
    pub async fn resume_parked(&self, id: WorkItemId) -> Result<bool> {
        match take_parked::<CrawlRequest>(self.store.as_ref(), id).await? {
            Some(request) => {
                self.submit(request)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// No queued, delayed or in-flight work remains.
    pub fn is_idle(&self) -> bool {
        self.schedule_queue.is_empty()
            && self.ingest_queue.is_empty()
            && self.schedule_worker.in_flight() == 0
            && self.ingest_worker.in_flight() == 0
            && self.ingest_scheduler.active_domains() == 0
    }

    /// Queued requests, running items or entries waiting out a crawl delay.
    fn has_live_work(&self) -> bool {
        !self.schedule_queue.is_empty()
            || !self.ingest_queue.is_empty()
            || self.schedule_worker.in_flight() > 0
            || self.ingest_worker.in_flight() > 0
            || self.ingest_scheduler.queued() > 0
    }

    /// Moves on domains whose released item ended without a completion event.
    ///
    /// An ingest item that times out or faults never reports back, so its domain would stay
    /// `Ingesting` with the rest of its URIs pending. Once nothing else is running, an item still
    /// unaccounted for on two consecutive passes is abandoned. Returns how many were abandoned.
    pub fn reclaim_stalled(&self) -> usize {
        let mut previous = self.stalled.lock();
        if self.has_live_work() {
            previous.clear();
            return 0;
        }

        let mut current = HashSet::new();
        let mut reclaimed = 0;
        for (id, domain) in self.ingest_scheduler.in_flight_items() {
            if !previous.contains(&id) {
                current.insert(id);
            } else if self.ingest_scheduler.abandon(id) {
                error!(
                    target: "crawl::invariant",
                    item = %id,
                    domain = %domain,
                    "ingest item ended without completion; releasing its domain"
                );
                reclaimed += 1;
            }
        }
        *previous = current;
        reclaimed
    }

    /// Polls until the runtime is idle or `cancel` fires, reclaiming stalled domains on the way.
    pub async fn wait_until_idle(&self, poll: Duration, cancel: &CancellationToken) -> Result<()> {
        while !self.is_idle() {
            self.reclaim_stalled();
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CrawlError::Cancelled("waiting for idle runtime".into()));
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
        Ok(())
    }

    /// Stops accepting requests, lets the crawl run dry, then waits for both workers to finish.
    pub async fn wait(&self) -> Result<()> {
        self.schedule_queue.close();
        self.schedule_worker.wait_until_completed().await?;
        self.wait_until_idle(self.config.throttle.backpressure_backoff(), &self.shutdown_token)
            .await?;
        self.ingest_scheduler.shutdown().await;
        self.ingest_queue.close();
        self.ingest_worker.wait_until_completed().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "crawl::runtime", "initiating crawl runtime shutdown");
        self.ingest_scheduler.shutdown().await;
        self.shutdown_token.cancel();
        self.robots_queue.close();

        for (stage, waited) in [
            (
                StageKind::Schedule,
                tokio::time::timeout(SHUTDOWN_GRACE, self.schedule_worker.wait_until_completed())
                    .await,
            ),
            (
                StageKind::Ingest,
                tokio::time::timeout(SHUTDOWN_GRACE, self.ingest_worker.wait_until_completed())
                    .await,
            ),
        ] {
            match waited {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(CrawlError::InvalidState(_))) => {}
                Ok(Err(err)) => warn!(target: "crawl::runtime", %stage, error = %err, "worker ended with error"),
                Err(_) => warn!(target: "crawl::runtime", %stage, "worker did not stop within grace period"),
            }
        }

        info!(target: "crawl::runtime", "crawl runtime shutdown complete");
        Ok(())
    }
}

/// Helper for constructing a runtime with explicit dependencies.
pub struct CrawlRuntimeBuilder<P: IngestProcessor> {
    config: CrawlerConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn KeyValueStore>>,
    suffix_parser: Option<Arc<dyn DomainSuffixParser>>,
    ingest_processor: Option<Arc<P>>,
    node_id: Option<String>,
    event_capacity: usize,
}

impl<P: IngestProcessor> fmt::Debug for CrawlRuntimeBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrawlRuntimeBuilder")
            .field("config", &self.config)
            .field("clock_set", &self.clock.is_some())
            .field("store_set", &self.store.is_some())
            .field("suffix_parser_set", &self.suffix_parser.is_some())
            .field("ingest_processor_set", &self.ingest_processor.is_some())
            .field("ingest_processor_type", &type_name::<P>())
            .field("node_id", &self.node_id)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl<P: IngestProcessor> CrawlRuntimeBuilder<P> {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            suffix_parser: None,
            ingest_processor: None,
            node_id: None,
            event_capacity: 1024,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_suffix_parser(mut self, parser: Arc<dyn DomainSuffixParser>) -> Self {
        self.suffix_parser = Some(parser);
        self
    }

    pub fn with_ingest_processor(mut self, processor: Arc<P>) -> Self {
        self.ingest_processor = Some(processor);
        self
    }

    /// Node id prefix reported on completion events. Defaults to `<stage>-<pid>`.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Buffer size of the broadcast outcome feeds.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Builds the runtime. Spawns the ingest scheduler's release loop, so call inside a tokio
    /// runtime.
    pub fn build(self) -> Result<CrawlRuntime<P>> {
        let ingest_processor = self
            .ingest_processor
            .ok_or_else(|| CrawlError::Internal("ingest processor dependency missing".into()))?;
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(Arc::clone(&clock))));
        let suffix_parser = self
            .suffix_parser
            .unwrap_or_else(|| Arc::new(SuffixListParser::new()));
        let config = self.config;
        let node = |stage: StageKind| match &self.node_id {
            Some(id) => NodeInfo::new(format!("{id}-{stage}"), stage),
            None => NodeInfo::local(stage),
        };

        let schedule_queue = Arc::new(MemoryQueue::new(StageKind::Schedule.to_string()));
        let ingest_queue = Arc::new(MemoryQueue::new(StageKind::Ingest.to_string()));
        let robots_queue = Arc::new(MemoryQueue::new(StageKind::Robots.to_string()));
        let schedule_bus: Arc<ScheduleBus> =
            Arc::new(InProcCompletionBus::new(self.event_capacity));
        let ingest_bus: Arc<IngestBus> = Arc::new(InProcCompletionBus::new(self.event_capacity));

        let correlator =
            CompletionCorrelator::new(ingest_bus.clone() as Arc<dyn CompletionStream<_, _>>);
        let ingest_scheduler = Arc::new(DomainIngestScheduler::start(
            Arc::clone(&clock),
            config.throttle,
            suffix_parser,
            ingest_queue.clone(),
            correlator,
        ));

        let schedule_processor = Arc::new(ScheduleRequestProcessor::new(
            config.scheduler.clone(),
            Arc::clone(&store),
            robots_queue.clone(),
            Arc::clone(&ingest_scheduler),
        )?);

        let schedule_worker = TaskQueueWorker::new(
            node(StageKind::Schedule),
            config.scheduler_stage,
            schedule_processor,
            schedule_queue.clone(),
            schedule_bus.clone(),
            Arc::clone(&store),
        )
        .with_waiting_ttl(config.waiting_ttl());
        let ingest_worker = TaskQueueWorker::new(
            node(StageKind::Ingest),
            config.ingest_stage,
            ingest_processor,
            ingest_queue.clone(),
            ingest_bus.clone(),
            Arc::clone(&store),
        )
        .with_waiting_ttl(config.waiting_ttl());

        Ok(CrawlRuntime {
            config,
            store,
            schedule_queue,
            ingest_queue,
            robots_queue,
            schedule_bus,
            ingest_bus,
            ingest_scheduler,
            schedule_worker,
            ingest_worker,
            stalled: Mutex::new(HashSet::new()),
            shutdown_token: CancellationToken::new(),
        })
    }
}
