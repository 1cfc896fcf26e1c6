//! Per-domain ingest pacing.
//!
//! Each domain has at most one URI travelling through the release path at a time: either waiting
//! in the delay queue (`Queued`) or handed to the ingest stage (`Ingesting`). When the ingest stage
//! reports the item finished, the next pending URI of that domain is scheduled no earlier than the
//! configured crawl delay. Lock order is always `pending` before `states`.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{
    config::ThrottleConfig,
    correlation::CompletionCorrelator,
    delay_queue::DelayQueue,
    domain::{DomainState, DomainSuffixParser},
    events::CompletionOutcome,
};
use crate::{
    clock::SharedClock,
    error::{CrawlError, Result},
    queue::OutboundProducer,
    work::{CrawlRequest, IngestReport, IngestRequest, StageFailure, WorkItemId},
};

/// One URI travelling through the release path.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ScheduleEntry {
    pub target: Url,
    pub domain: String,
    /// Schedule request that discovered `target`.
    pub origin: Arc<CrawlRequest>,
}

#[derive(Clone, Debug)]
struct PendingUri {
    uri: Url,
    origin: Arc<CrawlRequest>,
}

/// Insertion-ordered pending URIs of one domain with set semantics.
#[derive(Debug, Default)]
struct PendingUris {
    order: VecDeque<PendingUri>,
    members: HashSet<Url>,
}

impl PendingUris {
    fn push(&mut self, uri: Url, origin: &Arc<CrawlRequest>) {
        if self.members.insert(uri.clone()) {
            self.order.push_back(PendingUri {
                uri,
                origin: Arc::clone(origin),
            });
        }
    }

    fn pop(&mut self) -> Option<PendingUri> {
        let next = self.order.pop_front()?;
        self.members.remove(&next.uri);
        Some(next)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub type IngestCorrelator = CompletionCorrelator<IngestReport, StageFailure>;

struct SchedulerInner {
    this: Weak<SchedulerInner>,
    clock: SharedClock,
    throttle: ThrottleConfig,
    suffix_parser: Arc<dyn DomainSuffixParser>,
    ingest: Arc<dyn OutboundProducer<IngestRequest>>,
    correlator: Arc<IngestCorrelator>,
    queue: DelayQueue<ScheduleEntry>,
    pending: DashMap<String, PendingUris>,
    states: DashMap<String, DomainState>,
    active: DashMap<WorkItemId, ScheduleEntry>,
    seen: DashSet<Url>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

/// Throttles ingest releases per registrable domain.
pub struct DomainIngestScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DomainIngestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainIngestScheduler")
            .field("throttle", &self.inner.throttle)
            .field("suffix_parser", &self.inner.suffix_parser)
            .field("domains", &self.inner.states.len())
            .field("queued", &self.inner.queue.len())
            .field("in_flight", &self.inner.active.len())
            .field("seen", &self.inner.seen.len())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl DomainIngestScheduler {
    /// Creates the scheduler and spawns its release loop.
    pub fn start(
        clock: SharedClock,
        throttle: ThrottleConfig,
        suffix_parser: Arc<dyn DomainSuffixParser>,
        ingest: Arc<dyn OutboundProducer<IngestRequest>>,
        correlator: Arc<IngestCorrelator>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| SchedulerInner {
            this: this.clone(),
            queue: DelayQueue::new(Arc::clone(&clock)),
            clock,
            throttle,
            suffix_parser,
            ingest,
            correlator,
            pending: DashMap::new(),
            states: DashMap::new(),
            active: DashMap::new(),
            seen: DashSet::new(),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        let task = tokio::spawn(Arc::clone(&inner).run());
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Accepts URIs discovered by `origin` for release to the ingest stage.
    ///
    /// URIs join the domain's pending list (duplicates are dropped). If the domain is idle the
    /// first pending URI is released without delay; otherwise it waits for the in-flight one.
    pub fn add_from_scheduler(&self, origin: &CrawlRequest, uris: Vec<Url>) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Err(CrawlError::Disposed("ingest scheduler".into()));
        }
        if uris.is_empty() {
            return Ok(());
        }

        let domain = inner.domain_key(origin.host().unwrap_or_default());
        let origin = Arc::new(origin.clone());
        {
            let mut pending = inner.pending.entry(domain.clone()).or_default();
            for uri in uris {
                pending.push(uri, &origin);
            }
        }

        let claimed = match inner.states.entry(domain.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(DomainState::Queued);
                true
            }
            Entry::Occupied(mut occupied) if *occupied.get() == DomainState::Inactive => {
                occupied.insert(DomainState::Queued);
                true
            }
            Entry::Occupied(_) => false,
        };

        if claimed {
            inner.release_next(&domain, false);
        } else {
            trace!(target: "crawl::scheduler", domain = %domain, "domain busy; uris left pending");
        }
        Ok(())
    }

    pub fn domain_key(&self, host: &str) -> String {
        self.inner.domain_key(host)
    }

    pub fn domain_state(&self, domain: &str) -> DomainState {
        self.inner
            .states
            .get(domain)
            .map(|state| *state)
            .unwrap_or(DomainState::Inactive)
    }

    /// URIs of `domain` not yet moved into the delay queue.
    pub fn pending_len(&self, domain: &str) -> usize {
        self.inner
            .pending
            .get(domain)
            .map(|pending| pending.len())
            .unwrap_or_default()
    }

    /// Entries waiting in the delay queue.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Domains with an entry queued or ingesting.
    pub fn active_domains(&self) -> usize {
        self.inner
            .states
            .iter()
            .filter(|state| *state.value() != DomainState::Inactive)
            .count()
    }

    /// Ingest items released by this scheduler that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.active.len()
    }

    /// Released items still awaiting a completion, with their domain.
    pub fn in_flight_items(&self) -> Vec<(WorkItemId, String)> {
        self.inner
            .active
            .iter()
            .map(|entry| (*entry.key(), entry.value().domain.clone()))
            .collect()
    }

    /// Stops waiting for the completion of `id` and moves its domain on to the next pending URI.
    ///
    /// For items the ingest stage dropped without reporting (timeouts, faults). Returns `false`
    /// if `id` is not in flight or its completion is already being handled.
    pub fn abandon(&self, id: WorkItemId) -> bool {
        let inner = &self.inner;
        if !inner.correlator.unregister(id) {
            return false;
        }
        let Some((_, entry)) = inner.active.remove(&id) else {
            return false;
        };
        warn!(
            target: "crawl::scheduler",
            domain = %entry.domain,
            uri = %entry.target,
            item = %id,
            "abandoned ingest item without completion"
        );
        if !inner.disposed.load(Ordering::Acquire) {
            inner.release_next(&entry.domain, true);
        }
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stops the release loop. Items already handed to the ingest stage are left alone.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(target: "crawl::scheduler", error = %err, "release loop ended abnormally");
        }
        info!(
            target: "crawl::scheduler",
            in_flight = self.inner.active.len(),
            queued = self.inner.queue.len(),
            "ingest scheduler disposed"
        );
    }
}

impl Drop for DomainIngestScheduler {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.shutdown.cancel();
    }
}

impl SchedulerInner {
    fn domain_key(&self, host: &str) -> String {
        self.suffix_parser
            .parse(host)
            .unwrap_or_else(|| host.to_ascii_lowercase())
    }

    /// Moves the domain's next pending URI into the delay queue, or marks the domain inactive when
    /// nothing is pending.
    fn release_next(&self, domain: &str, add_delay: bool) {
        let next = match self.pending.entry(domain.to_owned()) {
            Entry::Occupied(mut pending) => {
                let next = pending.get_mut().pop();
                match next {
                    Some(_) => {
                        self.states.insert(domain.to_owned(), DomainState::Queued);
                    }
                    None => {
                        self.states.remove(domain);
                    }
                }
                if pending.get().is_empty() {
                    pending.remove();
                }
                next
            }
            Entry::Vacant(_) => {
                self.states.remove(domain);
                None
            }
        };

        let Some(PendingUri { uri, origin }) = next else {
            trace!(target: "crawl::scheduler", domain = %domain, "nothing pending; domain inactive");
            return;
        };

        let mut due_at = self.clock.now();
        if add_delay
            && let Ok(delay) = chrono::Duration::from_std(self.throttle.min_crawl_delay())
        {
            due_at += delay;
        }

        let entry = ScheduleEntry {
            target: uri,
            domain: domain.to_owned(),
            origin,
        };
        if !self.queue.enqueue(entry, due_at) {
            warn!(target: "crawl::scheduler", domain = %domain, "entry already queued");
        }
        trace!(target: "crawl::scheduler", domain = %domain, due_at = %due_at, "next uri queued");
    }

    async fn run(self: Arc<Self>) {
        debug!(target: "crawl::scheduler", "release loop started");
        loop {
            let entry = match self.queue.dequeue(&self.shutdown).await {
                Ok(entry) => entry,
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    error!(target: "crawl::scheduler", error = %err, "delay queue dequeue failed");
                    continue;
                }
            };

            match self.dispatch(entry).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    error!(target: "crawl::scheduler", error = %err, "release failed");
                }
            }
        }
        debug!(target: "crawl::scheduler", "release loop stopped");
    }

    async fn dispatch(&self, entry: ScheduleEntry) -> Result<()> {
        let limit = self.throttle.max_pending_ingest.max(1);
        while self.ingest.len() >= limit {
            trace!(target: "crawl::scheduler", pending = self.ingest.len(), limit, "ingest backpressure");
            self.clock
                .sleep(self.throttle.backpressure_backoff(), &self.shutdown)
                .await?;
        }

        if !self.seen.insert(entry.target.clone()) {
            debug!(target: "crawl::scheduler", uri = %entry.target, "uri already ingested; skipping");
            self.release_next(&entry.domain, true);
            return Ok(());
        }

        let request = IngestRequest {
            id: WorkItemId::new(),
            trace_id: entry.origin.trace_id,
            uri: entry.target.clone(),
            depth: entry.origin.depth,
            origin_id: entry.origin.id,
        };
        let id = request.id;
        let domain = entry.domain.clone();
        let target = entry.target.clone();

        if self.active.insert(id, entry).is_some() {
            error!(target: "crawl::invariant", item = %id, "ingest id released twice");
        }
        let previous = self.states.insert(domain.clone(), DomainState::Ingesting);
        if previous == Some(DomainState::Ingesting) {
            error!(target: "crawl::invariant", domain = %domain, "second concurrent ingest for domain");
        }

        // Registered before the enqueue so a fast completion cannot be missed.
        let this = self.this.clone();
        let registered = self.correlator.register(id, move |outcome| {
            if let Some(inner) = this.upgrade() {
                inner.on_ingest_finished(outcome);
            }
        });
        if !registered {
            error!(target: "crawl::invariant", item = %id, "completion handler already registered for ingest id");
        }

        if let Err(err) = self.ingest.enqueue(request).await {
            self.correlator.unregister(id);
            self.active.remove(&id);
            self.seen.remove(&target);
            self.release_next(&domain, true);
            return Err(err);
        }

        info!(target: "crawl::scheduler", domain = %domain, uri = %target, item = %id, "released uri to ingest");
        Ok(())
    }

    fn on_ingest_finished(&self, outcome: CompletionOutcome<IngestReport, StageFailure>) {
        let id = outcome.id();
        let Some((_, entry)) = self.active.remove(&id) else {
            error!(
                target: "crawl::invariant",
                item = %id,
                "completion for an ingest item with no schedule entry"
            );
            return;
        };

        debug!(
            target: "crawl::scheduler",
            domain = %entry.domain,
            uri = %entry.target,
            completed = outcome.is_completed(),
            "ingest finished"
        );
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        self.release_next(&entry.domain, true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        clock::{Clock, SystemClock},
        orchestration::{
            domain::SuffixListParser,
            events::{CompletionEvent, CompletionNotifier, CompletionStream, InProcCompletionBus},
        },
        queue::MemoryQueue,
        work::{NodeInfo, StageKind},
    };

    type Bus = InProcCompletionBus<IngestReport, StageFailure>;

    struct Fixture {
        clock: SharedClock,
        bus: Arc<Bus>,
        ingest: Arc<MemoryQueue<IngestRequest>>,
        scheduler: DomainIngestScheduler,
    }

    fn fixture(delay_ms: u64, max_pending_ingest: usize) -> Fixture {
        let clock = SystemClock::shared();
        let bus = Arc::new(Bus::new(16));
        let ingest = Arc::new(MemoryQueue::new("ingest"));
        let correlator = CompletionCorrelator::new(bus.clone() as Arc<dyn CompletionStream<_, _>>);
        let scheduler = DomainIngestScheduler::start(
            Arc::clone(&clock),
            ThrottleConfig {
                min_crawl_delay_ms: delay_ms,
                max_pending_ingest,
                backpressure_backoff_ms: 5,
            },
            Arc::new(SuffixListParser::new()),
            ingest.clone(),
            correlator,
        );
        Fixture {
            clock,
            bus,
            ingest,
            scheduler,
        }
    }

    fn request(base: &str) -> CrawlRequest {
        CrawlRequest::new(Url::parse(base).unwrap(), Vec::new(), 0)
    }

    fn urls(raw: &[&str]) -> Vec<Url> {
        raw.iter().map(|u| Url::parse(u).unwrap()).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn complete(bus: &Bus, item: &IngestRequest) {
        bus.notify_completed(CompletionEvent::new(
            item.id,
            NodeInfo::local(StageKind::Ingest),
            IngestReport {
                uri: item.uri.clone(),
                status_code: Some(200),
            },
        ))
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_domain_waits_for_completion_and_crawl_delay() {
        let f = fixture(50, 100);
        f.scheduler
            .add_from_scheduler(
                &request("http://a.test/"),
                urls(&["http://a.test/x", "http://a.test/y"]),
            )
            .unwrap();
        settle().await;

        let first = f.ingest.try_dequeue().unwrap();
        assert_eq!(first.uri.path(), "/x");
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Ingesting);
        assert_eq!(f.scheduler.pending_len("a.test"), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.ingest.is_empty(), "second uri must wait for completion");

        complete(&f.bus, &first).await;
        let completed_at = f.clock.now();
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Queued);

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert!(f.ingest.is_empty(), "crawl delay not honoured");
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = f.ingest.try_dequeue().unwrap();
        assert_eq!(second.uri.path(), "/y");
        assert!(f.clock.now() - completed_at >= chrono::Duration::milliseconds(50));

        complete(&f.bus, &second).await;
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Inactive);
        assert_eq!(f.scheduler.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_domains_release_immediately() {
        let f = fixture(1_000, 100);
        f.scheduler
            .add_from_scheduler(&request("http://a.test/"), urls(&["http://a.test/1"]))
            .unwrap();
        f.scheduler
            .add_from_scheduler(&request("http://www.b.test/"), urls(&["http://www.b.test/1"]))
            .unwrap();
        settle().await;

        assert_eq!(f.ingest.len(), 2);
        assert_eq!(f.scheduler.in_flight(), 2);
        assert_eq!(f.scheduler.domain_key("www.b.test"), "b.test");
        assert_eq!(f.scheduler.domain_state("b.test"), DomainState::Ingesting);
    }

    #[tokio::test(start_paused = true)]
    async fn already_ingested_uri_is_skipped_and_domain_goes_idle() {
        let f = fixture(10, 100);
        let origin = request("http://a.test/");
        f.scheduler
            .add_from_scheduler(&origin, urls(&["http://a.test/x"]))
            .unwrap();
        settle().await;
        let first = f.ingest.try_dequeue().unwrap();
        complete(&f.bus, &first).await;
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Inactive);

        f.scheduler
            .add_from_scheduler(&origin, urls(&["http://a.test/x"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.ingest.is_empty());
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ingest_releases_next_uri_too() {
        let f = fixture(5, 100);
        f.scheduler
            .add_from_scheduler(
                &request("http://a.test/"),
                urls(&["http://a.test/x", "http://a.test/y"]),
            )
            .unwrap();
        settle().await;
        let first = f.ingest.try_dequeue().unwrap();

        f.bus
            .notify_failed(CompletionEvent::new(
                first.id,
                NodeInfo::local(StageKind::Ingest),
                StageFailure::new(crate::work::ErrorCode::FetchFailed),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.ingest.try_dequeue().unwrap().uri.path(), "/y");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_list_keeps_first_occurrence_order() {
        let f = fixture(10, 100);
        let origin = request("http://a.test/");
        f.scheduler
            .add_from_scheduler(
                &origin,
                urls(&[
                    "http://a.test/x",
                    "http://a.test/y",
                    "http://a.test/y",
                    "http://a.test/z",
                ]),
            )
            .unwrap();
        settle().await;
        assert_eq!(f.ingest.try_dequeue().unwrap().uri.path(), "/x");
        assert_eq!(f.scheduler.pending_len("a.test"), 2);

        f.scheduler
            .add_from_scheduler(&origin, urls(&["http://a.test/z", "http://a.test/w"]))
            .unwrap();
        assert_eq!(f.scheduler.pending_len("a.test"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_item_moves_its_domain_on() {
        let f = fixture(20, 100);
        f.scheduler
            .add_from_scheduler(
                &request("http://a.test/"),
                urls(&["http://a.test/slow", "http://a.test/next"]),
            )
            .unwrap();
        settle().await;
        let slow = f.ingest.try_dequeue().unwrap();
        assert_eq!(f.scheduler.in_flight_items(), vec![(slow.id, "a.test".to_string())]);

        assert!(f.scheduler.abandon(slow.id));
        assert!(!f.scheduler.abandon(slow.id));
        assert_eq!(f.scheduler.in_flight(), 0);
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Queued);

        tokio::time::sleep(Duration::from_millis(25)).await;
        let next = f.ingest.try_dequeue().unwrap();
        assert_eq!(next.uri.path(), "/next");

        // A late report for the abandoned item must not release anything.
        complete(&f.bus, &slow).await;
        assert_eq!(f.scheduler.domain_state("a.test"), DomainState::Ingesting);
        assert_eq!(f.scheduler.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_holds_entries_until_ingest_drains() {
        let f = fixture(0, 1);
        f.scheduler
            .add_from_scheduler(&request("http://a.test/"), urls(&["http://a.test/1"]))
            .unwrap();
        f.scheduler
            .add_from_scheduler(&request("http://b.test/"), urls(&["http://b.test/1"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.ingest.len(), 1);
        assert_eq!(f.scheduler.in_flight(), 1);

        f.ingest.try_dequeue().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.ingest.len(), 1);
        assert_eq!(f.scheduler.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_scheduler_rejects_new_work() {
        let f = fixture(10, 100);
        f.scheduler.shutdown().await;
        assert!(f.scheduler.is_disposed());
        let err = f
            .scheduler
            .add_from_scheduler(&request("http://a.test/"), urls(&["http://a.test/x"]))
            .unwrap_err();
        assert!(matches!(err, CrawlError::Disposed(_)));
    }
}
