//! Request processor for the schedule stage.
//!
//! Decides which discovered paths of a host are worth fetching and hands them to the
//! [`DomainIngestScheduler`]. Per request the outcome is one of: rejected (depth), filtered (domain
//! rules or nothing new), waiting on robots rules, or dispatched.

use std::{collections::HashSet, fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::{Position, Url};

use super::{
    config::SchedulerConfig, ingest_scheduler::DomainIngestScheduler, worker::RequestProcessor,
};
use crate::{
    error::{CrawlError, Result},
    queue::OutboundProducer,
    store::{KeyValueStore, get_json},
    work::{
        CrawlRequest, ErrorCode, QueuedResult, RobotsRequest, ScheduleOutcome, StageFailure,
        WorkItemId,
    },
};

/// Host pattern where `*` matches any run of characters (`*.example.com`).
///
/// A leading `*.` also matches the bare domain.
#[derive(Clone, Debug)]
pub struct DomainPattern {
    raw: String,
    regex: Regex,
}

impl DomainPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let raw = pattern.trim().to_ascii_lowercase();
        if raw.is_empty() {
            return Err(CrawlError::InvalidState("empty domain pattern".into()));
        }
        let (prefix, rest) = match raw.strip_prefix("*.") {
            Some(rest) => (r"(?:.*\.)?", rest),
            None => ("", raw.as_str()),
        };
        let body = rest
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{prefix}{body}$")).map_err(|err| {
            CrawlError::InvalidState(format!("invalid domain pattern {pattern:?}: {err}"))
        })?;
        Ok(Self { raw, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, host: &str) -> bool {
        self.regex
            .is_match(host.trim_end_matches('.').to_ascii_lowercase().as_str())
    }
}

/// Cached robots rules for one host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotsRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub disallow: Vec<String>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Longest matching prefix wins; `allow` wins a tie. Empty `disallow` lines match nothing.
    pub fn is_allowed(&self, path: &str) -> bool {
        let longest = |rules: &[String]| {
            rules
                .iter()
                .filter(|rule| !rule.is_empty() && path.starts_with(rule.as_str()))
                .map(String::len)
                .max()
        };
        match (longest(&self.allow), longest(&self.disallow)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(allow), Some(disallow)) => allow >= disallow,
        }
    }
}

/// Store key of the cached robots rules for `host`.
pub fn robots_key(prefix: &str, host: &str) -> String {
    format!("{prefix}/{}", host.to_ascii_lowercase())
}

fn path_key(url: &Url) -> &str {
    &url[Position::BeforePath..Position::AfterQuery]
}

pub struct ScheduleRequestProcessor {
    config: SchedulerConfig,
    include: Vec<DomainPattern>,
    exclude: Vec<DomainPattern>,
    store: Arc<dyn KeyValueStore>,
    robots: Arc<dyn OutboundProducer<RobotsRequest>>,
    scheduler: Arc<DomainIngestScheduler>,
    visited: DashMap<String, HashSet<String>>,
}

impl fmt::Debug for ScheduleRequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleRequestProcessor")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("robots_pending", &self.robots.len())
            .field("scheduler", &self.scheduler)
            .field("visited_hosts", &self.visited.len())
            .finish()
    }
}

impl ScheduleRequestProcessor {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn KeyValueStore>,
        robots: Arc<dyn OutboundProducer<RobotsRequest>>,
        scheduler: Arc<DomainIngestScheduler>,
    ) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|pattern| DomainPattern::new(pattern))
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            include: compile(&config.include_domains)?,
            exclude: compile(&config.exclude_domains)?,
            config,
            store,
            robots,
            scheduler,
            visited: DashMap::new(),
        })
    }

    pub fn admits_host(&self, host: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|pattern| pattern.matches(host));
        included && !self.exclude.iter().any(|pattern| pattern.matches(host))
    }

    /// Paths already handed to the ingest scheduler for `host`.
    pub fn visited_count(&self, host: &str) -> usize {
        self.visited
            .get(&host.to_ascii_lowercase())
            .map(|seen| seen.len())
            .unwrap_or_default()
    }

    fn resolve(&self, request: &CrawlRequest, host: &str) -> Vec<Url> {
        let mut resolved = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            match request.uri.join(path) {
                Ok(mut url) if url.host_str() == Some(host) => {
                    url.set_fragment(None);
                    if !resolved.contains(&url) {
                        resolved.push(url);
                    }
                }
                Ok(url) => {
                    trace!(target: "crawl::scheduler", path = %path, resolved = %url, "path leaves request host; dropped");
                }
                Err(err) => {
                    trace!(target: "crawl::scheduler", path = %path, error = %err, "unresolvable path dropped");
                }
            }
        }
        resolved
    }

    async fn request_robots(&self, request: &CrawlRequest) -> Result<()> {
        let uri = request
            .uri
            .join("/robots.txt")
            .map_err(|err| CrawlError::Internal(format!("robots uri: {err}")))?;
        let robots = RobotsRequest {
            id: WorkItemId::new(),
            trace_id: request.trace_id,
            uri,
            waiting_request: request.id,
        };
        self.robots.enqueue(robots).await
    }

    /// Marks the new URLs visited and returns them. Already visited URLs are dropped.
    fn claim_unvisited(&self, host: &str, candidates: Vec<Url>) -> Vec<Url> {
        let mut seen = self.visited.entry(host.to_ascii_lowercase()).or_default();
        candidates
            .into_iter()
            .filter(|url| seen.insert(path_key(url).to_owned()))
            .collect()
    }

    fn forget_visited(&self, host: &str, urls: &[Url]) {
        if let Some(mut seen) = self.visited.get_mut(&host.to_ascii_lowercase()) {
            for url in urls {
                seen.remove(path_key(url));
            }
        }
    }
}

#[async_trait]
impl RequestProcessor for ScheduleRequestProcessor {
    type Item = CrawlRequest;
    type Success = ScheduleOutcome;
    type Failure = StageFailure;

    async fn process(
        &self,
        request: &CrawlRequest,
        cancel: CancellationToken,
    ) -> Result<QueuedResult<ScheduleOutcome, StageFailure>> {
        if cancel.is_cancelled() {
            return Err(CrawlError::Cancelled(format!("schedule {}", request.id)));
        }

        if request.depth > self.config.max_crawl_depth {
            return Ok(QueuedResult::Failed(StageFailure::with_message(
                ErrorCode::MaxCrawlDepthExceeded,
                format!(
                    "depth {} exceeds limit {}",
                    request.depth, self.config.max_crawl_depth
                ),
            )));
        }

        let Some(host) = request.host() else {
            return Ok(QueuedResult::Failed(StageFailure::with_message(
                ErrorCode::InvalidUri,
                format!("{} has no host", request.uri),
            )));
        };

        if !self.admits_host(host) {
            debug!(target: "crawl::scheduler", host, request = %request.id, "host filtered by domain rules");
            return Ok(QueuedResult::Success(ScheduleOutcome::default()));
        }

        let mut candidates = self.resolve(request, host);

        if self.config.respect_robots {
            let key = robots_key(&self.config.robots_cache_prefix, host);
            match get_json::<RobotsRules>(self.store.as_ref(), &key).await? {
                None => {
                    self.request_robots(request).await?;
                    debug!(target: "crawl::scheduler", host, request = %request.id, "robots rules missing; request parked");
                    return Ok(QueuedResult::Waiting);
                }
                Some(rules) => {
                    candidates.retain(|url| rules.is_allowed(path_key(url)));
                }
            }
        }

        let added = self.claim_unvisited(host, candidates);
        if added.is_empty() {
            trace!(target: "crawl::scheduler", host, request = %request.id, "nothing new to schedule");
            return Ok(QueuedResult::Success(ScheduleOutcome::default()));
        }

        let added_paths: Vec<String> = added.iter().map(|url| path_key(url).to_owned()).collect();
        if let Err(err) = self.scheduler.add_from_scheduler(request, added.clone()) {
            self.forget_visited(host, &added);
            return Err(err);
        }

        debug!(
            target: "crawl::scheduler",
            host,
            request = %request.id,
            added = added_paths.len(),
            "paths handed to ingest scheduler"
        );
        Ok(QueuedResult::Success(ScheduleOutcome { added_paths }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        clock::SystemClock,
        orchestration::{
            config::ThrottleConfig,
            correlation::CompletionCorrelator,
            domain::SuffixListParser,
            events::{CompletionStream, InProcCompletionBus},
        },
        queue::MemoryQueue,
        store::{MemoryStore, put_json},
        work::{IngestReport, IngestRequest},
    };

    struct Fixture {
        processor: ScheduleRequestProcessor,
        store: Arc<MemoryStore>,
        robots: Arc<MemoryQueue<RobotsRequest>>,
        ingest: Arc<MemoryQueue<IngestRequest>>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let clock = SystemClock::shared();
        let bus = Arc::new(InProcCompletionBus::<IngestReport, StageFailure>::new(8));
        let ingest = Arc::new(MemoryQueue::new("ingest"));
        let robots = Arc::new(MemoryQueue::new("robots"));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let scheduler = Arc::new(DomainIngestScheduler::start(
            clock,
            ThrottleConfig {
                min_crawl_delay_ms: 10,
                ..ThrottleConfig::default()
            },
            Arc::new(SuffixListParser::new()),
            ingest.clone(),
            CompletionCorrelator::new(bus as Arc<dyn CompletionStream<_, _>>),
        ));
        let processor =
            ScheduleRequestProcessor::new(config, store.clone(), robots.clone(), scheduler)
                .unwrap();
        Fixture {
            processor,
            store,
            robots,
            ingest,
        }
    }

    fn no_robots() -> SchedulerConfig {
        SchedulerConfig {
            respect_robots: false,
            ..SchedulerConfig::default()
        }
    }

    fn request(paths: &[&str], depth: u32) -> CrawlRequest {
        CrawlRequest::new(
            Url::parse("http://a.test/").unwrap(),
            paths.iter().map(|p| p.to_string()).collect(),
            depth,
        )
    }

    #[test]
    fn wildcard_patterns_match_subdomains_and_apex() {
        let pattern = DomainPattern::new("*.Example.com").unwrap();
        assert!(pattern.matches("example.com"));
        assert!(pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("badexample.com"));
        assert!(DomainPattern::new("shop-*.test").unwrap().matches("shop-eu.test"));
        assert!(DomainPattern::new("  ").is_err());
    }

    #[test]
    fn robots_longest_prefix_wins() {
        let rules = RobotsRules {
            allow: vec!["/private/public".into()],
            disallow: vec!["/private".into(), String::new()],
        };
        assert!(rules.is_allowed("/"));
        assert!(!rules.is_allowed("/private/secret"));
        assert!(rules.is_allowed("/private/public/page"));
        assert!(RobotsRules::allow_all().is_allowed("/anything"));
    }

    #[tokio::test]
    async fn too_deep_requests_fail_with_error_code() {
        let f = fixture(SchedulerConfig {
            max_crawl_depth: 2,
            ..no_robots()
        });
        let result = f
            .processor
            .process(&request(&["/x"], 3), CancellationToken::new())
            .await
            .unwrap();
        match result {
            QueuedResult::Failed(failure) => {
                assert_eq!(failure.code, ErrorCode::MaxCrawlDepthExceeded)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn excluded_hosts_are_filtered() {
        let f = fixture(SchedulerConfig {
            exclude_domains: vec!["*.test".into()],
            ..no_robots()
        });
        let result = f
            .processor
            .process(&request(&["/x"], 0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, QueuedResult::Success(ScheduleOutcome::default()));
        assert_eq!(f.processor.visited_count("a.test"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmitted_paths_are_reported_once() {
        let f = fixture(no_robots());
        let first = f
            .processor
            .process(
                &request(&["/x", "y#frag", "http://other.test/z"], 0),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            first,
            QueuedResult::Success(ScheduleOutcome {
                added_paths: vec!["/x".into(), "/y".into()],
            })
        );

        let again = f
            .processor
            .process(&request(&["/x"], 0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, QueuedResult::Success(ScheduleOutcome::default()));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.ingest.len(), 1);
    }

    #[tokio::test]
    async fn robots_miss_parks_request_and_hit_filters_paths() {
        let f = fixture(SchedulerConfig::default());
        let crawl = request(&["/open", "/admin/panel"], 0);

        let miss = f
            .processor
            .process(&crawl, CancellationToken::new())
            .await
            .unwrap();
        assert!(miss.is_waiting());
        let robots = f.robots.try_dequeue().unwrap();
        assert_eq!(robots.waiting_request, crawl.id);
        assert_eq!(robots.uri.as_str(), "http://a.test/robots.txt");

        let rules = RobotsRules {
            allow: Vec::new(),
            disallow: vec!["/admin".into()],
        };
        put_json(f.store.as_ref(), &robots_key("robots", "a.test"), &rules, None)
            .await
            .unwrap();

        let hit = f
            .processor
            .process(&crawl, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            hit,
            QueuedResult::Success(ScheduleOutcome {
                added_paths: vec!["/open".into()],
            })
        );
    }
}
