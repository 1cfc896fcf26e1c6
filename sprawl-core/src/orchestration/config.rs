use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for the crawl engine.
///
/// Every section carries defaults so a partial payload is enough to start a crawl.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Depth limit, domain filters and robots handling for the schedule stage.
    pub scheduler: SchedulerConfig,
    /// Per-domain pacing and ingest backpressure.
    pub throttle: ThrottleConfig,
    /// Worker sizing for the schedule stage.
    pub scheduler_stage: WorkerConfig,
    /// Worker sizing for the ingest stage.
    pub ingest_stage: WorkerConfig,
    /// How long parked (`Waiting`) items stay in the store. `None` keeps them until removed.
    pub waiting_ttl_secs: Option<u64>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            throttle: ThrottleConfig::default(),
            scheduler_stage: WorkerConfig::default(),
            ingest_stage: WorkerConfig {
                max_concurrent_items: 16,
                item_timeout_ms: 60_000,
            },
            waiting_ttl_secs: Some(24 * 60 * 60),
        }
    }
}

impl CrawlerConfig {
    pub fn waiting_ttl(&self) -> Option<Duration> {
        self.waiting_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Requests deeper than this fail with `MaxCrawlDepthExceeded`.
    pub max_crawl_depth: u32,
    /// Wildcard host patterns (`*.example.com`). Empty admits every host.
    pub include_domains: Vec<String>,
    /// Wildcard host patterns that are always rejected, checked after includes.
    pub exclude_domains: Vec<String>,
    pub respect_robots: bool,
    /// Store key prefix for cached robots rules.
    pub robots_cache_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_crawl_depth: 8,
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
            respect_robots: true,
            robots_cache_prefix: "robots".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum gap between two releases for the same domain (ms).
    pub min_crawl_delay_ms: u64,
    /// Release loop pauses while the ingest queue holds at least this many items.
    pub max_pending_ingest: usize,
    /// Sleep between backpressure checks (ms).
    pub backpressure_backoff_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_crawl_delay_ms: 1_000,
            max_pending_ingest: 512,
            backpressure_backoff_ms: 250,
        }
    }
}

impl ThrottleConfig {
    pub fn min_crawl_delay(&self) -> Duration {
        Duration::from_millis(self.min_crawl_delay_ms)
    }

    pub fn backpressure_backoff(&self) -> Duration {
        Duration::from_millis(self.backpressure_backoff_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Admission gate size: per-item tasks in flight at once.
    pub max_concurrent_items: usize,
    /// Per-item processing timeout (ms).
    pub item_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: 4,
            item_timeout_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}
