//! Dry-run crawl driver: schedules seed URLs through the real engine and logs each release.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use sprawl_config::{SettingsLoader, StoreSettings, init_tracing};
use sprawl_core::{
    clock::SystemClock,
    orchestration::{CrawlRuntime, CrawlRuntimeBuilder, RequestProcessor, RobotsRules},
    store::{DiskStore, KeyValueStore, MemoryStore, StoreRoot},
    work::{
        CrawlRequest, IngestReport, IngestRequest, QueuedResult, RobotsRequest, StageFailure,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "sprawl-crawl",
    about = "Run the Sprawl schedule and ingest stages against seed URLs without fetching"
)]
struct Cli {
    /// Seed URL; repeat for several seeds
    #[arg(long = "seed", required = true)]
    seeds: Vec<Url>,
    /// Read this env file instead of searching for .env
    #[arg(long, conflicts_with = "no_env_file")]
    env_file: Option<PathBuf>,
    #[arg(long)]
    no_env_file: bool,
    /// Overrides throttle.min_crawl_delay_ms
    #[arg(long)]
    crawl_delay_ms: Option<u64>,
    /// Overrides scheduler.max_crawl_depth
    #[arg(long)]
    max_depth: Option<u32>,
    /// Skip robots lookups entirely
    #[arg(long)]
    ignore_robots: bool,
    /// Simulated latency of each dry-run fetch
    #[arg(long, default_value_t = 100)]
    fetch_latency_ms: u64,
    /// How often to check whether the crawl ran dry
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
    #[arg(short, long)]
    verbose: bool,
}

/// Ingest processor that records each release instead of fetching it.
#[derive(Debug)]
struct DryRunIngest {
    latency: Duration,
    released: AtomicUsize,
}

#[async_trait]
impl RequestProcessor for DryRunIngest {
    type Item = IngestRequest;
    type Success = IngestReport;
    type Failure = StageFailure;

    async fn process(
        &self,
        item: &IngestRequest,
        cancel: CancellationToken,
    ) -> sprawl_core::Result<QueuedResult<IngestReport, StageFailure>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(sprawl_core::CrawlError::Cancelled("dry-run fetch".into()));
            }
            _ = tokio::time::sleep(self.latency) => {}
        }
        let count = self.released.fetch_add(1, Ordering::Relaxed) + 1;
        info!(target: "crawl::dry_run", uri = %item.uri, depth = item.depth, count, "would fetch");
        Ok(QueuedResult::Success(IngestReport {
            uri: item.uri.clone(),
            status_code: None,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut loader = SettingsLoader::new();
    if cli.no_env_file {
        loader = loader.without_env_file();
    } else if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let load = loader.load().context("loading crawler settings")?;
    for warning in &load.warnings.items {
        match &warning.hint {
            Some(hint) => warn!(target: "crawl::config", hint = %hint, "{}", warning.message),
            None => warn!(target: "crawl::config", "{}", warning.message),
        }
    }

    let mut settings = load.settings;
    if let Some(delay) = cli.crawl_delay_ms {
        settings.crawler.throttle.min_crawl_delay_ms = delay;
    }
    if let Some(depth) = cli.max_depth {
        settings.crawler.scheduler.max_crawl_depth = depth;
    }
    if cli.ignore_robots {
        settings.crawler.scheduler.respect_robots = false;
    }

    let clock = SystemClock::shared();
    let store: Arc<dyn KeyValueStore> = match &settings.store {
        StoreSettings::Memory => Arc::new(MemoryStore::new(Arc::clone(&clock))),
        StoreSettings::Disk { path } => Arc::new(DiskStore::new(
            StoreRoot::new(path.clone()),
            Arc::clone(&clock),
        )),
    };
    let ingest = Arc::new(DryRunIngest {
        latency: Duration::from_millis(cli.fetch_latency_ms),
        released: AtomicUsize::new(0),
    });

    let mut builder = CrawlRuntimeBuilder::new(settings.crawler.clone())
        .with_clock(clock)
        .with_store(store)
        .with_ingest_processor(Arc::clone(&ingest));
    if let Some(node_id) = &settings.node_id {
        builder = builder.with_node_id(node_id.clone());
    }
    let runtime = builder.build().context("building crawl runtime")?;
    runtime.start()?;

    for seed in &cli.seeds {
        runtime.submit(seed_request(seed))?;
    }

    let interrupted = drive(&runtime, Duration::from_millis(cli.poll_ms.max(1))).await?;
    if interrupted {
        runtime.shutdown().await?;
    } else {
        runtime.wait().await?;
    }

    info!(
        target: "crawl::dry_run",
        released = ingest.released.load(Ordering::Relaxed),
        interrupted,
        "crawl finished"
    );
    Ok(())
}

/// Answers robots lookups with allow-all rules until the crawl runs dry. Returns `true` when
/// interrupted by Ctrl-C.
async fn drive(runtime: &CrawlRuntime<DryRunIngest>, poll: Duration) -> Result<bool> {
    let robots = runtime.robots_requests();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    // Lookups whose request was not parked yet when first answered.
    let mut deferred: Vec<RobotsRequest> = Vec::new();

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("listening for ctrl-c")?;
                info!(target: "crawl::runtime", "interrupt received");
                return Ok(true);
            }
            _ = tokio::time::sleep(poll) => {}
        }

        let mut lookups = std::mem::take(&mut deferred);
        while let Some(lookup) = robots.try_dequeue() {
            lookups.push(lookup);
        }
        // Sampled before answering: once the schedule stage is idle every Waiting request is
        // already parked.
        let settled = runtime.is_idle();

        for lookup in lookups {
            let Some(host) = lookup.uri.host_str() else {
                continue;
            };
            runtime
                .store_robots_rules(host, &RobotsRules::default())
                .await?;
            if runtime.resume_parked(lookup.waiting_request).await? {
                continue;
            }
            if settled {
                warn!(target: "crawl::runtime", request = %lookup.waiting_request, "parked request vanished before robots answer");
            } else {
                deferred.push(lookup);
            }
        }

        let reclaimed = runtime.reclaim_stalled();
        if reclaimed > 0 {
            warn!(target: "crawl::runtime", reclaimed, "moved on from ingest items that never reported back");
        }

        if deferred.is_empty() && robots.is_empty() && runtime.is_idle() {
            return Ok(false);
        }
    }
}

fn seed_request(seed: &Url) -> CrawlRequest {
    let mut path = seed.path().to_string();
    if let Some(query) = seed.query() {
        path.push('?');
        path.push_str(query);
    }
    CrawlRequest::new(seed.clone(), vec![path], 0)
}
