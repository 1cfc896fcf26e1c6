pub mod config;
pub mod correlation;
pub mod delay_queue;
pub mod domain;
pub mod events;
pub mod ingest_scheduler;
pub mod runtime;
pub mod schedule_processor;
pub mod worker;

pub use config::{CrawlerConfig, SchedulerConfig, ThrottleConfig, WorkerConfig};
pub use correlation::CompletionCorrelator;
pub use delay_queue::DelayQueue;
pub use domain::{DomainState, DomainSuffixParser, SuffixListParser};
pub use events::{
    CompletionEvent, CompletionNotifier, CompletionOutcome, CompletionStream,
    InProcCompletionBus, ObserverRegistry, SubscriptionId,
};
pub use ingest_scheduler::{DomainIngestScheduler, ScheduleEntry};
pub use runtime::{CrawlRuntime, CrawlRuntimeBuilder, IngestProcessor};
pub use schedule_processor::{DomainPattern, RobotsRules, ScheduleRequestProcessor};
pub use worker::{RequestProcessor, TaskQueueWorker, parked_key, take_parked};
