mod supervisor;

pub use supervisor::{CrawlRuntime, CrawlRuntimeBuilder, IngestProcessor};
