//! # Sprawl Core
//!
//! Concurrency and scheduling engine for the Sprawl web crawler.
//!
//! ## Overview
//!
//! Every pipeline stage (seed, schedule, ingest, parse, robots) runs the same worker over its own
//! queue. This crate provides that shared machinery:
//!
//! - **Stage workers**: bounded-concurrency task loop with pause, resume and cancellation
//! - **Delayed dispatch**: blocking queue ordered by a "not before" timestamp
//! - **Per-domain pacing**: one in-flight fetch per registrable domain, separated by a crawl delay
//! - **Completion correlation**: one-shot handlers tied to a work item's completion or failure
//!
//! ## Architecture
//!
//! - [`clock`]: injectable time source
//! - [`queue`]: inbound/outbound queue contracts and the in-process queue
//! - [`store`]: key/value store contract, in-memory and `cacache`-backed stores
//! - [`orchestration`]: workers, delay queue, event bus, ingest scheduler and runtime wiring
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use sprawl_core::{
//!     error::Result,
//!     orchestration::{CrawlRuntimeBuilder, CrawlerConfig, RequestProcessor},
//!     work::{CrawlRequest, IngestReport, IngestRequest, QueuedResult, StageFailure},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Fetcher;
//!
//! #[async_trait]
//! impl RequestProcessor for Fetcher {
//!     type Item = IngestRequest;
//!     type Success = IngestReport;
//!     type Failure = StageFailure;
//!
//!     async fn process(
//!         &self,
//!         item: &IngestRequest,
//!         _cancel: CancellationToken,
//!     ) -> Result<QueuedResult<IngestReport, StageFailure>> {
//!         Ok(QueuedResult::Success(IngestReport {
//!             uri: item.uri.clone(),
//!             status_code: Some(200),
//!         }))
//!     }
//! }
//!
//! async fn crawl() -> Result<()> {
//!     let runtime = CrawlRuntimeBuilder::new(CrawlerConfig::default())
//!         .with_ingest_processor(Arc::new(Fetcher))
//!         .build()?;
//!     runtime.start()?;
//!     runtime.submit(CrawlRequest::new(
//!         "https://example.com/".parse().expect("valid url"),
//!         vec!["/about".into()],
//!         0,
//!     ))?;
//!     runtime.wait().await
//! }
//! ```

#![allow(missing_docs)]

pub mod clock;

/// Error types and the crate-wide `Result` alias
pub mod error;

/// Stage queues
pub mod queue;

pub mod store;

/// Work items, results and status payloads shared by every stage
pub mod work;

/// Stage workers, delayed dispatch, completion events and the per-domain ingest scheduler
pub mod orchestration;

pub use error::{CrawlError, Result};
