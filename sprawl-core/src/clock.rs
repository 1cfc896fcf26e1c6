//! Logical clock indirection.
//!
//! Every component that reads "now" or suspends on a timer takes a [`SharedClock`] explicitly, so
//! tests can substitute their own time source without touching process-wide state.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CrawlError, Result};

/// Source of wall-clock time and cancellable sleeps.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Suspends for `duration`, returning [`CrawlError::Cancelled`] if `cancel` fires first.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Suspends until `at`. Instants in the past return immediately.
    async fn sleep_until(&self, at: DateTime<Utc>, cancel: &CancellationToken) -> Result<()> {
        match (at - self.now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => self.sleep(remaining, cancel).await,
            _ => Ok(()),
        }
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock anchored to the tokio timer.
///
/// `now()` is the wall time captured at construction plus the tokio time elapsed since then, so it
/// advances together with `tokio::time::pause`/`advance` in tests while behaving like
/// `Utc::now()` in production.
#[derive(Clone)]
pub struct SystemClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock")
            .field("anchor_wall", &self.anchor_wall)
            .finish()
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::MAX);
        self.anchor_wall + elapsed
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CrawlError::Cancelled("clock sleep".into())),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
