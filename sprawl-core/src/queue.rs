//! Producer/consumer contracts between stages, plus the in-process queue used when a stage runs in
//! the same process as its producers.

use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{CrawlError, Result};

/// Consumer side of a stage queue.
#[async_trait]
pub trait InboundQueue<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Waits for the next item. Returns [`CrawlError::Cancelled`] when `cancel` fires and
    /// [`CrawlError::QueueClosed`] once the queue is closed and drained.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Producer side of a stage queue.
#[async_trait]
pub trait OutboundProducer<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn enqueue(&self, item: T) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded FIFO queue shared between producers and one or more consumers in the same process.
pub struct MemoryQueue<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> fmt::Debug for MemoryQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("name", &self.name)
            .field("len", &self.items.lock().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> MemoryQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an item without awaiting. Fails once the queue is closed.
    pub fn push(&self, item: T) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CrawlError::QueueClosed(self.name.clone()));
        }
        self.items.lock().push_back(item);
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Stops accepting items. Consumers drain what is left and then observe `QueueClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T> InboundQueue<T> for MemoryQueue<T>
where
    T: Send + 'static,
{
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before looking so a push between the check and the await is
            // not missed.
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return Ok(item);
            }
            if self.is_closed() {
                return Err(CrawlError::QueueClosed(self.name.clone()));
            }

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    return Err(CrawlError::Cancelled(format!("dequeue from {}", self.name)));
                }
            }
        }
    }

    fn len(&self) -> usize {
        MemoryQueue::len(self)
    }
}

#[async_trait]
impl<T> OutboundProducer<T> for MemoryQueue<T>
where
    T: Send + 'static,
{
    async fn enqueue(&self, item: T) -> Result<()> {
        self.push(item)
    }

    fn len(&self) -> usize {
        MemoryQueue::len(self)
    }
}
