//! Blocking queue ordered by a "not before" timestamp.
//!
//! Every dequeuer registers its own single-slot wake signal. An enqueue releases one permit on each
//! registered signal, so a waiter sleeping towards a later due time re-examines the head as soon as
//! something new arrives. Peek and removal happen under one lock, so two dequeuers can never take
//! the same entry.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    hash::Hash,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    clock::SharedClock,
    error::{CrawlError, Result},
};

/// Ordering key: due time first, insertion sequence to keep ties stable.
type DueKey = (DateTime<Utc>, u64);

struct DelayState<T> {
    entries: BTreeMap<DueKey, T>,
    members: HashSet<T>,
    next_seq: u64,
    waiters: HashMap<u64, Arc<Notify>>,
    next_waiter: u64,
}

impl<T> DelayState<T> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            members: HashSet::new(),
            next_seq: 0,
            waiters: HashMap::new(),
            next_waiter: 0,
        }
    }
}

pub struct DelayQueue<T> {
    clock: SharedClock,
    state: Mutex<DelayState<T>>,
}

impl<T> fmt::Debug for DelayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DelayQueue");
        debug.field("clock", &self.clock);
        match self.state.try_lock() {
            Some(state) => {
                debug
                    .field("len", &state.entries.len())
                    .field("waiters", &state.waiters.len())
                    .field("next_due", &state.entries.keys().next().map(|key| key.0));
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

/// Removes a dequeuer's wake signal when its wait ends, however it ends.
struct WaiterRegistration<'a, T> {
    queue: &'a DelayQueue<T>,
    id: u64,
}

impl<T> Drop for WaiterRegistration<'_, T> {
    fn drop(&mut self) {
        self.queue.state.lock().waiters.remove(&self.id);
    }
}

enum Head<T> {
    Ready(T),
    Pending(DateTime<Utc>),
    Empty,
}

impl<T> DelayQueue<T>
where
    T: Clone + Eq + Hash + Send,
{
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(DelayState::new()),
        }
    }

    /// Schedules `item` for `due_at`.
    ///
    /// Returns `false` without touching the queue when an equal item is already waiting. Past due
    /// times are accepted and become eligible immediately.
    pub fn enqueue(&self, item: T, due_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if !state.members.insert(item.clone()) {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert((due_at, seq), item);
        for waker in state.waiters.values() {
            waker.notify_one();
        }
        trace!(target: "crawl::delay_queue", due_at = %due_at, len = state.entries.len(), "entry scheduled");
        true
    }

    /// Waits until the earliest entry is due and removes it.
    ///
    /// Suspends without polling while the queue is empty. Cancellation only ends this caller's
    /// wait; other dequeuers are unaffected.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T> {
        let waker = Arc::new(Notify::new());
        let _registration = self.register_waiter(Arc::clone(&waker));

        loop {
            if cancel.is_cancelled() {
                return Err(CrawlError::Cancelled("delay queue dequeue".into()));
            }

            match self.take_due() {
                Head::Ready(item) => return Ok(item),
                Head::Empty => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CrawlError::Cancelled("delay queue dequeue".into()));
                        }
                        _ = waker.notified() => {}
                    }
                }
                Head::Pending(due_at) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(CrawlError::Cancelled("delay queue dequeue".into()));
                        }
                        slept = self.clock.sleep_until(due_at, cancel) => slept?,
                        _ = waker.notified() => {}
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &T) -> bool {
        self.state.lock().members.contains(item)
    }

    /// Due time of the head entry, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state.lock().entries.keys().next().map(|key| key.0)
    }

    fn register_waiter(&self, waker: Arc<Notify>) -> WaiterRegistration<'_, T> {
        let mut state = self.state.lock();
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.insert(id, waker);
        WaiterRegistration { queue: self, id }
    }

    fn take_due(&self) -> Head<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(head) = state.entries.first_entry() else {
            return Head::Empty;
        };
        let due_at = head.key().0;
        if due_at > now {
            return Head::Pending(due_at);
        }
        let item = head.remove();
        state.members.remove(&item);
        Head::Ready(item)
    }
}
