//! Rate limited, deduplicating work queue.
//!
//! An item is either waiting (delayed until its ready time), queued, or being
//! processed. Adding an item that is already queued is a no-op; adding an item
//! that is being processed marks it dirty so that it is queued again once the
//! current processing ends with [`WorkQueue::done`]. Hence the same item is
//! never processed by two workers at the same time.

use crate::{rate_limiter::RateLimiter, utils::metric_name};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    sync::Notify,
    time::{Duration, Instant, sleep_until},
};

const WORKQUEUE: &'static str = "workqueue";

struct QueueMetrics {
    labels: [KeyValue; 1],
    depth: UpDownCounter<i64>,
    adds: Counter<u64>,
    retries: Counter<u64>,
    queue_duration: Histogram<f64>,
    work_duration: Histogram<f64>,
}

impl QueueMetrics {
    fn new(name: &str) -> Self {
        let meter: Meter = global::meter(WORKQUEUE);
        Self {
            labels: [KeyValue::new("name", name.to_string())],
            depth: meter
                .i64_up_down_counter(metric_name("workqueue_depth"))
                .with_description("Current number of queued items")
                .build(),
            adds: meter
                .u64_counter(metric_name("workqueue_adds"))
                .with_description("Count of items added to the queue")
                .build(),
            retries: meter
                .u64_counter(metric_name("workqueue_retries"))
                .with_description("Count of rate limited re-adds")
                .build(),
            queue_duration: meter
                .f64_histogram(metric_name("workqueue_queue_duration_seconds"))
                .with_description("Time an item stays queued before it is handed to a worker")
                .with_unit("s")
                .build(),
            work_duration: meter
                .f64_histogram(metric_name("workqueue_work_duration_seconds"))
                .with_description("Time a worker spends processing an item")
                .with_unit("s")
                .build(),
        }
    }
}

/// An item parked until `ready_at`; ordered so that [`BinaryHeap`] pops the
/// earliest ready time first.
struct WaitFor<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for WaitFor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for WaitFor<T> {}

impl<T> PartialOrd for WaitFor<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for WaitFor<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing, queued or not.
    dirty: HashSet<T>,
    processing: HashSet<T>,
    /// Earliest ready time of each waiting item; heap entries not matching it are stale.
    waiting: HashMap<T, Instant>,
    waiting_heap: BinaryHeap<WaitFor<T>>,
    seq: u64,
    queued_at: HashMap<T, Instant>,
    started_at: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    /// Wakes workers blocked in `get`.
    item_added: Notify,
    /// Wakes the waiting loop when a new earliest deadline exists or on shutdown.
    waiting_changed: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
    metrics: QueueMetrics,
}

/// Cloneable handle to a shared work queue.
pub(crate) struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Shared<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_locked(&self, state: &mut State<T>, item: T) {
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        self.metrics.adds.add(1, &self.metrics.labels);
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        self.push_locked(state, item);
    }

    fn push_locked(&self, state: &mut State<T>, item: T) {
        state.queued_at.insert(item.clone(), Instant::now());
        state.queue.push_back(item);
        self.metrics.depth.add(1, &self.metrics.labels);
        self.item_added.notify_one();
    }

    async fn waiting_loop(self: Arc<Self>) {
        loop {
            let changed = self.waiting_changed.notified();
            let next = {
                let mut guard = self.state();
                let state = &mut *guard;
                if state.shutting_down {
                    return;
                }
                let now = Instant::now();
                while let Some(head) = state.waiting_heap.peek() {
                    if state.waiting.get(&head.item) != Some(&head.ready_at) {
                        state.waiting_heap.pop();
                        continue;
                    }
                    if head.ready_at > now {
                        break;
                    }
                    if let Some(entry) = state.waiting_heap.pop() {
                        state.waiting.remove(&entry.item);
                        self.add_locked(state, entry.item);
                    }
                }
                state.waiting_heap.peek().map(|head| head.ready_at)
            };
            match next {
                Some(ready_at) => {
                    tokio::select! {
                        _ = sleep_until(ready_at) => (),
                        _ = changed => (),
                    }
                }
                None => changed.await,
            }
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Creates a queue and spawns its waiting loop, must be called from
    /// within a Tokio runtime.
    pub fn new(name: &str, rate_limiter: impl RateLimiter<T> + 'static) -> Self {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(State {
                queue: Default::default(),
                dirty: Default::default(),
                processing: Default::default(),
                waiting: Default::default(),
                waiting_heap: Default::default(),
                seq: 0,
                queued_at: Default::default(),
                started_at: Default::default(),
                shutting_down: false,
            }),
            item_added: Notify::new(),
            waiting_changed: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
            metrics: QueueMetrics::new(name),
        });
        tokio::spawn(shared.clone().waiting_loop());
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Marks `item` as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.shared.state();
        self.shared.add_locked(&mut state, item);
    }

    /// Adds `item` once `delay` has passed. If the item is already waiting, the
    /// earlier of both ready times is kept.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let mut guard = self.shared.state();
        let state = &mut *guard;
        if state.shutting_down {
            return;
        }
        let ready_at = Instant::now() + delay;
        if let Some(existing) = state.waiting.get(&item) {
            if *existing <= ready_at {
                return;
            }
        }
        let earliest = state
            .waiting_heap
            .peek()
            .map_or(true, |head| ready_at < head.ready_at);
        state.seq += 1;
        state.waiting.insert(item.clone(), ready_at);
        state.waiting_heap.push(WaitFor {
            ready_at,
            seq: state.seq,
            item,
        });
        if earliest {
            self.shared.waiting_changed.notify_one();
        }
    }

    /// Adds `item` after the delay chosen by the rate limiter, recording a retry.
    pub fn add_rate_limited(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.shared.rate_limiter.when(&item);
        self.shared
            .metrics
            .retries
            .add(1, &self.shared.metrics.labels);
        self.add_after(item, delay);
    }

    /// Adds `item` after the overall throttling delay of the rate limiter,
    /// without counting it as a retry of `item`.
    pub fn add_throttled(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.shared.rate_limiter.throttle(&item);
        self.add_after(item, delay);
    }

    /// Waits for the next item. Returns `None` once the queue is shut down,
    /// even if items are still queued.
    ///
    /// Every returned item must be handed back with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.item_added.notified();
            {
                let mut state = self.shared.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    let metrics = &self.shared.metrics;
                    metrics.depth.add(-1, &metrics.labels);
                    let now = Instant::now();
                    if let Some(queued_at) = state.queued_at.remove(&item) {
                        metrics
                            .queue_duration
                            .record((now - queued_at).as_secs_f64(), &metrics.labels);
                    }
                    state.started_at.insert(item.clone(), now);
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Ends processing of `item`; if it was re-added meanwhile it is queued
    /// again, unless the queue is shutting down.
    pub fn done(&self, item: &T) {
        let mut guard = self.shared.state();
        let state = &mut *guard;
        if let Some(started_at) = state.started_at.remove(item) {
            let metrics = &self.shared.metrics;
            metrics
                .work_duration
                .record(started_at.elapsed().as_secs_f64(), &metrics.labels);
        }
        state.processing.remove(item);
        if !state.shutting_down && state.dirty.contains(item) {
            self.shared.push_locked(state, item.clone());
        }
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.shared.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.rate_limiter.num_requeues(item)
    }

    /// Number of queued items, excluding waiting and in-flight ones.
    pub fn len(&self) -> usize {
        self.shared.state().queue.len()
    }

    /// Rejects further adds and wakes every blocked [`WorkQueue::get`].
    pub fn shut_down(&self) {
        let mut state = self.shared.state();
        state.shutting_down = true;
        state.waiting.clear();
        state.waiting_heap.clear();
        drop(state);
        self.shared.item_added.notify_waiters();
        self.shared.waiting_changed.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state().shutting_down
    }
}
