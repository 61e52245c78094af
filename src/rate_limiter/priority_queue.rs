// src/rate_limiter/priority_queue.rs
//! Four-way priority queue of requests waiting for admission.
//!
//! Partitions are drained strictly from CRITICAL down to LOW, FIFO inside a
//! partition. Every entry carries a oneshot completion handle and the queue
//! guarantees each one is completed: granted by the consumer, failed with
//! `QueueTimeout` once its deadline passes, or failed with
//! `ServiceShuttingDown` when the queue is closed.

use super::types::RequestPriority;
use crate::error::RateLimitError;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};

pub type Completion<G> = oneshot::Sender<Result<G, RateLimitError>>;

/// A caller waiting for its turn. `G` is whatever the consumer grants.
#[derive(Debug)]
pub struct QueuedRequest<G> {
    pub id: u64,
    pub priority: RequestPriority,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    /// The caller already used its CRITICAL trial call while the breaker was open
    pub trial_spent: bool,
    /// The entry already sat out one admission pause
    pub paused: bool,
    completion: Completion<G>,
}

impl<G> QueuedRequest<G> {
    pub fn new(
        id: u64,
        priority: RequestPriority,
        deadline: Instant,
        trial_spent: bool,
        completion: Completion<G>,
    ) -> Self {
        Self {
            id,
            priority,
            enqueued_at: Instant::now(),
            deadline,
            trial_spent,
            paused: false,
            completion,
        }
    }

    /// Hands the result to the waiting caller; `false` if the caller is gone
    pub fn complete(self, result: Result<G, RateLimitError>) -> bool {
        self.completion.send(result).is_ok()
    }

    /// The caller stopped waiting (timed out or was dropped)
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    fn sort_key(&self) -> (Instant, u64) {
        (self.enqueued_at, self.id)
    }
}

#[derive(Debug)]
struct Inner<G> {
    partitions: [VecDeque<QueuedRequest<G>>; 4],
    closed: bool,
}

impl<G> Inner<G> {
    fn pop_highest(&mut self) -> Option<QueuedRequest<G>> {
        self.partitions.iter_mut().find_map(|p| p.pop_front())
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.partitions
            .iter()
            .flat_map(|p| p.iter().map(|r| r.deadline))
            .min()
    }

    /// Fails expired entries and forgets abandoned ones
    fn purge(&mut self, now: Instant) {
        for partition in self.partitions.iter_mut() {
            let pending: Vec<_> = partition.drain(..).collect();
            for request in pending {
                if request.is_abandoned() {
                    debug!("🗑️ Dropping abandoned request #{}", request.id);
                } else if request.deadline <= now {
                    let waited = now.saturating_duration_since(request.enqueued_at);
                    debug!(
                        "⌛ {} request #{} timed out in queue after {:?}",
                        request.priority, request.id, waited
                    );
                    request.complete(Err(RateLimitError::QueueTimeout { waited }));
                } else {
                    partition.push_back(request);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct PriorityQueue<G> {
    inner: Mutex<Inner<G>>,
    notify: Notify,
}

impl<G> Default for PriorityQueue<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> PriorityQueue<G> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                partitions: Default::default(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<G>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Never blocks. A closed queue fails the request right away.
    pub fn enqueue(&self, request: QueuedRequest<G>) {
        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            request.complete(Err(RateLimitError::ServiceShuttingDown));
            return;
        }

        let key = request.sort_key();
        let partition = &mut inner.partitions[request.priority.index()];
        let insert_pos = partition
            .iter()
            .position(|queued| queued.sort_key() > key)
            .unwrap_or(partition.len());
        debug!(
            "📝 Queued {} request #{} (partition size: {})",
            request.priority,
            request.id,
            partition.len() + 1
        );
        partition.insert(insert_pos, request);
        drop(inner);
        self.notify.notify_one();
    }

    /// Next request by priority, waiting until one is available.
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<QueuedRequest<G>> {
        loop {
            let next_deadline = {
                let mut inner = self.lock();
                inner.purge(Instant::now());
                if let Some(request) = inner.pop_highest() {
                    return Some(request);
                }
                if inner.closed {
                    return None;
                }
                inner.earliest_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Closes the queue and fails everything still waiting.
    /// Returns how many requests were drained.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner
                .partitions
                .iter_mut()
                .flat_map(|p| p.drain(..))
                .collect()
        };
        let count = drained.len();
        for request in drained {
            request.complete(Err(RateLimitError::ServiceShuttingDown));
        }
        self.notify.notify_one();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().partitions.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth_by_priority(&self) -> Vec<(RequestPriority, usize)> {
        let inner = self.lock();
        RequestPriority::ALL
            .iter()
            .map(|p| (*p, inner.partitions[p.index()].len()))
            .collect()
    }
}
