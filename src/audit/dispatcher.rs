use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AuditEvent, EventPublisher, RetryPolicy};
use crate::config::{AuditConfig, FailureMode, OverflowPolicy};
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the background workers.
    Queued,
    /// Queued after evicting the oldest pending event.
    QueuedDroppedOldest,
    /// Queue full or shutting down; the event was dropped.
    Rejected,
    /// Published inline (fail-closed mode).
    Published,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AuditStats {
    pub enqueued: u64,
    pub published: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    published: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct EventQueue {
    items: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    overflow: OverflowPolicy,
    notify: Notify,
    /// Fired whenever the queue drains with no event in flight.
    idle: Notify,
    closed: AtomicBool,
    /// Events popped but not yet finished by a worker.
    busy: AtomicUsize,
}

impl EventQueue {
    fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            overflow,
            notify: Notify::new(),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AuditEvent>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn push(&self, event: AuditEvent) -> DispatchOutcome {
        if self.closed.load(Ordering::Acquire) {
            return DispatchOutcome::Rejected;
        }
        let outcome = {
            let mut items = self.lock();
            if items.len() < self.capacity {
                items.push_back(event);
                DispatchOutcome::Queued
            } else {
                match self.overflow {
                    OverflowPolicy::Reject => return DispatchOutcome::Rejected,
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(event);
                        DispatchOutcome::QueuedDroppedOldest
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Next event; `None` once closed and drained.
    async fn pop(&self) -> Option<AuditEvent> {
        loop {
            // Created before the checks so a close between check and await
            // still wakes us.
            let notified = self.notify.notified();
            {
                let mut items = self.lock();
                if let Some(event) = items.pop_front() {
                    self.busy.fetch_add(1, Ordering::AcqRel);
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Clears everything still queued or held by a stopped worker and
    /// returns how many events that was. Only valid once no worker runs.
    fn discard(&self) -> usize {
        let left = {
            let mut items = self.lock();
            let left = items.len();
            items.clear();
            left
        };
        let in_flight = self.busy.swap(0, Ordering::AcqRel);
        self.idle.notify_waiters();
        left + in_flight
    }

    fn is_idle(&self) -> bool {
        let items = self.lock();
        items.is_empty() && self.busy.load(Ordering::Acquire) == 0
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Moves audit events off the request path.
///
/// In fail-open mode events go into a bounded queue drained by a pool of
/// workers which retry transient failures with backoff; the request path
/// never sees broker errors. In fail-closed mode events are published
/// inline and broker errors are returned to the caller.
pub struct AuditDispatcher {
    mode: FailureMode,
    publisher: Arc<EventPublisher>,
    retry: RetryPolicy,
    queue: Arc<EventQueue>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl AuditDispatcher {
    /// Builds the dispatcher and, in fail-open mode, spawns its workers on
    /// the current tokio runtime.
    pub fn start(publisher: EventPublisher, config: &AuditConfig) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            mode: config.failure_mode,
            publisher: Arc::new(publisher),
            retry: RetryPolicy::from_config(config),
            queue: Arc::new(EventQueue::new(config.queue_capacity, config.overflow)),
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Vec::new()),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        });

        if dispatcher.mode == FailureMode::FailOpen {
            let handles: Vec<_> = (0..config.workers.max(1))
                .map(|id| dispatcher.spawn_worker(id))
                .collect();
            info!("Started {} audit workers", handles.len());
            *dispatcher.lock_workers() = handles;
        }
        dispatcher
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_worker(&self, id: usize) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let publisher = self.publisher.clone();
        let counters = self.counters.clone();
        let retry = self.retry;

        tokio::spawn(async move {
            while let Some(event) = queue.pop().await {
                deliver(&publisher, &retry, &counters, event).await;
                queue.finish();
            }
            debug!(worker = id, "Audit worker stopped");
        })
    }

    /// Fail-open: enqueue and return immediately, never an error.
    /// Fail-closed: publish now and propagate broker errors. The publish
    /// runs in its own task and keeps its own counters, so dropping this
    /// future neither cancels it nor loses it from the stats.
    pub async fn submit(&self, event: AuditEvent) -> Result<DispatchOutcome, BrokerError> {
        debug!(category = %event.category, payload = %event.payload, "Audit event");
        match self.mode {
            FailureMode::FailOpen => Ok(self.enqueue(event)),
            FailureMode::FailClosed => {
                let publisher = self.publisher.clone();
                let counters = self.counters.clone();
                let handle = tokio::spawn(async move {
                    let result = publisher.publish(event.category, &event.payload).await;
                    match &result {
                        Ok(()) => Counters::bump(&counters.published),
                        Err(_) => Counters::bump(&counters.failed),
                    }
                    result
                });
                handle
                    .await
                    .map_err(|e| BrokerError::PublishError(format!("publish task failed: {}", e)))??;
                Ok(DispatchOutcome::Published)
            }
        }
    }

    fn enqueue(&self, event: AuditEvent) -> DispatchOutcome {
        let category = event.category;
        let outcome = self.queue.push(event);
        match outcome {
            DispatchOutcome::Queued => Counters::bump(&self.counters.enqueued),
            DispatchOutcome::QueuedDroppedOldest => {
                Counters::bump(&self.counters.enqueued);
                Counters::bump(&self.counters.dropped);
                warn!(category = %category, "Audit queue full, dropped oldest event");
            }
            DispatchOutcome::Rejected => {
                Counters::bump(&self.counters.dropped);
                warn!(category = %category, "Audit queue full or closed, event dropped");
            }
            DispatchOutcome::Published => {}
        }
        outcome
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pending: self.queue.len(),
        }
    }

    /// Waits until the queue is empty and no worker holds an event.
    /// Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                // Registered before the check so a finish in between still wakes us.
                let notified = self.queue.idle.notified();
                if self.queue.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Stops intake, lets workers drain the queue within the grace period,
    /// then aborts the workers. Events still queued or mid-publish at that
    /// point are counted as dropped. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.queue.close();
        let mut handles = std::mem::take(&mut *self.lock_workers());
        if handles.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(
            self.shutdown_grace,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;
        if drained.is_ok() {
            info!("Audit queue drained");
            return;
        }

        for handle in &handles {
            handle.abort();
        }
        // Wait for the aborts to land so no worker touches the queue below.
        // Finished handles may already have been polled to completion.
        let running = handles.into_iter().filter(|h| !h.is_finished());
        futures::future::join_all(running).await;

        let left = self.queue.discard();
        self.counters
            .dropped
            .fetch_add(left as u64, Ordering::Relaxed);
        error!("Audit shutdown grace period elapsed, {} events dropped", left);
    }
}

async fn deliver(
    publisher: &EventPublisher,
    retry: &RetryPolicy,
    counters: &Counters,
    event: AuditEvent,
) {
    let mut attempt = 0u32;
    loop {
        match publisher.publish(event.category, &event.payload).await {
            Ok(()) => {
                Counters::bump(&counters.published);
                return;
            }
            Err(e) => {
                let delay = if e.is_transient() {
                    retry.backoff(attempt)
                } else {
                    None
                };
                match delay {
                    Some(delay) => {
                        Counters::bump(&counters.retried);
                        debug!(
                            category = %event.category,
                            attempt = attempt + 1,
                            "Retrying audit publish in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        Counters::bump(&counters.failed);
                        error!(
                            category = %event.category,
                            attempts = attempt + 1,
                            "Audit event dropped after publish failure: {}",
                            e
                        );
                        return;
                    }
                }
            }
        }
    }
}
