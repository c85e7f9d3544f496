//! Deferred task dispatch.
//!
//! The engine never runs reconciliation or change notification inline with
//! a read or write; both are posted to an externally supplied ordered,
//! single-consumer queue. Cancellation is not supported: a stale task
//! re-validates state when it runs and no-ops if nothing is left to do.

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Task priority classes, drained high-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

/// A unit of deferred work.
pub struct Task {
    pub tag: &'static str,
    pub delay: Duration,
    pub priority: TaskPriority,
    work: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub fn new(tag: &'static str, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            tag,
            delay: Duration::ZERO,
            priority: TaskPriority::Normal,
            work: Box::new(work),
        }
    }

    /// Delay execution by `delay` from the time of posting.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Execute the task, consuming it.
    pub fn run(self) {
        (self.work)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tag", &self.tag)
            .field("delay", &self.delay)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Ordered, single-consumer task queue.
pub trait EventQueue: Send + Sync {
    fn post(&self, task: Task);
}

/// Tokio-backed queue.
///
/// One consumer task drains three priority channels, high before normal
/// before low. Delayed tasks are re-posted at their fire time so they never
/// hold up earlier work; within a priority class, ready tasks run in post
/// order.
pub struct TokioEventQueue {
    high: mpsc::UnboundedSender<Task>,
    normal: mpsc::UnboundedSender<Task>,
    low: mpsc::UnboundedSender<Task>,
    handle: tokio::runtime::Handle,
}

impl TokioEventQueue {
    /// Spawn the consumer on the given runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        handle.spawn(consume(high_rx, normal_rx, low_rx));
        Self { high: high_tx, normal: normal_tx, low: low_tx, handle }
    }

    fn sender(&self, priority: TaskPriority) -> &mpsc::UnboundedSender<Task> {
        match priority {
            TaskPriority::High => &self.high,
            TaskPriority::Normal => &self.normal,
            TaskPriority::Low => &self.low,
        }
    }
}

impl EventQueue for TokioEventQueue {
    fn post(&self, mut task: Task) {
        let tx = self.sender(task.priority).clone();
        if task.delay.is_zero() {
            // Send failure means the queue is shutting down; tasks are
            // re-validating by contract, dropping them is safe.
            let _ = tx.send(task);
            return;
        }
        let delay = std::mem::replace(&mut task.delay, Duration::ZERO);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(task);
        });
    }
}

async fn consume(
    mut high: mpsc::UnboundedReceiver<Task>,
    mut normal: mpsc::UnboundedReceiver<Task>,
    mut low: mpsc::UnboundedReceiver<Task>,
) {
    loop {
        let task = tokio::select! {
            biased;
            t = high.recv() => t,
            t = normal.recv() => t,
            t = low.recv() => t,
        };
        // The senders live and die together; one closed channel means the
        // queue handle was dropped.
        let Some(task) = task else { break };
        tracing::trace!(tag = task.tag, "running queued task");
        task.run();
    }
}
