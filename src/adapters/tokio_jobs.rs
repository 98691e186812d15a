//! Tokio Job Queue Adapter
//!
//! Implements the `JobQueue` port in-process. Each priority class has its
//! own permit pool so background work never holds up interactive work.
//! Jobs run exactly once unless cancelled before they start; nothing
//! survives a restart.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain::ports::{Job, JobHandle, JobPriority, JobQueue};

/// Permit counts per priority class.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub interactive_slots: usize,
    pub background_slots: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            interactive_slots: 16,
            background_slots: 4,
        }
    }
}

#[derive(Debug, Default)]
struct JobCounters {
    pending: AtomicUsize,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

/// Job queue backed by the ambient tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioJobQueue {
    interactive: Arc<Semaphore>,
    background: Arc<Semaphore>,
    counters: Arc<JobCounters>,
    idle: Arc<Notify>,
}

impl Default for TokioJobQueue {
    fn default() -> Self {
        Self::new(JobQueueConfig::default())
    }
}

impl TokioJobQueue {
    pub fn new(config: JobQueueConfig) -> Self {
        Self {
            interactive: Arc::new(Semaphore::new(config.interactive_slots.max(1))),
            background: Arc::new(Semaphore::new(config.background_slots.max(1))),
            counters: Arc::new(JobCounters::default()),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Jobs enqueued but not yet finished or skipped.
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.counters.cancelled.load(Ordering::Relaxed)
    }

    /// Wait until every enqueued job has finished or been skipped.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl JobQueue for TokioJobQueue {
    fn enqueue(&self, job: Job, priority: JobPriority) -> JobHandle {
        let cancel = CancellationToken::new();
        let handle = JobHandle::new(cancel.clone());
        let permits = match priority {
            JobPriority::Interactive => Arc::clone(&self.interactive),
            JobPriority::Background => Arc::clone(&self.background),
        };
        let counters = Arc::clone(&self.counters);
        let idle = Arc::clone(&self.idle);
        let id = handle.id();

        counters.pending.fetch_add(1, Ordering::AcqRel);
        trace!(%id, ?priority, "Job enqueued");

        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            match permit {
                Some(_permit) if !cancel.is_cancelled() => {
                    job.await;
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    debug!(%id, "Job cancelled before it ran");
                    counters.cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }
            if counters.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                idle.notify_waiters();
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_jobs_run_once() {
        let queue = TokioJobQueue::default();
        let runs = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let runs = Arc::clone(&runs);
            queue.enqueue(
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
                JobPriority::Background,
            );
        }
        queue.drain().await;
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert_eq!(queue.completed(), 10);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let queue = TokioJobQueue::new(JobQueueConfig {
            interactive_slots: 1,
            background_slots: 1,
        });
        let gate = Arc::new(Notify::new());
        let ran = Arc::new(AtomicU32::new(0));

        // Occupy the only background slot.
        let blocker = Arc::clone(&gate);
        queue.enqueue(
            Box::pin(async move { blocker.notified().await }),
            JobPriority::Background,
        );

        let flag = Arc::clone(&ran);
        let handle = queue.enqueue(
            Box::pin(async move {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
            JobPriority::Background,
        );
        handle.cancel();
        tokio::task::yield_now().await;
        gate.notify_one();

        queue.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.cancelled(), 1);
        assert_eq!(queue.completed(), 1);
    }
}
