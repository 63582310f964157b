//! Queue Backend Trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BackendError;
use crate::job::{Job, JobId, Payload};

/// Number of jobs per status in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable, at-least-once job store shared by every queue in the process.
///
/// Every state transition must be atomic with respect to concurrent callers:
/// a job returned by [`claim`](QueueBackend::claim) is never handed to a
/// second caller while it is `Active`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a freshly created job.
    async fn push(&self, job: Job) -> Result<(), BackendError>;

    /// Claim the next eligible job of `queue`, oldest eligibility first,
    /// and mark it `Active`.
    async fn claim(&self, queue: &str) -> Result<Option<Job>, BackendError>;

    /// Mark an active job `Completed`.
    async fn complete(&self, id: JobId, result: Payload) -> Result<Job, BackendError>;

    /// Increment the attempt and make the job eligible again after `delay`.
    async fn retry(&self, id: JobId, delay: Duration, error: &str) -> Result<Job, BackendError>;

    /// Mark an active job permanently `Failed`.
    async fn fail(&self, id: JobId, error: &str) -> Result<Job, BackendError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BackendError>;

    /// Return jobs of `queue` that have been `Active` for longer than their
    /// own timeout to the waiting line, without consuming an attempt.
    /// Returns how many were reclaimed.
    async fn reclaim_stale(&self, _queue: &str) -> Result<u64, BackendError> {
        Ok(0)
    }

    /// Release connections. No further calls are made afterwards.
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
