//! In-memory queue implementation with delayed eligibility

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::backend::{QueueBackend, QueueCounts};
use crate::error::BackendError;
use crate::job::{Job, JobId, JobStatus, Payload};

/// Completed and failed jobs kept for lookup before the oldest are evicted.
pub const DEFAULT_RETENTION: usize = 10_000;

/// Heap entry ordered by eligibility time, then insertion order.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earliest run_at (then lowest seq) on top
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct State {
    jobs: HashMap<JobId, Job>,
    ready: HashMap<String, BinaryHeap<ReadyEntry>>,
    /// Sequence of the live heap entry of each waiting job.
    scheduled: HashMap<JobId, u64>,
    /// Terminal jobs, oldest first.
    finished: VecDeque<JobId>,
    /// Completed and failed totals per queue, evicted jobs included.
    settled: HashMap<String, QueueCounts>,
    retention: usize,
    seq: u64,
    /// Never moves backwards, even if the wall clock does.
    clock: DateTime<Utc>,
}

impl State {
    fn new(retention: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            ready: HashMap::new(),
            scheduled: HashMap::new(),
            finished: VecDeque::new(),
            settled: HashMap::new(),
            retention,
            seq: 0,
            clock: DateTime::<Utc>::MIN_UTC,
        }
    }

    fn now(&mut self) -> DateTime<Utc> {
        self.clock = self.clock.max(Utc::now());
        self.clock
    }

    fn schedule(&mut self, queue: &str, id: JobId, run_at: DateTime<Utc>) {
        let floor = self.now();
        self.seq += 1;
        let entry = ReadyEntry {
            run_at: run_at.max(floor),
            seq: self.seq,
            id,
        };
        self.scheduled.insert(id, self.seq);
        self.ready.entry(queue.to_string()).or_default().push(entry);
    }

    fn active_mut(&mut self, id: JobId) -> Result<&mut Job, BackendError> {
        match self.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Active => Ok(job),
            _ => Err(BackendError::NotFound(id)),
        }
    }

    /// Record a terminal job and evict the oldest beyond the retention limit.
    fn finish(&mut self, job: &Job) {
        let totals = self.settled.entry(job.queue_name.clone()).or_default();
        match job.status {
            JobStatus::Completed => totals.completed += 1,
            JobStatus::Failed => totals.failed += 1,
            JobStatus::Waiting | JobStatus::Active => return,
        }

        self.finished.push_back(job.id);
        while self.finished.len() > self.retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }
}

/// Process-local broker. Loses everything on restart; meant for tests and
/// single-process development. Only the most recent terminal jobs are kept
/// for [`get`](QueueBackend::get); counts still include evicted ones.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` completed or failed jobs.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(State::new(retention)),
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, job: Job) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.schedule(&job.queue_name, job.id, job.run_at);
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, BackendError> {
        let mut guard = self.state.lock().await;
        let now = guard.now();
        let state = &mut *guard;

        let Some(heap) = state.ready.get_mut(queue) else {
            return Ok(None);
        };

        while let Some(entry) = heap.peek() {
            if entry.run_at > now {
                break;
            }
            let Some(entry) = heap.pop() else { break };

            // Entries left behind by an earlier schedule of the same job are skipped
            if state.scheduled.get(&entry.id) != Some(&entry.seq) {
                continue;
            }
            if let Some(job) = state.jobs.get_mut(&entry.id) {
                if job.status == JobStatus::Waiting {
                    state.scheduled.remove(&entry.id);
                    job.start(now);
                    return Ok(Some(job.clone()));
                }
            }
        }

        Ok(None)
    }

    async fn complete(&self, id: JobId, result: Payload) -> Result<Job, BackendError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let job = state.active_mut(id)?;
        job.complete(now, result);
        let job = job.clone();
        state.finish(&job);
        Ok(job)
    }

    async fn retry(&self, id: JobId, delay: Duration, error: &str) -> Result<Job, BackendError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let job = state.active_mut(id)?;
        if job.attempt >= job.max_attempts() {
            return Err(BackendError::Backend(format!(
                "job {id} has no attempts left"
            )));
        }
        job.schedule_retry(now, delay, error);
        let job = job.clone();

        tracing::debug!(
            job_id = %id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "Re-queuing job with backoff"
        );

        state.schedule(&job.queue_name, id, job.run_at);
        Ok(job)
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Job, BackendError> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let job = state.active_mut(id)?;
        job.fail(now, error);
        let job = job.clone();
        state.finish(&job);
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BackendError> {
        let state = self.state.lock().await;
        let mut counts = state.settled.get(queue).copied().unwrap_or_default();
        for job in state.jobs.values().filter(|j| j.queue_name == queue) {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        Ok(counts)
    }

    async fn reclaim_stale(&self, queue: &str) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        let now = state.now();

        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue && job.is_stale(now))
            .map(|job| job.id)
            .collect();

        for id in &stale {
            if let Some(job) = state.jobs.get_mut(id) {
                job.reclaim(now);
            }
            state.schedule(queue, *id, now);
        }

        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    fn job(queue: &str) -> Job {
        Job::new(queue, json!({ "foo": "bar" }), JobOptions::default())
    }

    #[tokio::test]
    async fn test_push_claim() {
        let queue = MemoryQueue::new();
        let pushed = job("test");
        queue.push(pushed.clone()).await.unwrap();

        let counts = queue.counts("test").await.unwrap();
        assert_eq!(counts.waiting, 1);

        let claimed = queue.claim("test").await.unwrap().expect("Should have job");
        assert_eq!(claimed.id, pushed.id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert!(claimed.started_at.is_some());

        // Claimed jobs are not handed out twice
        assert!(queue.claim("test").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let queue = MemoryQueue::new();
        let ids: Vec<JobId> = {
            let mut ids = Vec::new();
            for _ in 0..5 {
                let j = job("fifo");
                ids.push(j.id);
                queue.push(j).await.unwrap();
            }
            ids
        };

        for expected in ids {
            let claimed = queue.claim("fifo").await.unwrap().unwrap();
            assert_eq!(claimed.id, expected);
        }
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = MemoryQueue::new();
        queue.push(job("a")).await.unwrap();

        assert!(queue.claim("b").await.unwrap().is_none());
        assert!(queue.claim("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delayed_job() {
        let queue = MemoryQueue::new();
        let delayed = job("delayed").delayed(Duration::from_millis(200));
        queue.push(delayed.clone()).await.unwrap();

        assert!(queue.claim("delayed").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;

        let claimed = queue.claim("delayed").await.unwrap().expect("Should have delayed job");
        assert_eq!(claimed.id, delayed.id);
    }

    #[tokio::test]
    async fn test_retry_respects_delay_and_increments_attempt() {
        let queue = MemoryQueue::new();
        let j = job("retry");
        queue.push(j.clone()).await.unwrap();
        queue.claim("retry").await.unwrap().unwrap();

        let requeued = queue
            .retry(j.id, Duration::from_millis(150), "boom")
            .await
            .unwrap();
        assert_eq!(requeued.attempt, 2);
        assert_eq!(requeued.status, JobStatus::Waiting);
        assert_eq!(requeued.last_error.as_deref(), Some("boom"));

        assert!(queue.claim("retry").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let again = queue.claim("retry").await.unwrap().unwrap();
        assert_eq!(again.id, j.id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_refused_on_last_attempt() {
        let queue = MemoryQueue::new();
        let j = Job::new("q", json!({}), JobOptions::default().with_max_attempts(1));
        queue.push(j.clone()).await.unwrap();
        queue.claim("q").await.unwrap().unwrap();

        assert!(queue.retry(j.id, Duration::ZERO, "boom").await.is_err());

        let failed = queue.fail(j.id, "boom").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt, 1);
    }

    #[tokio::test]
    async fn test_complete_requires_active() {
        let queue = MemoryQueue::new();
        let j = job("q");
        queue.push(j.clone()).await.unwrap();

        let err = queue.complete(j.id, json!(null)).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(id) if id == j.id));

        queue.claim("q").await.unwrap().unwrap();
        let done = queue.complete(j.id, json!({"ok": true})).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let counts = queue.counts("q").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting + counts.active + counts.failed, 0);
    }

    #[tokio::test]
    async fn test_reclaim_uses_each_jobs_own_timeout() {
        let queue = MemoryQueue::new();
        let short = Job::new("q", json!({}), JobOptions::default().with_timeout(Duration::from_millis(20)));
        let long = Job::new("q", json!({}), JobOptions::default().with_timeout(Duration::from_secs(60)));
        queue.push(short.clone()).await.unwrap();
        queue.push(long.clone()).await.unwrap();
        queue.claim("q").await.unwrap().unwrap();
        queue.claim("q").await.unwrap().unwrap();

        // Neither has run out yet
        assert_eq!(queue.reclaim_stale("q").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(queue.reclaim_stale("q").await.unwrap(), 1);

        let reclaimed = queue.claim("q").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, short.id);
        assert_eq!(reclaimed.attempt, 1);

        let still_running = queue.get(long.id).await.unwrap().unwrap();
        assert_eq!(still_running.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_reclaim_ignores_other_queues() {
        let queue = MemoryQueue::new();
        let j = Job::new("a", json!({}), JobOptions::default().with_timeout(Duration::from_millis(1)));
        queue.push(j).await.unwrap();
        queue.claim("a").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.reclaim_stale("b").await.unwrap(), 0);
        assert_eq!(queue.reclaim_stale("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backdated_run_at_keeps_push_order() {
        let queue = MemoryQueue::new();
        let first = job("q");
        // As if the wall clock stepped back between the two enqueues
        let mut second = job("q");
        second.run_at = first.run_at - chrono::Duration::seconds(10);
        second.enqueued_at = second.run_at;
        queue.push(first.clone()).await.unwrap();
        queue.push(second.clone()).await.unwrap();

        assert_eq!(queue.claim("q").await.unwrap().unwrap().id, first.id);
        assert_eq!(queue.claim("q").await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_finished_jobs() {
        let queue = MemoryQueue::with_retention(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let j = job("q");
            ids.push(j.id);
            queue.push(j).await.unwrap();
        }
        for id in &ids {
            queue.claim("q").await.unwrap().unwrap();
            queue.complete(*id, json!(null)).await.unwrap();
        }

        assert!(queue.get(ids[0]).await.unwrap().is_none());
        assert!(queue.get(ids[1]).await.unwrap().is_some());
        assert!(queue.get(ids[2]).await.unwrap().is_some());

        // Totals survive eviction
        let counts = queue.counts("q").await.unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.waiting + counts.active, 0);
    }

    #[tokio::test]
    async fn test_retention_never_evicts_unfinished_jobs() {
        let queue = MemoryQueue::with_retention(0);
        let pending = job("q");
        let done = job("q");
        queue.push(done.clone()).await.unwrap();
        queue.push(pending.clone()).await.unwrap();
        queue.claim("q").await.unwrap().unwrap();
        queue.fail(done.id, "boom").await.unwrap();

        assert!(queue.get(done.id).await.unwrap().is_none());
        assert_eq!(queue.get(pending.id).await.unwrap().unwrap().status, JobStatus::Waiting);
        assert_eq!(queue.counts("q").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let queue = MemoryQueue::new();
        assert!(queue.claim("nothing").await.unwrap().is_none());
    }
}
