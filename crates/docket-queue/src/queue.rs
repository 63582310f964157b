//! Named queues: default options, the registered handler and drain state.

use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::backend::{QueueBackend, QueueCounts};
use crate::error::{QueueError, QueueResult};
use crate::handler::JobHandler;
use crate::job::{EnqueueOptions, Job, JobId, JobOptions};

/// Static configuration of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum number of jobs of this queue executing at once.
    pub concurrency: usize,
    pub defaults: JobOptions,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 5,
            defaults: JobOptions::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.defaults.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.defaults = self.defaults.with_backoff_base(base);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.defaults = self.defaults.with_timeout(timeout);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.name.trim().is_empty() {
            return Err(QueueError::invalid("queue name must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(QueueError::invalid(format!(
                "queue '{}': concurrency must be at least 1",
                self.name
            )));
        }
        match self.defaults.validate() {
            Err(QueueError::InvalidConfiguration(message)) => Err(QueueError::invalid(format!(
                "queue '{}': {message}",
                self.name
            ))),
            other => other,
        }
    }
}

/// A named FIFO of jobs backed by the shared broker.
pub struct Queue {
    config: QueueConfig,
    backend: Arc<dyn QueueBackend>,
    handler: OnceLock<Arc<dyn JobHandler>>,
    closed: watch::Sender<bool>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .field("has_handler", &self.handler.get().is_some())
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Queue {
    pub fn new(config: QueueConfig, backend: Arc<dyn QueueBackend>) -> QueueResult<Self> {
        config.validate()?;
        let (closed, _) = watch::channel(false);
        let (in_flight, _) = watch::channel(0usize);
        Ok(Self {
            config,
            backend,
            handler: OnceLock::new(),
            closed,
            in_flight: Arc::new(in_flight),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub fn defaults(&self) -> JobOptions {
        self.config.defaults
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Bind the queue's handler. Only the first registration is accepted.
    pub fn register_handler(&self, handler: impl JobHandler) -> QueueResult<()> {
        self.handler
            .set(Arc::new(handler))
            .map_err(|_| {
                QueueError::invalid(format!(
                    "queue '{}' already has a handler registered",
                    self.config.name
                ))
            })?;
        debug!(queue = %self.config.name, "Handler registered");
        Ok(())
    }

    pub fn handler(&self) -> Option<Arc<dyn JobHandler>> {
        self.handler.get().cloned()
    }

    /// Enqueue with the queue's default options.
    pub async fn enqueue(&self, payload: serde_json::Value) -> QueueResult<Job> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    /// Enqueue a serializable payload.
    pub async fn enqueue_payload<T: Serialize>(&self, payload: &T) -> QueueResult<Job> {
        let value = serde_json::to_value(payload).map_err(crate::error::BackendError::from)?;
        self.enqueue(value).await
    }

    /// Enqueue with per-job overrides. Returns as soon as the broker has
    /// stored the job; succeeds even while the queue is closed for dequeue.
    pub async fn enqueue_with(
        &self,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<Job> {
        let job_options = options.apply(self.config.defaults);
        job_options.validate()?;

        let mut job = Job::new(&self.config.name, payload, job_options);
        if let Some(delay) = options.delay {
            job = job.delayed(delay);
        }

        self.backend.push(job.clone()).await?;
        debug!(queue = %self.config.name, job_id = %job.id, "Job enqueued");
        Ok(job)
    }

    pub async fn job(&self, id: JobId) -> QueueResult<Option<Job>> {
        let job = self.backend.get(id).await?;
        Ok(job.filter(|j| j.queue_name == self.config.name))
    }

    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        Ok(self.backend.counts(&self.config.name).await?)
    }

    /// Stop handing jobs to the worker pool. In-flight executions continue.
    pub fn stop(&self) {
        if !self.closed.send_replace(true) {
            info!(queue = %self.config.name, in_flight = self.in_flight(), "Queue closed for dequeue");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop dequeuing and wait until every in-flight execution has settled.
    pub async fn close(&self) {
        self.stop();
        self.drained().await;
    }

    /// Resolves once no execution of this queue is in flight.
    pub async fn drained(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Jobs claimed (or being claimed) and not yet settled.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Claim the next eligible job. The returned slot keeps the job counted
    /// as in flight until it is dropped.
    pub(crate) async fn claim(&self) -> QueueResult<Option<(Job, InFlight)>> {
        // Reserve before touching the broker so a concurrent drain waits for us
        let slot = InFlight::acquire(self.in_flight.clone());
        if self.is_closed() {
            return Ok(None);
        }
        Ok(self.backend.claim(&self.config.name).await?.map(|job| (job, slot)))
    }
}

/// Counts one execution as in flight for as long as it lives.
#[derive(Debug)]
pub(crate) struct InFlight {
    counter: Arc<watch::Sender<usize>>,
}

impl InFlight {
    fn acquire(counter: Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self { counter }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::memory::MemoryQueue;
    use crate::JobStatus;
    use serde_json::json;

    fn queue(config: QueueConfig) -> Queue {
        Queue::new(config, Arc::new(MemoryQueue::new())).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(QueueConfig::new("ok").validate().is_ok());
        assert!(QueueConfig::new("").validate().is_err());
        assert!(QueueConfig::new("q").with_concurrency(0).validate().is_err());

        let err = Queue::new(
            QueueConfig::new("q").with_max_attempts(0),
            Arc::new(MemoryQueue::new()),
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_enqueue_assigns_distinct_ids() {
        let q = queue(QueueConfig::new("emails"));
        let a = q.enqueue(json!({"to": "a@example.com"})).await.unwrap();
        let b = q.enqueue(json!({"to": "b@example.com"})).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.attempt, 1);
        assert_eq!(a.status, JobStatus::Waiting);
        assert_eq!(q.counts().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_enqueue_uses_defaults_and_overrides() {
        let q = queue(QueueConfig::new("docs").with_max_attempts(3));
        let default_job = q.enqueue(json!({})).await.unwrap();
        assert_eq!(default_job.max_attempts(), 3);

        let custom = q
            .enqueue_with(json!({}), EnqueueOptions::default().max_attempts(7))
            .await
            .unwrap();
        assert_eq!(custom.max_attempts(), 7);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_zero_attempts_override() {
        let q = queue(QueueConfig::new("docs"));
        let err = q
            .enqueue_with(json!({}), EnqueueOptions::default().max_attempts(0))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(q.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_second_handler_registration_fails() {
        let q = queue(QueueConfig::new("q"));
        q.register_handler(handler_fn(|_job| async { Ok(json!(null)) }))
            .unwrap();
        let err = q
            .register_handler(handler_fn(|_job| async { Ok(json!(null)) }))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(q.handler().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_while_closed_is_stored_not_claimed() {
        let q = queue(QueueConfig::new("q"));
        q.close().await;
        assert!(q.is_closed());

        let job = q.enqueue(json!({})).await.unwrap();
        assert!(q.claim().await.unwrap().is_none());
        assert_eq!(q.job(job.id).await.unwrap().unwrap().status, JobStatus::Waiting);
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_slot_tracks_claims() {
        let q = Arc::new(queue(QueueConfig::new("q")));
        q.enqueue(json!({})).await.unwrap();

        let (_job, slot) = q.claim().await.unwrap().unwrap();
        assert_eq!(q.in_flight(), 1);

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("close should finish once the slot is released")
            .unwrap();
        assert_eq!(q.in_flight(), 0);
    }
}
