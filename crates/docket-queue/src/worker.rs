//! Worker Pool for processing jobs

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{BackendError, HandlerError, QueueError, QueueResult};
use crate::events::EventSink;
use crate::handler::{HandlerResult, JobHandler};
use crate::job::Job;
use crate::queue::{InFlight, Queue};
use crate::retry::RetryDecision;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue has nothing eligible.
    pub poll_interval: Duration,
    /// Sleep after a broker error before polling again.
    pub error_backoff: Duration,
    /// Log a warning once when an invocation runs longer than this.
    /// Diagnostic only; never fails the job.
    pub slow_job_warning: Option<Duration>,
    /// On start, return jobs stuck in `Active` past their own timeout
    /// (left behind by a crashed or force-stopped process) to the queue.
    pub reclaim_stale: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            slow_job_warning: Some(Duration::from_secs(5)),
            reclaim_stale: true,
        }
    }
}

/// Executes the jobs of one queue with at most `concurrency` running at once.
pub struct WorkerPool {
    queue: Arc<Queue>,
    dispatcher: JoinHandle<()>,
    executions: Arc<Mutex<JoinSet<()>>>,
}

impl WorkerPool {
    /// Spawn the dispatch loop. The queue must already have a handler.
    pub fn start(
        queue: Arc<Queue>,
        sink: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> QueueResult<Self> {
        let handler = queue.handler().ok_or_else(|| {
            QueueError::InvalidConfiguration(format!(
                "no handler registered for queue '{}'",
                queue.name()
            ))
        })?;

        let executions = Arc::new(Mutex::new(JoinSet::new()));
        let dispatcher = Dispatcher {
            queue: queue.clone(),
            handler,
            sink,
            config,
            semaphore: Arc::new(Semaphore::new(queue.concurrency())),
            executions: executions.clone(),
        };
        let dispatcher = tokio::spawn(dispatcher.run());

        info!(
            queue = %queue.name(),
            concurrency = queue.concurrency(),
            "Worker pool started"
        );

        Ok(Self {
            queue,
            dispatcher,
            executions,
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// Abort the dispatcher and every running execution. Aborted jobs are
    /// not settled and stay `Active` in the broker. Returns how many
    /// executions were still running; a claim the dispatcher had not yet
    /// handed off is not counted.
    pub fn abort(&self) -> usize {
        self.queue.stop();
        self.dispatcher.abort();

        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while executions.try_join_next().is_some() {}
        let abandoned = executions.len();
        executions.abort_all();
        abandoned
    }

    /// Wait for the dispatch loop to exit (after the queue is stopped or the
    /// pool aborted).
    pub async fn join(self) {
        if let Err(e) = self.dispatcher.await {
            if e.is_panic() {
                error!(queue = %self.queue.name(), "Worker dispatcher panicked");
            }
        }
    }
}

struct Dispatcher {
    queue: Arc<Queue>,
    handler: Arc<dyn JobHandler>,
    sink: Arc<dyn EventSink>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    executions: Arc<Mutex<JoinSet<()>>>,
}

impl Dispatcher {
    async fn run(self) {
        let mut closed = self.queue.subscribe_closed();

        if self.config.reclaim_stale {
            self.reclaim().await;
        }

        loop {
            if *closed.borrow() {
                break;
            }

            // A slot is taken before dequeuing so the concurrency bound holds
            // even between claim and spawn
            let permit = tokio::select! {
                _ = closed.changed() => continue,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.claim().await {
                Ok(Some((job, slot))) => self.spawn(job, slot, permit),
                Ok(None) => {
                    drop(permit);
                    self.pause(&mut closed, self.config.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %self.queue.name(), error = %e, "Error dequeuing job");
                    if let QueueError::Backend(backend) = &e {
                        self.sink.error(self.queue.name(), backend);
                    }
                    self.pause(&mut closed, self.config.error_backoff).await;
                }
            }
        }

        debug!(queue = %self.queue.name(), "Dispatcher stopped");
    }

    async fn pause(&self, closed: &mut watch::Receiver<bool>, duration: Duration) {
        tokio::select! {
            _ = closed.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn reclaim(&self) {
        match self.queue.backend().reclaim_stale(self.queue.name()).await {
            Ok(0) => {}
            Ok(count) => {
                warn!(queue = %self.queue.name(), count = count, "Reclaimed jobs abandoned in active state");
            }
            Err(e) => {
                error!(queue = %self.queue.name(), error = %e, "Failed to reclaim stale jobs");
                self.sink.error(self.queue.name(), &e);
            }
        }
    }

    fn spawn(&self, job: Job, slot: InFlight, permit: OwnedSemaphorePermit) {
        let execution = Execution {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            sink: self.sink.clone(),
            slow_job_warning: self.config.slow_job_warning,
        };
        let span = info_span!(
            "job",
            queue = %job.queue_name,
            job_id = %job.id,
            attempt = job.attempt
        );

        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Reap finished executions so the set only holds running ones
        while executions.try_join_next().is_some() {}
        executions.spawn(
            async move {
                execution.run(job).await;
                drop(slot);
                drop(permit);
            }
            .instrument(span),
        );
    }
}

struct Execution {
    queue: Arc<Queue>,
    handler: Arc<dyn JobHandler>,
    sink: Arc<dyn EventSink>,
    slow_job_warning: Option<Duration>,
}

impl Execution {
    async fn run(self, job: Job) {
        debug!("Processing job");
        let outcome = self.invoke(job.clone()).await;
        self.settle(job, outcome).await;
    }

    /// Run the handler on its own task so panics are contained and a
    /// timed-out invocation can be abandoned.
    async fn invoke(&self, job: Job) -> HandlerResult {
        let timeout = job.options.timeout();
        let deadline = Instant::now() + timeout;
        let handler = self.handler.clone();
        let mut guard = AbortOnDrop(tokio::spawn(async move { handler.handle(job).await }));
        let task = &mut guard.0;

        if let Some(threshold) = self.slow_job_warning.filter(|t| *t < timeout) {
            tokio::select! {
                joined = &mut *task => return flatten(joined),
                _ = tokio::time::sleep(threshold) => {
                    warn!(
                        threshold_ms = threshold.as_millis() as u64,
                        timeout_ms = timeout.as_millis() as u64,
                        "Job has been running longer than expected"
                    );
                }
            }
        }

        match tokio::time::timeout_at(deadline, &mut *task).await {
            Ok(joined) => flatten(joined),
            Err(_) => Err(HandlerError::TimedOut(timeout)),
        }
    }

    async fn settle(&self, job: Job, outcome: HandlerResult) {
        let backend = self.queue.backend();

        match outcome {
            Ok(result) => match backend.complete(job.id, result.clone()).await {
                Ok(done) => {
                    debug!("Job completed");
                    self.sink.completed(&done, &result);
                }
                Err(e) => self.report(e),
            },
            Err(err) => match job.retry_policy().decide(job.attempt) {
                RetryDecision::Retry { delay } => {
                    match backend.retry(job.id, delay, &err.to_string()).await {
                        Ok(requeued) => {
                            warn!(
                                error = %err,
                                next_attempt = requeued.attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Job failed, scheduling retry with backoff"
                            );
                            self.sink.retrying(&requeued, &err);
                        }
                        Err(e) => self.report(e),
                    }
                }
                RetryDecision::GiveUp => match backend.fail(job.id, &err.to_string()).await {
                    Ok(failed) => {
                        error!(error = %err, attempts = failed.attempt, "Job failed after final attempt");
                        self.sink.failed(&failed, &err);
                    }
                    Err(e) => self.report(e),
                },
            },
        }
    }

    /// The job stays `Active` in the broker; reclaim picks it up later.
    fn report(&self, e: BackendError) {
        error!(error = %e, "Failed to record job outcome");
        self.sink.error(self.queue.name(), &e);
    }
}

/// Handler task that is cancelled when its execution is dropped: on timeout,
/// or when the pool is aborted.
struct AbortOnDrop(JoinHandle<HandlerResult>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn flatten(joined: Result<HandlerResult, JoinError>) -> HandlerResult {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
        Err(e) => Err(HandlerError::Failed(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.poll_interval.as_millis() > 0);
        assert_eq!(config.slow_job_warning, Some(Duration::from_secs(5)));
        assert!(config.reclaim_stale);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic");
    }
}
