//! Lifecycle notifications for logging and metrics subscribers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{BackendError, HandlerError};
use crate::job::{Job, Payload};

/// Receives job transitions from worker pools.
///
/// Calls are made inline on the worker's task. Implementations must return
/// quickly and must not block; anything slow belongs behind a channel
/// (see [`ChannelSink`]).
pub trait EventSink: Send + Sync {
    fn completed(&self, job: &Job, result: &Payload);

    /// A failed invocation was re-enqueued; `job` already carries the next attempt.
    fn retrying(&self, _job: &Job, _error: &HandlerError) {}

    /// The final attempt failed.
    fn failed(&self, job: &Job, error: &HandlerError);

    /// Broker-level failure not tied to a single job.
    fn error(&self, queue: &str, error: &BackendError);
}

/// Owned form of a notification, as delivered through [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Completed { job: Job, result: Payload },
    Retrying { job: Job, error: HandlerError },
    Failed { job: Job, error: HandlerError },
    Error { queue: String, error: String },
}

impl JobEvent {
    pub fn queue(&self) -> &str {
        match self {
            Self::Completed { job, .. } | Self::Retrying { job, .. } | Self::Failed { job, .. } => {
                &job.queue_name
            }
            Self::Error { queue, .. } => queue,
        }
    }
}

/// Logs every transition through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn completed(&self, job: &Job, _result: &Payload) {
        info!(queue = %job.queue_name, job_id = %job.id, attempt = job.attempt, "Job completed");
    }

    fn retrying(&self, job: &Job, error: &HandlerError) {
        warn!(
            queue = %job.queue_name,
            job_id = %job.id,
            next_attempt = job.attempt,
            max_attempts = job.max_attempts(),
            error = %error,
            "Job failed, retry scheduled"
        );
    }

    fn failed(&self, job: &Job, error: &HandlerError) {
        error!(
            queue = %job.queue_name,
            job_id = %job.id,
            attempts = job.attempt,
            error = %error,
            "Job failed permanently"
        );
    }

    fn error(&self, queue: &str, error: &BackendError) {
        error!(queue = %queue, error = %error, "Queue error");
    }
}

/// Forwards events into a bounded channel. When the subscriber falls behind
/// the event is dropped rather than stalling job execution.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn send(&self, event: JobEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(queue = %event.queue(), "Event subscriber lagging, dropping event");
                }
                // Subscriber went away; nothing left to notify
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

impl EventSink for ChannelSink {
    fn completed(&self, job: &Job, result: &Payload) {
        self.send(JobEvent::Completed {
            job: job.clone(),
            result: result.clone(),
        });
    }

    fn retrying(&self, job: &Job, error: &HandlerError) {
        self.send(JobEvent::Retrying {
            job: job.clone(),
            error: error.clone(),
        });
    }

    fn failed(&self, job: &Job, error: &HandlerError) {
        self.send(JobEvent::Failed {
            job: job.clone(),
            error: error.clone(),
        });
    }

    fn error(&self, queue: &str, error: &BackendError) {
        self.send(JobEvent::Error {
            queue: queue.to_string(),
            error: error.to_string(),
        });
    }
}

/// Delivers each event to several subscribers. A subscriber that panics is
/// logged and skipped; the others still receive the event.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each(&self, kind: &str, f: impl Fn(&dyn EventSink)) {
        for sink in &self.sinks {
            if catch_unwind(AssertUnwindSafe(|| f(sink.as_ref()))).is_err() {
                error!(event = kind, "Event subscriber panicked");
            }
        }
    }
}

impl EventSink for Fanout {
    fn completed(&self, job: &Job, result: &Payload) {
        self.each("completed", |s| s.completed(job, result));
    }

    fn retrying(&self, job: &Job, error: &HandlerError) {
        self.each("retrying", |s| s.retrying(job, error));
    }

    fn failed(&self, job: &Job, error: &HandlerError) {
        self.each("failed", |s| s.failed(job, error));
    }

    fn error(&self, queue: &str, error: &BackendError) {
        self.each("error", |s| s.error(queue, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn completed(&self, _job: &Job, _result: &Payload) {
            panic!("subscriber bug");
        }

        fn failed(&self, _job: &Job, _error: &HandlerError) {}

        fn error(&self, _queue: &str, _error: &BackendError) {}
    }

    fn job() -> Job {
        Job::new("emails", json!({}), JobOptions::default())
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_events() {
        let (sink, mut rx) = ChannelSink::new(8);
        let job = job();

        sink.completed(&job, &json!({"success": true}));
        sink.error("emails", &BackendError::backend("connection reset"));

        match rx.recv().await.unwrap() {
            JobEvent::Completed { job: got, result } => {
                assert_eq!(got.id, job.id);
                assert_eq!(result, json!({"success": true}));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let error = rx.recv().await.unwrap();
        assert_eq!(error.queue(), "emails");
        assert!(matches!(error, JobEvent::Error { .. }));
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        let job = job();
        let error = HandlerError::failed("boom");

        // Neither call may block even though nobody is receiving
        sink.failed(&job, &error);
        sink.failed(&job, &error);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        sink.completed(&job(), &json!(null));
    }

    #[tokio::test]
    async fn test_fanout_survives_panicking_subscriber() {
        let (channel, mut rx) = ChannelSink::new(4);
        let fanout = Fanout::new().with(PanickingSink).with(channel);
        assert_eq!(fanout.len(), 2);

        fanout.completed(&job(), &json!({}));

        assert!(matches!(rx.recv().await, Some(JobEvent::Completed { .. })));
    }
}
