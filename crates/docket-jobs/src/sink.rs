//! Per-kind completion and failure logging.

use docket_queue::{BackendError, EventSink, HandlerError, Job, Payload};
use tracing::{error, info, warn};

use crate::kind::JobKind;

/// Logs job outcomes with the payload field that identifies the job to an
/// operator (`questionId`, `documentId` or `to`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JobLogSink;

impl JobLogSink {
    fn key(kind: JobKind) -> &'static str {
        match kind {
            JobKind::Question => "questionId",
            JobKind::Document => "documentId",
            JobKind::Email => "to",
        }
    }

    fn label(kind: JobKind) -> &'static str {
        match kind {
            JobKind::Question => "Question processing",
            JobKind::Document => "Document generation",
            JobKind::Email => "Email sending",
        }
    }

    /// `(kind label, identifying key, identifying value)` for a job.
    fn describe(job: &Job) -> (&'static str, &'static str, String) {
        match JobKind::from_queue(&job.queue_name) {
            Some(kind) => {
                let key = Self::key(kind);
                let value = job
                    .payload
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or("<missing>")
                    .to_string();
                (Self::label(kind), key, value)
            }
            None => ("Job", "queue", job.queue_name.clone()),
        }
    }
}

impl EventSink for JobLogSink {
    fn completed(&self, job: &Job, _result: &Payload) {
        let (label, key, value) = Self::describe(job);
        info!(job_id = %job.id, key = key, value = %value, attempt = job.attempt, "{label} completed");
    }

    fn retrying(&self, job: &Job, err: &HandlerError) {
        let (label, key, value) = Self::describe(job);
        warn!(
            job_id = %job.id,
            key = key,
            value = %value,
            next_attempt = job.attempt,
            error = %err,
            "{label} failed, retrying"
        );
    }

    fn failed(&self, job: &Job, err: &HandlerError) {
        let (label, key, value) = Self::describe(job);
        error!(
            job_id = %job.id,
            key = key,
            value = %value,
            attempts = job.attempt,
            error = %err,
            "{label} failed"
        );
    }

    fn error(&self, queue: &str, err: &BackendError) {
        error!(queue = %queue, error = %err, "Queue error");
    }
}
