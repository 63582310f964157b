//! Job definitions

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{HandlerError, QueueError};
use crate::retry::RetryPolicy;

/// Job Identifier
pub type JobId = Uuid;

/// Opaque job payload.
pub type Payload = serde_json::Value;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue (first attempt or scheduled retry)
    Waiting,
    /// Claimed by a worker slot
    Active,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Retry and timeout options, fixed on a job when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub timeout_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            timeout_ms: 300_000,
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = duration_ms(base);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject options a job could never run under.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_attempts == 0 {
            return Err(QueueError::invalid("max_attempts must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(QueueError::invalid("timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Per-job overrides applied on top of a queue's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub timeout: Option<Duration>,
    /// Keep the first attempt out of reach until this much time has passed.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn apply(&self, defaults: JobOptions) -> JobOptions {
        JobOptions {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_base_ms: self
                .backoff_base
                .map(duration_ms)
                .unwrap_or(defaults.backoff_base_ms),
            timeout_ms: self.timeout.map(duration_ms).unwrap_or(defaults.timeout_ms),
        }
    }
}

/// A unit of deferred work and its execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub payload: Payload,
    /// Current attempt, counted from 1.
    pub attempt: u32,
    pub options: JobOptions,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<Payload>,
}

impl Job {
    pub fn new(queue_name: impl Into<String>, payload: Payload, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            payload,
            attempt: 1,
            options,
            status: JobStatus::Waiting,
            enqueued_at: now,
            run_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Push the first eligibility time back by `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.run_at = self.enqueued_at + chrono_duration(delay);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_options(&self.options)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.run_at <= now
    }

    /// Deserialize the payload into the handler's own type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        debug_assert_eq!(self.status, JobStatus::Waiting);
        self.status = JobStatus::Active;
        self.started_at = Some(now);
    }

    pub fn complete(&mut self, now: DateTime<Utc>, result: Payload) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.last_error = None;
        self.result = Some(result);
    }

    /// Put the job back in line for its next attempt.
    pub fn schedule_retry(&mut self, now: DateTime<Utc>, delay: Duration, error: &str) {
        debug_assert!(self.attempt < self.options.max_attempts);
        self.attempt += 1;
        self.status = JobStatus::Waiting;
        self.finished_at = Some(now);
        self.run_at = now + chrono_duration(delay);
        self.last_error = Some(error.to_string());
    }

    pub fn fail(&mut self, now: DateTime<Utc>, error: &str) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(now);
        self.last_error = Some(error.to_string());
    }

    /// Still `Active` after its own timeout has run out: nobody is executing
    /// it any more.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self
                .started_at
                .is_some_and(|started| started + chrono_duration(self.options.timeout()) <= now)
    }

    /// Return a job abandoned in `Active` to the waiting line. The
    /// interrupted invocation does not consume an attempt.
    pub fn reclaim(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Waiting;
        self.run_at = now;
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("emails", json!({"to": "a@example.com"}), JobOptions::default());

        assert_eq!(job.queue_name, "emails");
        assert_eq!(job.attempt, 1);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.run_at, job.enqueued_at);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn test_delayed_job_not_ready() {
        let job = Job::new("emails", json!({}), JobOptions::default())
            .delayed(Duration::from_secs(60));
        assert!(!job.is_ready(Utc::now()));
        assert!(job.is_ready(job.enqueued_at + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_lifecycle_retry_then_complete() {
        let mut job = Job::new("q", json!({}), JobOptions::default());
        let now = Utc::now();

        job.start(now);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.started_at, Some(now));

        job.schedule_retry(now, Duration::from_secs(2), "boom");
        assert_eq!(job.attempt, 2);
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.run_at, now + chrono::Duration::seconds(2));
        assert!(!job.is_ready(now));

        job.start(job.run_at);
        job.complete(job.run_at, json!({"ok": true}));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.last_error.is_none());
        assert_eq!(job.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_stale_uses_own_timeout() {
        let mut job = Job::new(
            "q",
            json!({}),
            JobOptions::default().with_timeout(Duration::from_secs(60)),
        );
        let now = Utc::now();
        assert!(!job.is_stale(now + chrono::Duration::hours(1)));

        job.start(now);
        assert!(!job.is_stale(now + chrono::Duration::seconds(59)));
        assert!(job.is_stale(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_enqueue_options_override_defaults() {
        let defaults = JobOptions::default();
        let options = EnqueueOptions::default()
            .max_attempts(5)
            .timeout(Duration::from_secs(30))
            .apply(defaults);

        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.timeout_ms, 30_000);
        assert_eq!(options.backoff_base_ms, defaults.backoff_base_ms);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = JobOptions::default().with_max_attempts(0).validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(JobOptions::default().with_timeout(Duration::ZERO).validate().is_err());
        assert!(JobOptions::default().validate().is_ok());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("dead_letter".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
    }

    #[test]
    fn test_payload_as_reports_invalid_payload() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Email {
            to: String,
        }

        let job = Job::new("emails", json!({"subject": "hi"}), JobOptions::default());
        let err = job.payload_as::<Email>().unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}
