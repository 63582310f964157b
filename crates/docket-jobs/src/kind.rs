//! The three job kinds, their queue presets and typed producers.

use docket_queue::{Job, QueueConfig, QueueRegistry, QueueResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const QUESTION_QUEUE: &str = "question-processing";
pub const DOCUMENT_QUEUE: &str = "document-generation";
pub const EMAIL_QUEUE: &str = "email-sending";

/// Process-wide defaults that feed the presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    /// Concurrency of the question queue.
    pub concurrency: usize,
    /// Attempts for the question queue.
    pub max_attempts: u32,
    /// Timeout for the question queue.
    pub timeout: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            timeout: Duration::from_millis(300_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Question,
    Document,
    Email,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [Self::Question, Self::Document, Self::Email];

    pub fn queue_name(self) -> &'static str {
        match self {
            Self::Question => QUESTION_QUEUE,
            Self::Document => DOCUMENT_QUEUE,
            Self::Email => EMAIL_QUEUE,
        }
    }

    pub fn from_queue(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.queue_name() == name)
    }

    /// Queue configuration for this kind. Documents are heavy and run two at
    /// a time with a long timeout; email is light and runs wide.
    pub fn queue_config(self, defaults: &JobDefaults) -> QueueConfig {
        let config = QueueConfig::new(self.queue_name());
        match self {
            Self::Question => config
                .with_concurrency(defaults.concurrency)
                .with_max_attempts(defaults.max_attempts)
                .with_backoff_base(Duration::from_millis(2000))
                .with_timeout(defaults.timeout),
            Self::Document => config
                .with_concurrency(2)
                .with_max_attempts(3)
                .with_backoff_base(Duration::from_millis(2000))
                .with_timeout(Duration::from_millis(600_000)),
            Self::Email => config
                .with_concurrency(10)
                .with_max_attempts(5)
                .with_backoff_base(Duration::from_millis(1000))
                .with_timeout(Duration::from_millis(30_000)),
        }
    }

    /// Enqueue a typed payload on the queue its kind belongs to.
    pub async fn enqueue<P: JobPayload>(registry: &QueueRegistry, payload: &P) -> QueueResult<Job> {
        registry
            .get(P::KIND.queue_name())?
            .enqueue_payload(payload)
            .await
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Payload type bound to one job kind.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const KIND: JobKind;
}
