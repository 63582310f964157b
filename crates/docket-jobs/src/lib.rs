//! # Docket Jobs
//!
//! The job types run by the docket worker:
//! - `question-processing`: answer a legal-information question
//! - `document-generation`: produce a document for an answered question
//! - `email-sending`: deliver a notification email
//!
//! Each handler delegates the external work to a pluggable collaborator
//! ([`AnswerProvider`], [`DocumentRenderer`], [`Mailer`]).

pub mod document;
pub mod email;
pub mod kind;
pub mod openai;
pub mod provider;
pub mod question;
pub mod sink;

use docket_queue::{QueueRegistry, QueueResult};
use std::sync::Arc;
use tracing::info;

pub use document::{
    DocumentPayload, DocumentRenderer, DocumentResult, GenerateDocument, PlaceholderRenderer,
};
pub use email::{EmailPayload, EmailResult, LogMailer, Mailer, SendEmail};
pub use kind::{JobDefaults, JobKind, JobPayload, DOCUMENT_QUEUE, EMAIL_QUEUE, QUESTION_QUEUE};
pub use openai::OpenAiProvider;
pub use provider::{Answer, AnswerProvider, AnswerRequest, ProviderError, StaticAnswerProvider};
pub use question::{ProcessQuestion, QuestionPayload, QuestionResult};
pub use sink::JobLogSink;

/// External collaborators used by the handlers.
#[derive(Debug, Clone)]
pub struct Services {
    pub answers: Arc<dyn AnswerProvider>,
    pub documents: Arc<dyn DocumentRenderer>,
    pub mailer: Arc<dyn Mailer>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            answers: Arc::new(StaticAnswerProvider::default()),
            documents: Arc::new(PlaceholderRenderer),
            mailer: Arc::new(LogMailer),
        }
    }
}

/// Register the three queues with their presets and bind their handlers.
pub fn register_queues(
    registry: &mut QueueRegistry,
    defaults: &JobDefaults,
    services: Services,
) -> QueueResult<()> {
    for kind in JobKind::ALL {
        let queue = registry.register(kind.queue_config(defaults))?;
        match kind {
            JobKind::Question => {
                queue.register_handler(ProcessQuestion::new(services.answers.clone()))?
            }
            JobKind::Document => {
                queue.register_handler(GenerateDocument::new(services.documents.clone()))?
            }
            JobKind::Email => queue.register_handler(SendEmail::new(services.mailer.clone()))?,
        }
        info!(
            queue = %kind,
            concurrency = queue.concurrency(),
            max_attempts = queue.defaults().max_attempts,
            timeout_ms = queue.defaults().timeout_ms,
            "Queue registered"
        );
    }
    Ok(())
}
