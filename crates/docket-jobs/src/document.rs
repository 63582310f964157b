//! Generate a legal document from an answered question.

use async_trait::async_trait;
use docket_queue::{HandlerError, HandlerResult, Job, JobHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::kind::{JobKind, JobPayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    pub document_id: String,
    pub question_id: String,
    pub user_id: String,
    pub document_type: String,
}

impl JobPayload for DocumentPayload {
    const KIND: JobKind = JobKind::Document;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResult {
    pub success: bool,
    pub document_id: String,
}

/// Produces and stores the document for a request.
#[async_trait]
pub trait DocumentRenderer: Send + Sync + std::fmt::Debug {
    async fn render(&self, document: &DocumentPayload) -> Result<(), HandlerError>;
}

/// Records the request without producing a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

#[async_trait]
impl DocumentRenderer for PlaceholderRenderer {
    async fn render(&self, document: &DocumentPayload) -> Result<(), HandlerError> {
        info!(
            document_id = %document.document_id,
            question_id = %document.question_id,
            document_type = %document.document_type,
            "Document rendering not configured, skipping output"
        );
        Ok(())
    }
}

/// Handler for `document-generation`.
#[derive(Debug, Clone)]
pub struct GenerateDocument {
    renderer: Arc<dyn DocumentRenderer>,
}

impl GenerateDocument {
    pub fn new(renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl JobHandler for GenerateDocument {
    async fn handle(&self, job: Job) -> HandlerResult {
        let payload: DocumentPayload = job.payload_as()?;
        info!(
            document_id = %payload.document_id,
            document_type = %payload.document_type,
            user_id = %payload.user_id,
            "Generating document"
        );

        self.renderer.render(&payload).await?;

        info!(document_id = %payload.document_id, "Document generated successfully");
        Ok(serde_json::to_value(DocumentResult {
            success: true,
            document_id: payload.document_id,
        })?)
    }
}
