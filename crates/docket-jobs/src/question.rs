//! Answer a user's legal-information question.

use async_trait::async_trait;
use docket_queue::{HandlerError, HandlerResult, Job, JobHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::kind::{JobKind, JobPayload};
use crate::provider::{AnswerProvider, AnswerRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPayload {
    pub question_id: String,
    pub question_text: String,
    pub area_of_law: String,
    pub province: String,
    pub user_id: String,
}

impl JobPayload for QuestionPayload {
    const KIND: JobKind = JobKind::Question;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub success: bool,
    pub question_id: String,
    pub answer: String,
}

/// Handler for `question-processing`.
#[derive(Debug, Clone)]
pub struct ProcessQuestion {
    provider: Arc<dyn AnswerProvider>,
}

impl ProcessQuestion {
    pub fn new(provider: Arc<dyn AnswerProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for ProcessQuestion {
    async fn handle(&self, job: Job) -> HandlerResult {
        let payload: QuestionPayload = job.payload_as()?;
        info!(
            question_id = %payload.question_id,
            user_id = %payload.user_id,
            provider = self.provider.name(),
            "Processing question"
        );

        let request = AnswerRequest {
            question_text: payload.question_text,
            area_of_law: payload.area_of_law,
            province: payload.province,
        };
        let answer = self
            .provider
            .answer(&request)
            .await
            .map_err(HandlerError::failed)?;

        info!(question_id = %payload.question_id, model = %answer.model, "Question processed successfully");

        Ok(serde_json::to_value(QuestionResult {
            success: true,
            question_id: payload.question_id,
            answer: answer.text,
        })?)
    }
}
