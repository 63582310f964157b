//! Answer provider trait and common types

use async_trait::async_trait;
use thiserror::Error;

/// Errors from answer providers
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Provider returned an empty answer")]
    EmptyAnswer,
}

/// System prompt sent with every question.
pub const SYSTEM_PROMPT: &str = "You are a helpful legal information assistant. Provide clear, \
accurate information while emphasizing you are not providing legal advice.";

/// A legal-information question to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRequest {
    pub question_text: String,
    pub area_of_law: String,
    pub province: String,
}

impl AnswerRequest {
    /// User prompt scoped to the asker's province and area of law.
    pub fn prompt(&self) -> String {
        format!(
            "You are a legal information assistant for forjustice.ca, helping users in {province}, \
Canada understand {area}.

User's question: {question}

Please provide a clear, accurate legal information response in plain language. Remember:
- This is legal information, not legal advice
- Be specific to {province} laws and procedures
- Use simple, accessible language
- Include relevant next steps or considerations
- Format for easy reading

Answer:",
            province = self.province,
            area = self.area_of_law,
            question = self.question_text,
        )
    }
}

/// Generated answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Model that produced the answer
    pub model: String,
}

/// Trait for answer providers
#[async_trait]
pub trait AnswerProvider: Send + Sync + std::fmt::Debug {
    /// Get the provider name
    fn name(&self) -> &str;

    async fn answer(&self, request: &AnswerRequest) -> Result<Answer, ProviderError>;
}

/// Returns a fixed answer. Used when no API key is configured, and in tests.
#[derive(Debug, Clone)]
pub struct StaticAnswerProvider {
    text: String,
}

impl StaticAnswerProvider {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for StaticAnswerProvider {
    fn default() -> Self {
        Self::new(
            "Automated answers are not configured. A legal information specialist will follow up \
on your question.",
        )
    }
}

#[async_trait]
impl AnswerProvider for StaticAnswerProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn answer(&self, _request: &AnswerRequest) -> Result<Answer, ProviderError> {
        Ok(Answer {
            text: self.text.clone(),
            model: "static".to_string(),
        })
    }
}
