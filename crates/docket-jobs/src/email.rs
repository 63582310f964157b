//! Deliver a transactional email.

use async_trait::async_trait;
use docket_queue::{HandlerError, HandlerResult, Job, JobHandler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::kind::{JobKind, JobPayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

impl EmailPayload {
    fn validate(&self) -> Result<(), HandlerError> {
        if !self.to.contains('@') {
            return Err(HandlerError::InvalidPayload(format!(
                "invalid recipient '{}'",
                self.to
            )));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(HandlerError::InvalidPayload(
                "email needs a text or html body".to_string(),
            ));
        }
        Ok(())
    }
}

impl JobPayload for EmailPayload {
    const KIND: JobKind = JobKind::Email;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailResult {
    pub success: bool,
    pub to: String,
}

#[async_trait]
pub trait Mailer: Send + Sync + std::fmt::Debug {
    async fn send(&self, email: &EmailPayload) -> Result<(), HandlerError>;
}

/// Logs the message instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &EmailPayload) -> Result<(), HandlerError> {
        info!(to = %email.to, subject = %email.subject, "Mail delivery not configured, message logged only");
        Ok(())
    }
}

/// Handler for `email-sending`.
#[derive(Debug, Clone)]
pub struct SendEmail {
    mailer: Arc<dyn Mailer>,
}

impl SendEmail {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for SendEmail {
    async fn handle(&self, job: Job) -> HandlerResult {
        let payload: EmailPayload = job.payload_as()?;
        payload.validate()?;
        info!(to = %payload.to, subject = %payload.subject, "Sending email");

        self.mailer.send(&payload).await?;

        info!(to = %payload.to, subject = %payload.subject, "Email sent successfully");
        Ok(serde_json::to_value(EmailResult {
            success: true,
            to: payload.to,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> EmailPayload {
        EmailPayload {
            to: to.to_string(),
            subject: "Your answer is ready".to_string(),
            text: Some("Log in to read it.".to_string()),
            html: None,
        }
    }

    #[test]
    fn test_validate_recipient_and_body() {
        assert!(email("user@example.com").validate().is_ok());
        assert!(matches!(
            email("not-an-address").validate(),
            Err(HandlerError::InvalidPayload(_))
        ));

        let mut bodiless = email("user@example.com");
        bodiless.text = None;
        assert!(bodiless.validate().is_err());
    }

    #[test]
    fn test_optional_bodies_are_omitted() {
        let value = serde_json::to_value(email("user@example.com")).unwrap();
        assert_eq!(value["to"], "user@example.com");
        assert!(value.get("html").is_none());
    }
}
