//! Handler contract for queue consumers.

use async_trait::async_trait;
use std::future::Future;

use crate::error::HandlerError;
use crate::job::{Job, Payload};

/// Outcome of one handler invocation.
pub type HandlerResult = Result<Payload, HandlerError>;

/// The single function a queue runs for each of its jobs.
///
/// Handlers should be idempotent: delivery is at-least-once, and an
/// invocation that outlives its timeout is abandoned without notice.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> HandlerResult;
}

/// Adapts an async closure into a [`JobHandler`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Build a handler from `|job| async move { ... }`.
///
/// ```
/// use docket_queue::{handler_fn, Job};
///
/// let handler = handler_fn(|job: Job| async move {
///     Ok(serde_json::json!({ "echo": job.payload }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, job: Job) -> HandlerResult {
        (self.f)(job).await
    }
}
