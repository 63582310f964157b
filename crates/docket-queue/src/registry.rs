//! Startup-time registry of every queue in the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::QueueBackend;
use crate::error::{BackendError, QueueError, QueueResult};
use crate::events::EventSink;
use crate::job::{EnqueueOptions, Job};
use crate::queue::{Queue, QueueConfig};
use crate::worker::{WorkerConfig, WorkerPool};

/// Owns the queues and the broker they share. Built once at startup and
/// handed by reference to producers and the shutdown coordinator.
pub struct QueueRegistry {
    backend: Arc<dyn QueueBackend>,
    queues: BTreeMap<String, Arc<Queue>>,
}

impl QueueRegistry {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            queues: BTreeMap::new(),
        }
    }

    /// Create a queue. Names must be unique.
    pub fn register(&mut self, config: QueueConfig) -> QueueResult<Arc<Queue>> {
        if self.queues.contains_key(&config.name) {
            return Err(QueueError::InvalidConfiguration(format!(
                "queue '{}' is already registered",
                config.name
            )));
        }
        let queue = Arc::new(Queue::new(config, self.backend.clone())?);
        self.queues.insert(queue.name().to_string(), queue.clone());
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> QueueResult<&Arc<Queue>> {
        self.queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn queues(&self) -> impl Iterator<Item = &Arc<Queue>> {
        self.queues.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.queues.keys().map(String::as_str).collect()
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> QueueResult<Job> {
        self.get(queue)?.enqueue(payload).await
    }

    pub async fn enqueue_with(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<Job> {
        self.get(queue)?.enqueue_with(payload, options).await
    }

    /// Start one worker pool per queue. Fails without starting anything if a
    /// queue has no handler.
    pub fn start_workers(
        &self,
        sink: Arc<dyn EventSink>,
        config: WorkerConfig,
    ) -> QueueResult<Vec<WorkerPool>> {
        if let Some(queue) = self.queues().find(|q| q.handler().is_none()) {
            return Err(QueueError::InvalidConfiguration(format!(
                "no handler registered for queue '{}'",
                queue.name()
            )));
        }
        self.queues()
            .map(|queue| WorkerPool::start(queue.clone(), sink.clone(), config.clone()))
            .collect()
    }

    pub async fn close_backend(&self) -> Result<(), BackendError> {
        self.backend.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use crate::memory::MemoryQueue;
    use serde_json::json;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Arc::new(MemoryQueue::new()))
    }

    #[test]
    fn test_duplicate_queue_rejected() {
        let mut registry = registry();
        registry.register(QueueConfig::new("emails")).unwrap();
        let err = registry.register(QueueConfig::new("emails")).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(registry.names(), vec!["emails"]);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let registry = registry();
        let err = registry.enqueue("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_enqueue_routes_by_name() {
        let mut registry = registry();
        registry.register(QueueConfig::new("a")).unwrap();
        registry.register(QueueConfig::new("b")).unwrap();

        let job = registry.enqueue("b", json!({"n": 1})).await.unwrap();
        assert_eq!(job.queue_name, "b");
        assert_eq!(registry.get("b").unwrap().counts().await.unwrap().waiting, 1);
        assert_eq!(registry.get("a").unwrap().counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_start_workers_requires_handlers() {
        let mut registry = registry();
        registry.register(QueueConfig::new("orphan")).unwrap();

        let err = registry
            .start_workers(Arc::new(TracingSink), WorkerConfig::default())
            .err()
            .expect("missing handler must be rejected");
        assert!(err.is_configuration());
    }
}
