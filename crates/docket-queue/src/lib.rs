//! # Docket Queue
//!
//! Named background job queues with bounded worker pools.
//!
//! Features:
//! - Durable FIFO per queue behind a pluggable [`QueueBackend`]
//! - Worker pools with a per-queue concurrency limit
//! - Retry with exponential backoff and per-job timeouts
//! - Typed lifecycle events through [`EventSink`]
//! - Graceful drain on shutdown with a bounded grace period

pub mod backend;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod worker;

pub use backend::{QueueBackend, QueueCounts};
pub use error::{BackendError, HandlerError, QueueError, QueueResult};
pub use events::{ChannelSink, EventSink, Fanout, JobEvent, TracingSink};
pub use handler::{handler_fn, HandlerFn, HandlerResult, JobHandler};
pub use job::{EnqueueOptions, Job, JobId, JobOptions, JobStatus, Payload};
pub use memory::MemoryQueue;
pub use queue::{Queue, QueueConfig};
pub use registry::QueueRegistry;
pub use retry::{RetryDecision, RetryPolicy, MAX_BACKOFF};
pub use shutdown::{shutdown_signal, ShutdownCoordinator, ShutdownOutcome};
pub use worker::{WorkerConfig, WorkerPool};
