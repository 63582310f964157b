//! # Docket Persistence
//!
//! Durable brokers for docket queues.
//!
//! Supports:
//! - SQLite (default, single node)
//! - Redis (feature `redis`, shared between processes)

#[cfg(feature = "sqlite")]
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use queue::SqliteQueueBackend;
#[cfg(feature = "redis")]
pub use redis_queue::{BrokerConfig, RedisQueueBackend};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConfig;
