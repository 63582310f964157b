//! Queue backend backed by Redis.
//!
//! Layout, per queue:
//! - `{prefix}:job:{id}`: the job as JSON
//! - `{prefix}:{queue}:waiting`: LIST of ids eligible now, FIFO
//! - `{prefix}:{queue}:delayed`: ZSET of ids scored by `run_at` (ms)
//! - `{prefix}:{queue}:active`: ZSET of claimed ids scored by claim time (ms)
//! - `{prefix}:{queue}:completed` / `:failed`: counters
//!
//! A claimed job belongs to whoever removes it from the active set. Every
//! transition out of `Active` is a script that only writes the job if that
//! removal succeeds, so a worker and a concurrent reclaim never both win.

use async_trait::async_trait;
use chrono::Utc;
use docket_queue::{BackendError, Job, JobId, JobStatus, Payload, QueueBackend, QueueCounts};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the Redis broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Prefix for every key this broker writes.
    pub key_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            key_prefix: "docket".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into()).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Connection URL. The password must already be URL-safe.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.key_prefix, id)
    }

    fn queue_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, queue, suffix)
    }
}

/// Promote due delayed ids, pop the head of the waiting list and mark it
/// active, in one step.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
end
local id = redis.call('LPOP', KEYS[2])
if not id then
    return false
end
redis.call('ZADD', KEYS[3], ARGV[1], id)
return id
"#;

/// Write the started job, unless it was already taken back.
const START_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    redis.call('SET', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

/// Leave the active set and either bump a counter (KEYS[3]) or re-enter
/// the waiting list or delayed set.
const RELEASE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2])
if ARGV[3] == 'count' then
    redis.call('INCR', KEYS[3])
elseif ARGV[3] == 'wait' then
    redis.call('RPUSH', KEYS[3], ARGV[1])
else
    redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
end
return 1
"#;

/// Where a job goes when it leaves the active set.
enum Release<'a> {
    /// Terminal; bump the named counter.
    Count(&'a str),
    /// Back on the waiting list now.
    Wait,
    /// Into the delayed set until `run_at`.
    Delay,
}

#[derive(Clone)]
pub struct RedisQueueBackend {
    connection: ConnectionManager,
    config: BrokerConfig,
}

impl std::fmt::Debug for RedisQueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueBackend")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl RedisQueueBackend {
    pub async fn connect(config: BrokerConfig) -> Result<Self, BackendError> {
        let client = Client::open(config.url().as_str()).map_err(redis_err)?;
        let connection = ConnectionManager::new(client).await.map_err(redis_err)?;

        info!(host = %config.host, port = config.port, "Connected to Redis broker");
        Ok(Self { connection, config })
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.config.job_key(id)).await.map_err(redis_err)?;
        json.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(BackendError::from)
    }

    async fn load_active(&self, id: JobId) -> Result<Job, BackendError> {
        match self.load(id).await? {
            Some(job) if job.status == JobStatus::Active => Ok(job),
            _ => Err(BackendError::NotFound(id)),
        }
    }

    /// Move `job` out of the active set and store it. Returns false if
    /// someone else already did.
    async fn release(&self, job: &Job, to: Release<'_>) -> Result<bool, BackendError> {
        let queue = &job.queue_name;
        let (mode, target) = match to {
            Release::Count(counter) => ("count", self.config.queue_key(queue, counter)),
            Release::Wait => ("wait", self.config.queue_key(queue, "waiting")),
            Release::Delay => ("delay", self.config.queue_key(queue, "delayed")),
        };

        let mut conn = self.connection.clone();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.config.queue_key(queue, "active"))
            .key(self.config.job_key(job.id))
            .key(target)
            .arg(job.id.to_string())
            .arg(serde_json::to_string(job)?)
            .arg(mode)
            .arg(job.run_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(released == 1)
    }

    async fn settle(&self, job: Job, to: Release<'_>) -> Result<Job, BackendError> {
        if self.release(&job, to).await? {
            Ok(job)
        } else {
            Err(BackendError::NotFound(job.id))
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, job: Job) -> Result<(), BackendError> {
        let id = job.id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.config.job_key(job.id), serde_json::to_string(&job)?);
        if job.run_at <= Utc::now() {
            pipe.rpush(self.config.queue_key(&job.queue_name, "waiting"), id);
        } else {
            pipe.zadd(
                self.config.queue_key(&job.queue_name, "delayed"),
                id,
                job.run_at.timestamp_millis(),
            );
        }

        let mut conn = self.connection.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let active = self.config.queue_key(queue, "active");
        let mut conn = self.connection.clone();

        let popped: Option<String> = Script::new(CLAIM_SCRIPT)
            .key(self.config.queue_key(queue, "delayed"))
            .key(self.config.queue_key(queue, "waiting"))
            .key(&active)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let Some(raw_id) = popped else {
            return Ok(None);
        };

        let id: JobId = raw_id
            .parse()
            .map_err(|e| BackendError::backend(format!("invalid job id '{raw_id}': {e}")))?;
        let Some(mut job) = self.load(id).await? else {
            debug!(job_id = %id, "Dropping id of a job that no longer exists");
            let _: () = conn.zrem(&active, &raw_id).await.map_err(redis_err)?;
            return Ok(None);
        };

        job.start(now);
        let started: i64 = Script::new(START_SCRIPT)
            .key(&active)
            .key(self.config.job_key(id))
            .arg(&raw_id)
            .arg(serde_json::to_string(&job)?)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if started == 0 {
            return Ok(None);
        }

        Ok(Some(job))
    }

    async fn complete(&self, id: JobId, result: Payload) -> Result<Job, BackendError> {
        let mut job = self.load_active(id).await?;
        job.complete(Utc::now(), result);
        self.settle(job, Release::Count("completed")).await
    }

    async fn retry(&self, id: JobId, delay: Duration, error: &str) -> Result<Job, BackendError> {
        let mut job = self.load_active(id).await?;
        if job.attempt >= job.max_attempts() {
            return Err(BackendError::Backend(format!("job {id} has no attempts left")));
        }
        job.schedule_retry(Utc::now(), delay, error);
        let job = self.settle(job, Release::Delay).await?;

        debug!(
            job_id = %id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "Re-queuing job with backoff"
        );
        Ok(job)
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<Job, BackendError> {
        let mut job = self.load_active(id).await?;
        job.fail(Utc::now(), error);
        self.settle(job, Release::Count("failed")).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        self.load(id).await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BackendError> {
        let mut conn = self.connection.clone();
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, Option<u64>, Option<u64>) =
            redis::pipe()
                .llen(self.config.queue_key(queue, "waiting"))
                .zcard(self.config.queue_key(queue, "delayed"))
                .zcard(self.config.queue_key(queue, "active"))
                .get(self.config.queue_key(queue, "completed"))
                .get(self.config.queue_key(queue, "failed"))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;

        Ok(QueueCounts {
            waiting: waiting + delayed,
            active,
            completed: completed.unwrap_or_default(),
            failed: failed.unwrap_or_default(),
        })
    }

    async fn reclaim_stale(&self, queue: &str) -> Result<u64, BackendError> {
        let now = Utc::now();
        let mut conn = self.connection.clone();
        let active: Vec<(String, f64)> = conn
            .zrange_withscores(self.config.queue_key(queue, "active"), 0, -1)
            .await
            .map_err(redis_err)?;

        let mut reclaimed = 0;
        for (raw_id, claimed_ms) in active {
            let Ok(id) = raw_id.parse::<JobId>() else {
                continue;
            };
            let Some(mut job) = self.load(id).await? else {
                continue;
            };

            let timeout_ms = i64::try_from(job.options.timeout_ms).unwrap_or(i64::MAX);
            let deadline = (claimed_ms as i64).saturating_add(timeout_ms);
            if now.timestamp_millis() < deadline {
                continue;
            }

            job.reclaim(now);
            if self.release(&job, Release::Wait).await? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

fn redis_err(e: RedisError) -> BackendError {
    BackendError::backend(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_without_password() {
        let config = BrokerConfig::new("broker.internal", 6380);
        assert_eq!(config.url(), "redis://broker.internal:6380/");
    }

    #[test]
    fn test_url_with_password() {
        let config = BrokerConfig::default().with_password("s3cret");
        assert_eq!(config.url(), "redis://:s3cret@localhost:6379/");
    }

    #[test]
    fn test_empty_password_is_ignored() {
        let config = BrokerConfig::default().with_password("");
        assert_eq!(config.password, None);
    }

    #[test]
    fn test_key_layout() {
        let config = BrokerConfig::default().with_key_prefix("app");
        let id = JobId::nil();
        assert_eq!(
            config.job_key(id),
            "app:job:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(config.queue_key("email-sending", "waiting"), "app:email-sending:waiting");
    }
}
