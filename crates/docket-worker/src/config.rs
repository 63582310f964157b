//! Worker settings, read from CLI flags with environment fallbacks.

use clap::builder::BoolishValueParser;
use clap::{value_parser, Parser, ValueEnum};
use docket_jobs::JobDefaults;
use docket_queue::WorkerConfig;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "redis")]
use docket_persist::BrokerConfig;

/// Which broker holds queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    /// SQLite database at `DATABASE_URL`
    Sqlite,
    /// Redis at `BROKER_HOST:BROKER_PORT`
    Redis,
    /// Process memory; jobs do not survive a restart
    Memory,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Docket worker - runs question, document and email jobs
#[derive(Debug, Clone, Parser)]
#[command(name = "docket-worker", version, about)]
pub struct Settings {
    /// Broker backing the queues
    #[arg(long, env = "BROKER_KIND", value_enum, default_value_t = BrokerKind::Sqlite)]
    pub broker_kind: BrokerKind,

    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    pub broker_host: String,

    #[arg(long, env = "BROKER_PORT", default_value_t = 6379)]
    pub broker_port: u16,

    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: Option<String>,

    /// SQLite connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:docket.db?mode=rwc")]
    pub database_url: String,

    /// Attempts per question job, first try included
    #[arg(
        long,
        env = "MAX_JOB_ATTEMPTS",
        default_value_t = 3,
        value_parser = value_parser!(u32).range(1..)
    )]
    pub max_job_attempts: u32,

    /// Per-attempt limit for question jobs
    #[arg(
        long,
        env = "JOB_TIMEOUT_MS",
        default_value_t = 300_000,
        value_parser = value_parser!(u64).range(1..)
    )]
    pub job_timeout_ms: u64,

    /// Parallel question jobs
    #[arg(
        long,
        env = "CONCURRENCY",
        default_value_t = 5,
        value_parser = value_parser!(u32).range(1..)
    )]
    pub concurrency: u32,

    /// How long shutdown waits for in-flight jobs
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 30_000)]
    pub shutdown_grace_ms: u64,

    /// Idle poll interval
    #[arg(
        long,
        env = "POLL_INTERVAL_MS",
        default_value_t = 100,
        value_parser = value_parser!(u64).range(1..)
    )]
    pub poll_interval_ms: u64,

    /// Warn when one attempt runs longer than this; 0 disables
    #[arg(long, env = "SLOW_JOB_WARNING_MS", default_value_t = 5_000)]
    pub slow_job_warning_ms: u64,

    /// Without a key, questions get a static placeholder answer
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "AI_MODEL", default_value = "gpt-4")]
    pub ai_model: String,

    #[arg(long, env = "AI_MAX_TOKENS", default_value_t = 4000)]
    pub ai_max_tokens: u32,

    /// Tracing filter directives, e.g. `info,docket_queue=trace`
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", value_parser = BoolishValueParser::new())]
    pub log_json: bool,
}

impl Settings {
    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            concurrency: self.concurrency as usize,
            max_attempts: self.max_job_attempts,
            timeout: Duration::from_millis(self.job_timeout_ms),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            slow_job_warning: (self.slow_job_warning_ms > 0)
                .then(|| Duration::from_millis(self.slow_job_warning_ms)),
            ..WorkerConfig::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The configured API key, if it is non-empty.
    pub fn openai_api_key(&self) -> Option<&str> {
        self.openai_api_key.as_deref().filter(|key| !key.is_empty())
    }

    #[cfg(feature = "redis")]
    pub fn broker_config(&self) -> BrokerConfig {
        let config = BrokerConfig::new(&self.broker_host, self.broker_port);
        match &self.broker_password {
            Some(password) => config.with_password(password),
            None => config,
        }
    }
}
