//! Tracing subscriber setup.

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,docket=debug";

/// Install the global subscriber. `filter` falls back to [`DEFAULT_FILTER`].
pub fn init_tracing(filter: Option<&str>, json: bool) -> anyhow::Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid log filter '{directives}'"))?,
        None => EnvFilter::new(DEFAULT_FILTER),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_current_span(true)))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .try_init()
        .context("Failed to install tracing subscriber")
}
