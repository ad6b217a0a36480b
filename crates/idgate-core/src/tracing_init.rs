//! Logging setup for idgate processes.
//!
//! `log_level` from [`Config`](crate::Config) applies to the idgate crates;
//! `sqlx` stays at `warn` so per-query statements do not flood the log.
//! `RUST_LOG`, when set, replaces the whole filter.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

const IDGATE_TARGETS: &[&str] = &["idgate_identity", "idgate_admin", "idgate_core"];

/// Filter directives for `level` on the idgate targets.
pub fn default_directives(level: &str) -> String {
    let mut directives: Vec<String> = IDGATE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    directives.push("sqlx=warn".to_owned());
    directives.join(",")
}

/// Install the global subscriber. Fails if one is already installed or the
/// filter does not parse.
pub fn init_tracing(level: &str, log_json: bool) -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| default_directives(level));
    let env_filter =
        EnvFilter::try_new(&directives).map_err(|e| Error::Tracing(format!("{directives}: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    installed.map_err(|e| Error::Tracing(e.to_string()))
}
