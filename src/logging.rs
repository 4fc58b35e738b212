//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. the level passed to [`init_logging`]
//! 2. `TASK_DAG_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`

use std::error::Error;

use tracing::Level;
use tracing_subscriber::fmt;

pub const ENV_LOG: &str = "TASK_DAG_LOG";

/// Install a global fmt subscriber.
///
/// Returns an error if a global subscriber is already set.
pub fn init_logging(level: Option<Level>) -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let level = level
        .or_else(|| std::env::var(ENV_LOG).ok().and_then(|s| parse_level_str(&s)))
        .unwrap_or(Level::INFO);

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
}

fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
