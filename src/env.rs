//! Environment variable names read by [`PipelineConfig::from_env`](crate::config::PipelineConfig::from_env).
//!
//! These are purely helpers; pipelines built from an explicit
//! [`PipelineConfig`](crate::config::PipelineConfig) never touch the
//! environment.

use std::str::FromStr;

/// Global level, e.g. `info` or `warning`.
pub const LOG_PIPELINE_LEVEL_ENV: &str = "LOG_PIPELINE_LEVEL";

/// Async worker threads of the pipeline runtime.
pub const LOG_PIPELINE_WORKER_THREADS_ENV: &str = "LOG_PIPELINE_WORKER_THREADS";

/// Period of the `timer` collect middleware, in milliseconds.
pub const LOG_PIPELINE_TIMER_MS_ENV: &str = "LOG_PIPELINE_TIMER_MS";

/// `ignore` or `retrofit`.
pub const LOG_PIPELINE_LATE_SINKS_ENV: &str = "LOG_PIPELINE_LATE_SINKS";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable.
///
/// Returns `None` when the variable is unset or empty. A value that does
/// not parse is logged and treated as unset.
pub fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_or(key, "");
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key, value = raw, error = %err, "ignoring invalid environment override");
            None
        }
    }
}
