use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::env::{
    env_parse, LOG_PIPELINE_LATE_SINKS_ENV, LOG_PIPELINE_LEVEL_ENV, LOG_PIPELINE_TIMER_MS_ENV,
    LOG_PIPELINE_WORKER_THREADS_ENV,
};
use crate::error::PipelineError;
use crate::level::Level;
use crate::middleware::Stage;

/// Snapshot of a pipeline's configuration.
///
/// This is the exchange format for configuration readers: they produce one
/// and hand it to [`Pipeline::apply`](crate::pipeline::Pipeline::apply), or
/// take one from [`Pipeline::snapshot`](crate::pipeline::Pipeline::snapshot).
///
/// ```json
/// {
///   "level": "info",
///   "sinks": { "console": { "execution": "thread-pool", "format": "json" } },
///   "runtime": { "worker_threads": 2, "timer_period_ms": 1000 },
///   "late_sinks": "ignore"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub level: Level,
    pub sinks: BTreeMap<String, SinkStages>,
    pub runtime: RuntimeConfig,
    pub late_sinks: LateSinkPolicy,
}

/// Middleware names for one sink. `None` keeps the current selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkStages {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl SinkStages {
    pub fn get(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Execution => self.execution.as_deref(),
            Stage::Collect => self.collect.as_deref(),
            Stage::Filter => self.filter.as_deref(),
            Stage::Format => self.format.as_deref(),
        }
    }

    pub fn set(&mut self, stage: Stage, name: impl Into<String>) {
        let slot = match stage {
            Stage::Execution => &mut self.execution,
            Stage::Collect => &mut self.collect,
            Stage::Filter => &mut self.filter,
            Stage::Format => &mut self.format,
        };
        *slot = Some(name.into());
    }
}

/// Sizing of the runtime a pipeline owns. Only read at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Async worker threads driving timers.
    pub worker_threads: usize,
    /// Upper bound on blocking-pool threads used by thread-pool drains.
    pub max_blocking_threads: usize,
    /// Period of the `timer` collect middleware.
    pub timer_period_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 64,
            timer_period_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.timer_period_ms.max(1))
    }
}

/// What happens to loggers handed out before a sink was added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateSinkPolicy {
    /// Existing loggers keep the sinks they were created with.
    #[default]
    Ignore,
    /// Existing loggers start writing to the new sink as well.
    Retrofit,
}

impl FromStr for LateSinkPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(LateSinkPolicy::Ignore),
            "retrofit" => Ok(LateSinkPolicy::Retrofit),
            other => Err(PipelineError::ConfigurationRejected(format!(
                "unknown late sink policy `{other}`"
            ))),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Defaults overlaid with the `LOG_PIPELINE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay the `LOG_PIPELINE_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(level) = env_parse::<Level>(LOG_PIPELINE_LEVEL_ENV) {
            self.level = level;
        }
        if let Some(threads) = env_parse::<usize>(LOG_PIPELINE_WORKER_THREADS_ENV) {
            self.runtime.worker_threads = threads.max(1);
        }
        if let Some(period) = env_parse::<u64>(LOG_PIPELINE_TIMER_MS_ENV) {
            self.runtime.timer_period_ms = period;
        }
        if let Some(policy) = env_parse::<LateSinkPolicy>(LOG_PIPELINE_LATE_SINKS_ENV) {
            self.late_sinks = policy;
        }
        self
    }
}
