use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Severity of a [`LogRecord`](crate::record::LogRecord).
///
/// Levels are totally ordered from `Trace` to `None`. A logger configured at
/// level `L` admits calls at `L` and above; `None` as a configured level
/// silences everything, and records can never be emitted at `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
    None = 6,
}

impl Level {
    /// Every emittable level, lowest first.
    pub const ALL: [Level; 6] = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Fatal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
            Level::None => "none",
        }
    }

    /// Decode a level stored in an atomic. Out-of-range values map to `None`.
    pub fn from_u8(raw: u8) -> Level {
        match raw {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            4 => Level::Error,
            5 => Level::Fatal,
            _ => Level::None,
        }
    }

    /// Whether a record at `self` passes a gate configured at `gate`.
    #[inline]
    pub fn passes(self, gate: Level) -> bool {
        self != Level::None && self >= gate
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.as_str().to_ascii_uppercase())
    }
}

impl FromStr for Level {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "verbose" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" | "information" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" | "critical" => Ok(Level::Fatal),
            "none" | "off" => Ok(Level::None),
            _ => Err(PipelineError::InvalidLevel(s.to_string())),
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}
