//! A structured logging pipeline with live-reconfigurable middleware.
//!
//! Call sites log through per-category [`Logger`]s. Each record travels
//! through a per-sink chain of execution, filter, collect and format
//! middleware before it reaches a [`Sink`]. Every stage can be swapped at
//! runtime through the owning [`Pipeline`] without re-acquiring loggers or
//! losing records already in flight.

#[macro_use]
mod macros;

pub mod binding;
pub mod bridge;
pub mod config;
pub mod console_sink;
pub mod env;
pub mod error;
pub mod level;
pub mod logger;
pub mod memory_sink;
pub mod middleware;
pub mod noop_sink;
pub mod pipeline;
pub mod pool;
pub mod record;
pub mod registry;
pub mod scope;
pub mod sink;
pub mod template;
pub mod value;

#[cfg(feature = "tracing-bridge")]
pub mod init;
#[cfg(feature = "tracing-bridge")]
pub mod layer;

pub use crate::bridge::{AsyncLogSink, AsyncSinkBridge, RetryPolicy};
pub use crate::config::{LateSinkPolicy, PipelineConfig, RuntimeConfig, SinkStages};
pub use crate::error::{ErrorSink, PipelineError, SinkError};
pub use crate::level::Level;
pub use crate::logger::Logger;
pub use crate::middleware::catalog;
pub use crate::middleware::Stage;
pub use crate::pipeline::Pipeline;
pub use crate::record::LogRecord;
pub use crate::scope::ScopeGuard;
pub use crate::sink::{LogBatch, Sink};
pub use crate::value::{LogValue, ValueKind};
