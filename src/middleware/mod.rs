//! The four stage kinds that make up a sink's delivery chain.
//!
//! ```text
//! Logger ─▶ Execution ─▶ Filter ─▶ Collect ─▶ Sink.log(batch) ─▶ Format (lazy)
//! ```
//!
//! Each sink binding owns one instance of every stage. Instances are built
//! by name through the [`catalog::MiddlewareCatalog`] and swapped at runtime
//! when the registry changes.

pub mod catalog;
pub mod collect;
pub mod execution;
pub mod filter;
pub mod format;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::error::{ErrorSink, PipelineError};
use crate::record::LogRecord;

pub use self::format::FormatOverrides;

/// Unit of work handed to an execution middleware.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Decides on which thread, and when, a dispatch runs.
pub trait ExecutionMiddleware: Send + Sync {
    fn execute(&self, action: Action);

    /// Block until every action accepted so far has run.
    fn flush(&self);

    /// Drain and stop. Actions submitted afterwards run on the caller's
    /// thread.
    fn dispose(&self);
}

/// Batches records on their way to the sink.
pub trait CollectMiddleware: Send + Sync {
    fn accept(&self, record: Arc<LogRecord>);

    /// Block until every record accepted so far has been delivered.
    fn flush(&self);

    /// Deliver what is pending and stop. Records accepted afterwards are
    /// delivered immediately on the caller's thread.
    fn dispose(&self);
}

/// Per-sink admission decision.
pub trait FilterMiddleware: Send + Sync {
    fn admit(&self, sink_kind: &str, record: &LogRecord) -> bool;
}

impl<F> FilterMiddleware for F
where
    F: Fn(&str, &LogRecord) -> bool + Send + Sync,
{
    fn admit(&self, sink_kind: &str, record: &LogRecord) -> bool {
        self(sink_kind, record)
    }
}

/// Renders a record to text.
pub trait FormatMiddleware: Send + Sync {
    fn render(&self, record: &LogRecord) -> String;
}

/// Receiving end of a collect middleware: the sink plus its formatter.
pub trait BatchTarget: Send + Sync {
    fn deliver(&self, batch: Vec<Arc<LogRecord>>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Execution,
    Collect,
    Filter,
    Format,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Execution, Stage::Collect, Stage::Filter, Stage::Format];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Execution => "execution",
            Stage::Collect => "collect",
            Stage::Filter => "filter",
            Stage::Format => "format",
        }
    }

    /// Middleware name used for a sink with no explicit configuration.
    pub fn default_middleware(self) -> &'static str {
        match self {
            Stage::Execution => catalog::SYNC,
            Stage::Collect => catalog::PASS_THROUGH,
            Stage::Filter => catalog::ALLOW_ALL,
            Stage::Format => catalog::TEXT,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a middleware factory may need to build an instance.
#[derive(Clone)]
pub struct MiddlewareContext {
    /// Name of the sink the middleware is built for.
    pub sink_name: String,
    /// Pipeline runtime used for pooled drains and timers.
    pub runtime: Handle,
    pub errors: Arc<ErrorSink>,
    /// Period of the timer-triggered queue.
    pub timer_period: Duration,
    pub overrides: Arc<FormatOverrides>,
}

/// Run an action, turning a panic into an [`ErrorSink`] report.
pub(crate) fn run_guarded(errors: &ErrorSink, context: &str, action: Action) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
        errors.handle(PipelineError::from_panic(context, payload));
    }
}
