use once_cell::sync::Lazy;
use std::any::Any;
use std::error::Error;
use std::sync::{Arc, PoisonError, RwLock};

use crate::middleware::Stage;

/// Error type returned by [`Sink`](crate::sink::Sink) implementations.
pub type SinkError = Box<dyn Error + Send + Sync>;

/// Failures raised inside the pipeline.
///
/// None of these ever reach a logging call site: the dispatch path reports
/// them to the [`ErrorSink`] instead. Administrative calls (`add_sink`,
/// middleware setters) return them directly.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("sink `{sink}` failed to deliver: {source}")]
    SinkDelivery {
        sink: String,
        #[source]
        source: SinkError,
    },

    #[error("failed to build {stage} middleware `{name}` for sink `{sink}`: {reason}")]
    MiddlewareConstruction {
        sink: String,
        stage: Stage,
        name: String,
        reason: String,
    },

    #[error("unknown {stage} middleware `{name}`")]
    UnknownMiddleware { stage: Stage, name: String },

    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("a sink named `{0}` is already registered")]
    DuplicateSink(String),

    #[error("{context} panicked: {message}")]
    ActionPanicked { context: String, message: String },

    #[error("configuration observer panicked: {0}")]
    ObserverPanicked(String),

    #[error("scope released out of order on logger `{0}`")]
    ScopeMisuse(String),

    #[error("pipeline has been disposed")]
    Disposed,

    #[error("invalid log level `{0}`")]
    InvalidLevel(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to start pipeline runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl PipelineError {
    /// Wrap a caught panic payload.
    pub fn from_panic(context: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        PipelineError::ActionPanicked {
            context: context.into(),
            message: panic_message(&payload),
        }
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type ErrorHandler = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// Publish/subscribe point for failures that the pipeline swallows.
///
/// Every report is logged through `tracing` at `WARN` and then handed to
/// each subscribed handler, in subscription order. A panicking handler is
/// contained and does not prevent the remaining handlers from running.
#[derive(Default)]
pub struct ErrorSink {
    handlers: RwLock<Vec<ErrorHandler>>,
}

static GLOBAL: Lazy<Arc<ErrorSink>> = Lazy::new(|| Arc::new(ErrorSink::new()));

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide sink used by [`Pipeline::global`](crate::pipeline::Pipeline::global).
    pub fn global() -> Arc<ErrorSink> {
        Arc::clone(&GLOBAL)
    }

    /// Subscribe a handler for all future reports.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&PipelineError) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Report a failure.
    pub fn handle(&self, error: PipelineError) {
        tracing::warn!(error = %error, "log pipeline error");
        // Snapshot so handlers may subscribe further handlers without deadlocking.
        let handlers: Vec<ErrorHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&error)));
            if let Err(payload) = outcome {
                tracing::warn!(panic = %panic_message(&payload), "error handler panicked");
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
