use crate::error::SinkError;
use crate::middleware::FormatMiddleware;
use crate::record::LogRecord;
use std::sync::Arc;

/// Destination for batches of [`LogRecord`]s produced by the pipeline.
///
/// Implementations transport records to a concrete backend (console,
/// file, network). The pipeline calls `log` from whichever thread the
/// sink's execution and collect middleware deliver on: the caller's thread
/// for the synchronous variants, a worker thread otherwise. A sink bound to
/// an asynchronous execution middleware with a pass-through collector may
/// see concurrent `log` calls and must be internally thread-safe.
///
/// `log` may run while the pipeline is swapping this sink's middleware, as
/// the old stage drains. Reading the configuration from inside it is fine.
/// Logging back into the same sink, or changing the configuration of the
/// same pipeline (`set_*`, `apply`, `add_sink`, `dispose`), blocks forever.
pub trait Sink: Send + Sync {
    /// Unique name of this sink within a pipeline; keys its middleware
    /// configuration.
    fn name(&self) -> &str;

    /// Sink type consulted by filter middleware. Defaults to the Rust type
    /// name of the implementation.
    fn kind(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Deliver one batch.
    ///
    /// **Returns**
    /// - `Ok(())` if the batch was accepted.
    /// - `Err(..)` on failure. The pipeline reports the error through its
    ///   [`ErrorSink`](crate::error::ErrorSink) and keeps going; it never
    ///   retries on the sink's behalf.
    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError>;

    /// Flush any buffered output. Default implementation is a no-op.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Release resources. Called once, after the final flush of the
    /// pipeline. Defaults to [`Sink::flush`].
    fn dispose(&self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// A batch of records handed to [`Sink::log`], together with the sink's
/// format middleware.
///
/// Formatting is lazy: nothing is rendered unless the sink asks for text.
pub struct LogBatch<'a> {
    records: &'a [Arc<LogRecord>],
    formatter: &'a dyn FormatMiddleware,
}

impl<'a> LogBatch<'a> {
    pub fn new(records: &'a [Arc<LogRecord>], formatter: &'a dyn FormatMiddleware) -> Self {
        Self { records, formatter }
    }

    pub fn records(&self) -> &'a [Arc<LogRecord>] {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render one record with the bound format middleware.
    pub fn render(&self, record: &LogRecord) -> String {
        self.formatter.render(record)
    }

    /// Every record of the batch rendered as text, in order.
    pub fn rendered(&self) -> impl Iterator<Item = String> + '_ {
        self.records.iter().map(move |record| self.formatter.render(record))
    }
}
