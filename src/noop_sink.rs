use crate::bridge::AsyncLogSink;
use crate::error::SinkError;
use crate::record::LogRecord;
use crate::sink::{LogBatch, Sink};
use async_trait::async_trait;

/// A sink that simply drops all records.
///
/// Useful for measuring the overhead of the pipeline itself without any
/// I/O, and for tests that don't care about output. Works both as a
/// batch [`Sink`] and as an [`AsyncLogSink`].
#[derive(Clone, Debug)]
pub struct NoopSink {
    name: String,
}

impl NoopSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for NoopSink {
    fn default() -> Self {
        Self::new("noop")
    }
}

impl Sink for NoopSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn log(&self, _batch: &LogBatch<'_>) -> Result<(), SinkError> {
        Ok(())
    }
}

#[async_trait]
impl AsyncLogSink for NoopSink {
    async fn send(&self, _record: &LogRecord) -> Result<(), SinkError> {
        Ok(())
    }
}
