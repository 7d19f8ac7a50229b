use std::io::{self, Write};

use crate::error::SinkError;
use crate::level::Level;
use crate::sink::{LogBatch, Sink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Writes one formatted line per record to stdout, or to stderr for
/// records at or above a threshold.
#[derive(Clone, Debug)]
pub struct ConsoleSink {
    name: String,
    stream: Stream,
    stderr_from: Level,
}

impl ConsoleSink {
    /// Everything on stdout.
    pub fn stdout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream: Stream::Stdout,
            stderr_from: Level::None,
        }
    }

    /// Everything on stderr.
    pub fn stderr(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream: Stream::Stderr,
            stderr_from: Level::Trace,
        }
    }

    /// Records at `level` and above go to stderr, the rest to stdout.
    pub fn split_at(mut self, level: Level) -> Self {
        self.stderr_from = level;
        self
    }

    fn to_stderr(&self, level: Level) -> bool {
        self.stream == Stream::Stderr || level.passes(self.stderr_from)
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "console"
    }

    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError> {
        let stdout = io::stdout();
        let stderr = io::stderr();
        let mut out = stdout.lock();
        let mut err = stderr.lock();
        for record in batch.records() {
            let line = batch.render(record);
            if self.to_stderr(record.level) {
                writeln!(err, "{line}")?;
            } else {
                writeln!(out, "{line}")?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        io::stdout().flush()?;
        io::stderr().flush()?;
        Ok(())
    }
}
