use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SinkError;
use crate::record::LogRecord;
use crate::sink::{LogBatch, Sink};

#[derive(Default)]
struct Captured {
    records: Mutex<Vec<Arc<LogRecord>>>,
    lines: Mutex<Vec<String>>,
    batch_sizes: Mutex<Vec<usize>>,
    flushes: AtomicUsize,
    disposed: AtomicBool,
}

/// Keeps every record it receives, plus the rendered line for each.
///
/// Clones share the same storage, so a test can hand one clone to the
/// pipeline and inspect another.
#[derive(Clone)]
pub struct MemorySink {
    name: String,
    kind: String,
    captured: Arc<Captured>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "memory".to_string(),
            captured: Arc::new(Captured::default()),
        }
    }

    /// Report `kind` to filters instead of `"memory"`.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn records(&self) -> Vec<Arc<LogRecord>> {
        self.captured.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rendered lines, in delivery order.
    pub fn lines(&self) -> Vec<String> {
        self.captured.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Interpolated messages, in delivery order.
    pub fn messages(&self) -> Vec<String> {
        self.records().iter().map(|record| record.message()).collect()
    }

    pub fn len(&self) -> usize {
        self.captured.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of every batch received.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.captured.batch_sizes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn flush_count(&self) -> usize {
        self.captured.flushes.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.captured.disposed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.captured.records.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.captured.lines.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.captured.batch_sizes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError> {
        let rendered: Vec<String> = batch.rendered().collect();
        // Records and lines are appended under one lock so they stay aligned.
        let mut records = self.captured.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.extend(batch.records().iter().cloned());
        self.captured
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(rendered);
        self.captured
            .batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.len());
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.captured.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dispose(&self) -> Result<(), SinkError> {
        self.captured.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("records", &self.len())
            .finish()
    }
}
