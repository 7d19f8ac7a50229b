use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::error::{ErrorSink, PipelineError, SinkError};
use crate::record::LogRecord;
use crate::sink::{LogBatch, Sink};

/// Asynchronous destination that takes one record at a time, typically
/// over the network.
///
/// Implementors only need to provide `send`. Use [`AsyncSinkBridge`] to
/// plug one into a pipeline.
#[async_trait]
pub trait AsyncLogSink: Send + Sync {
    /// Send a single record.
    ///
    /// **Returns**
    /// - `Ok(())` on success.
    /// - `Err(..)` on failure; the bridge retries with backoff.
    async fn send(&self, record: &LogRecord) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Exponential backoff used by [`AsyncSinkBridge`].
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts per record before the rest of the batch is given up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

enum BridgeMessage {
    Batch(Vec<Arc<LogRecord>>),
    Flush(std_mpsc::SyncSender<()>),
}

/// Adapts an [`AsyncLogSink`] to the batch [`Sink`] contract.
///
/// Batches are queued to a background task on the given runtime, so `log`
/// never waits on I/O. `flush` blocks until everything queued before it
/// has been sent or given up on; call it from outside the bridge's runtime.
pub struct AsyncSinkBridge {
    name: String,
    kind: String,
    sender: mpsc::UnboundedSender<BridgeMessage>,
    /// Records accepted by the async sink.
    pub delivered_events: Arc<AtomicU64>,
    /// Records given up on after exhausting retries.
    pub dropped_events: Arc<AtomicU64>,
}

impl AsyncSinkBridge {
    pub fn new<S>(name: impl Into<String>, sink: S, runtime: &Handle, errors: Arc<ErrorSink>) -> Self
    where
        S: AsyncLogSink + 'static,
    {
        Self::with_policy(
            name,
            std::any::type_name::<S>(),
            Arc::new(sink),
            runtime,
            errors,
            RetryPolicy::default(),
        )
    }

    pub fn with_policy(
        name: impl Into<String>,
        kind: impl Into<String>,
        sink: Arc<dyn AsyncLogSink>,
        runtime: &Handle,
        errors: Arc<ErrorSink>,
        policy: RetryPolicy,
    ) -> Self {
        let name = name.into();
        let (sender, mut rx) = mpsc::unbounded_channel::<BridgeMessage>();
        let delivered_events = Arc::new(AtomicU64::new(0));
        let dropped_events = Arc::new(AtomicU64::new(0));

        let task_name = name.clone();
        let delivered_bg = Arc::clone(&delivered_events);
        let dropped_bg = Arc::clone(&dropped_events);
        runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    BridgeMessage::Batch(records) => {
                        let sent = match send_batch(&*sink, &records, &policy).await {
                            Ok(()) => records.len(),
                            Err((sent, source)) => {
                                errors.handle(PipelineError::SinkDelivery {
                                    sink: task_name.clone(),
                                    source,
                                });
                                dropped_bg.fetch_add((records.len() - sent) as u64, Ordering::Relaxed);
                                sent
                            }
                        };
                        delivered_bg.fetch_add(sent as u64, Ordering::Relaxed);
                    }
                    BridgeMessage::Flush(ack) => {
                        if let Err(source) = sink.flush().await {
                            errors.handle(PipelineError::SinkDelivery {
                                sink: task_name.clone(),
                                source,
                            });
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            name,
            kind: kind.into(),
            sender,
            delivered_events,
            dropped_events,
        }
    }
}

/// Send `records` in order, retrying the failing record with backoff.
///
/// On giving up, returns how many records were sent and the last error.
async fn send_batch(
    sink: &dyn AsyncLogSink,
    records: &[Arc<LogRecord>],
    policy: &RetryPolicy,
) -> Result<(), (usize, SinkError)> {
    let mut backoff = policy.initial_backoff;
    let mut attempts = 0;
    let mut next = 0;
    while next < records.len() {
        match sink.send(&records[next]).await {
            Ok(()) => {
                next += 1;
                attempts = 0;
                backoff = policy.initial_backoff;
            }
            Err(err) => {
                attempts += 1;
                if attempts >= policy.max_attempts.max(1) {
                    return Err((next, err));
                }
                tracing::debug!(error = %err, ?backoff, "async log sink send failed, retrying");
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, policy.max_backoff);
            }
        }
    }
    Ok(())
}

fn stopped() -> SinkError {
    "async sink task has stopped".into()
}

impl Sink for AsyncSinkBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError> {
        self.sender
            .send(BridgeMessage::Batch(batch.records().to_vec()))
            .map_err(|_| stopped())
    }

    fn flush(&self) -> Result<(), SinkError> {
        let (ack_tx, ack_rx) = std_mpsc::sync_channel(1);
        self.sender
            .send(BridgeMessage::Flush(ack_tx))
            .map_err(|_| stopped())?;
        ack_rx.recv().map_err(|_| stopped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use std::sync::Mutex;

    /// Fails the first `failures` sends, then records templates.
    struct Flaky {
        failures: Mutex<u32>,
        sent: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AsyncLogSink for Flaky {
        async fn send(&self, record: &LogRecord) -> Result<(), SinkError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err("connection refused".into());
            }
            self.sent.lock().unwrap().push(record.template.clone());
            Ok(())
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    fn records(n: usize) -> Vec<Arc<LogRecord>> {
        (0..n)
            .map(|i| Arc::new(LogRecord::new(Level::Info, "bridge", i.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn retries_until_success() {
        let sink = Flaky::new(2);
        send_batch(&sink, &records(3), &fast()).await.unwrap();
        assert_eq!(*sink.sent.lock().unwrap(), ["0", "1", "2"]);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let sink = Flaky::new(10);
        let (sent, err) = send_batch(&sink, &records(2), &fast()).await.unwrap_err();
        assert_eq!(sent, 0);
        assert_eq!(err.to_string(), "connection refused");
        assert_eq!(*sink.failures.lock().unwrap(), 7);
    }
}
