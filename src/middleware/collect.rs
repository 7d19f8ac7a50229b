//! Collect middleware: turns a stream of records into batches for the sink.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;

use super::{BatchTarget, CollectMiddleware, MiddlewareContext};
use crate::error::{ErrorSink, PipelineError};
use crate::record::LogRecord;

const FLUSH_POLL: Duration = Duration::from_millis(50);

fn deliver_guarded(errors: &ErrorSink, label: &str, target: &dyn BatchTarget, batch: Vec<Arc<LogRecord>>) {
    if batch.is_empty() {
        return;
    }
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| target.deliver(batch))) {
        errors.handle(PipelineError::from_panic(label, payload));
    }
}

/// Hands every record straight to the sink as a one-element batch.
pub struct PassThroughCollector {
    target: Arc<dyn BatchTarget>,
}

impl PassThroughCollector {
    pub fn new(target: Arc<dyn BatchTarget>) -> Self {
        Self { target }
    }
}

impl CollectMiddleware for PassThroughCollector {
    fn accept(&self, record: Arc<LogRecord>) {
        self.target.deliver(vec![record]);
    }

    fn flush(&self) {}

    fn dispose(&self) {}
}

enum Message {
    Record(Arc<LogRecord>),
    Flush(Sender<()>),
    Stop,
}

/// Dedicated worker that batches whatever producers queued since its last
/// wake-up.
pub struct ConcurrentCollector {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
    target: Arc<dyn BatchTarget>,
    disposed: AtomicBool,
    errors: Arc<ErrorSink>,
    label: String,
}

impl ConcurrentCollector {
    pub fn new(ctx: &MiddlewareContext, target: Arc<dyn BatchTarget>) -> Result<Self, PipelineError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let label = format!("concurrent collector for `{}`", ctx.sink_name);
        let worker = {
            let rx = rx.clone();
            let target = Arc::clone(&target);
            let errors = Arc::clone(&ctx.errors);
            let label = label.clone();
            thread::Builder::new()
                .name(format!("log-collect-{}", ctx.sink_name))
                .spawn(move || collect_loop(&rx, &*target, &errors, &label))?
        };
        Ok(Self {
            tx,
            rx,
            worker: Mutex::new(Some(worker)),
            target,
            disposed: AtomicBool::new(false),
            errors: Arc::clone(&ctx.errors),
            label,
        })
    }

    /// Deliver anything left in the channel on the calling thread.
    fn drain_inline(&self) {
        let mut batch = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            match message {
                Message::Record(record) => batch.push(record),
                Message::Flush(ack) => {
                    deliver_guarded(&self.errors, &self.label, &*self.target, mem::take(&mut batch));
                    let _ = ack.send(());
                }
                Message::Stop => {}
            }
        }
        deliver_guarded(&self.errors, &self.label, &*self.target, batch);
    }
}

fn collect_loop(rx: &Receiver<Message>, target: &dyn BatchTarget, errors: &ErrorSink, label: &str) {
    while let Ok(first) = rx.recv() {
        let mut batch = Vec::new();
        let mut next = Some(first);
        while let Some(message) = next {
            match message {
                Message::Record(record) => batch.push(record),
                Message::Flush(ack) => {
                    deliver_guarded(errors, label, target, mem::take(&mut batch));
                    let _ = ack.send(());
                }
                Message::Stop => {
                    deliver_guarded(errors, label, target, batch);
                    return;
                }
            }
            next = rx.try_recv().ok();
        }
        deliver_guarded(errors, label, target, batch);
    }
}

impl CollectMiddleware for ConcurrentCollector {
    fn accept(&self, record: Arc<LogRecord>) {
        if self.disposed.load(Ordering::Acquire) {
            return deliver_guarded(&self.errors, &self.label, &*self.target, vec![record]);
        }
        // The collector keeps its own receiver, so the channel never closes.
        let _ = self.tx.send(Message::Record(record));
    }

    fn flush(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Message::Flush(ack_tx)).is_err() {
            return;
        }
        loop {
            match ack_rx.recv_timeout(FLUSH_POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    // The worker stopped under us; finish the job here.
                    if self.disposed.load(Ordering::Acquire) {
                        self.drain_inline();
                    }
                }
            }
        }
    }

    fn dispose(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Message::Stop);
        if let Some(handle) = worker.take() {
            if let Err(payload) = handle.join() {
                self.errors.handle(PipelineError::from_panic(self.label.clone(), payload));
            }
        }
        self.drain_inline();
    }
}

#[derive(Default)]
struct Pending {
    records: Vec<Arc<LogRecord>>,
    armed: bool,
}

/// Accumulates records and delivers them when a one-shot timer fires.
///
/// The timer is armed by the first record that arrives while none is
/// pending, so an idle queue costs nothing.
pub struct TimerQueue {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    pending: Mutex<Pending>,
    // Serializes timer and flush deliveries.
    delivery: Mutex<()>,
    target: Arc<dyn BatchTarget>,
    runtime: Handle,
    period: Duration,
    disposed: AtomicBool,
    errors: Arc<ErrorSink>,
    label: String,
}

impl TimerQueue {
    pub fn new(ctx: &MiddlewareContext, target: Arc<dyn BatchTarget>) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                pending: Mutex::new(Pending::default()),
                delivery: Mutex::new(()),
                target,
                runtime: ctx.runtime.clone(),
                period: ctx.timer_period,
                disposed: AtomicBool::new(false),
                errors: Arc::clone(&ctx.errors),
                label: format!("timer queue for `{}`", ctx.sink_name),
            }),
        }
    }

    /// Records waiting for the next tick.
    pub fn pending(&self) -> usize {
        self.inner.lock_pending().records.len()
    }
}

impl TimerInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let period = self.period;
        self.runtime.spawn(async move {
            tokio::time::sleep(period).await;
            let _ = tokio::task::spawn_blocking(move || inner.fire()).await;
        });
    }

    fn fire(&self) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = {
            let mut pending = self.lock_pending();
            pending.armed = false;
            mem::take(&mut pending.records)
        };
        deliver_guarded(&self.errors, &self.label, &*self.target, batch);
    }

    fn deliver_now(&self) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = mem::take(&mut self.lock_pending().records);
        deliver_guarded(&self.errors, &self.label, &*self.target, batch);
    }
}

impl CollectMiddleware for TimerQueue {
    fn accept(&self, record: Arc<LogRecord>) {
        let mut pending = self.inner.lock_pending();
        if self.inner.disposed.load(Ordering::Acquire) {
            drop(pending);
            let _delivery = self.inner.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            return deliver_guarded(&self.inner.errors, &self.inner.label, &*self.inner.target, vec![record]);
        }
        pending.records.push(record);
        if !pending.armed {
            pending.armed = true;
            drop(pending);
            self.inner.arm();
        }
    }

    fn flush(&self) {
        self.inner.deliver_now();
    }

    fn dispose(&self) {
        {
            let _pending = self.inner.lock_pending();
            self.inner.disposed.store(true, Ordering::Release);
        }
        self.inner.deliver_now();
    }
}
