//! Execution middleware: where and when a dispatch runs.
//!
//! - [`SyncExecution`] runs on the caller's thread.
//! - [`ThreadPoolExecution`] queues actions and drains them on the pipeline
//!   runtime's blocking pool, one drain at a time.
//! - [`DedicatedThreadExecution`] feeds a single long-lived worker thread.
//!
//! Both asynchronous variants move between `Idle` and `Draining`; `flush`
//! forces a full drain before returning and `dispose` drains and stops for
//! good. A panicking action is reported and never takes a worker down.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{run_guarded, Action, ExecutionMiddleware, MiddlewareContext};
use crate::error::{ErrorSink, PipelineError};

/// How long a flushing caller waits before re-checking that a drain is
/// actually scheduled.
const FLUSH_POLL: Duration = Duration::from_millis(50);

/// Runs every action inline. Flush is a no-op.
pub struct SyncExecution {
    errors: Arc<ErrorSink>,
    label: String,
}

impl SyncExecution {
    pub fn new(ctx: &MiddlewareContext) -> Self {
        Self {
            errors: Arc::clone(&ctx.errors),
            label: format!("sync execution for `{}`", ctx.sink_name),
        }
    }
}

impl ExecutionMiddleware for SyncExecution {
    fn execute(&self, action: Action) {
        run_guarded(&self.errors, &self.label, action);
    }

    fn flush(&self) {}

    fn dispose(&self) {}
}

/// Queue drained opportunistically on the runtime's blocking pool.
///
/// Producers push onto a lock-free queue and start a drain whenever none is
/// running. The drain exits once the queue is empty. After dispose the
/// producer drains on its own thread, still one drainer at a time.
pub struct ThreadPoolExecution {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue_tx: Sender<Action>,
    queue_rx: Receiver<Action>,
    running: AtomicBool,
    disposed: AtomicBool,
    idle_lock: Mutex<()>,
    idle: Condvar,
    runtime: Handle,
    errors: Arc<ErrorSink>,
    label: String,
}

impl ThreadPoolExecution {
    pub fn new(ctx: &MiddlewareContext) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(PoolInner {
                queue_tx,
                queue_rx,
                running: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
                runtime: ctx.runtime.clone(),
                errors: Arc::clone(&ctx.errors),
                label: format!("thread-pool execution for `{}`", ctx.sink_name),
            }),
        }
    }

    /// Number of actions waiting for a drain.
    pub fn pending(&self) -> usize {
        self.inner.queue_rx.len()
    }
}

impl PoolInner {
    fn schedule(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(self);
            self.runtime.spawn_blocking(move || inner.drain());
        }
    }

    fn drain(&self) {
        loop {
            while let Ok(action) = self.queue_rx.try_recv() {
                run_guarded(&self.errors, &self.label, action);
            }
            self.running.store(false, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            // A producer that enqueued after the last `try_recv` may have seen
            // `running == true` and skipped scheduling.
            if self.queue_rx.is_empty()
                || self
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                break;
            }
        }
        let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.idle.notify_all();
    }

    /// Drain on the calling thread, waiting out any drainer that already
    /// holds the queue so actions keep their enqueue order.
    fn drain_here(&self) {
        while !self.queue_rx.is_empty() {
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.drain();
            } else {
                thread::yield_now();
            }
        }
    }

    fn busy(&self) -> bool {
        self.running.load(Ordering::SeqCst) || !self.queue_rx.is_empty()
    }
}

impl ExecutionMiddleware for ThreadPoolExecution {
    fn execute(&self, action: Action) {
        match self.inner.queue_tx.send(action) {
            Ok(()) => {
                fence(Ordering::SeqCst);
                if self.inner.disposed.load(Ordering::SeqCst) {
                    // Dispose's drain may be over, so this thread drains.
                    return self.inner.drain_here();
                }
                self.inner.schedule();
            }
            Err(crossbeam_channel::SendError(action)) => {
                run_guarded(&self.inner.errors, &self.inner.label, action)
            }
        }
    }

    fn flush(&self) {
        let inner = &self.inner;
        let mut guard = inner.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while inner.busy() {
            if !inner.queue_rx.is_empty() {
                inner.schedule();
            }
            guard = inner
                .idle
                .wait_timeout(guard, FLUSH_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.flush();
    }
}

enum Command {
    Run(Action),
    Stop,
}

/// A single named worker thread fed through an unbounded channel.
///
/// Producers never block. The worker drains everything available on each
/// wake-up and parks on the channel otherwise. Flushing stops the worker at
/// a marker, joins it, and starts a replacement on the same channel.
pub struct DedicatedThreadExecution {
    tx: UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<UnboundedReceiver<Command>>>>,
    errors: Arc<ErrorSink>,
    label: String,
    thread_name: String,
}

impl DedicatedThreadExecution {
    pub fn new(ctx: &MiddlewareContext) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = format!("dedicated-thread execution for `{}`", ctx.sink_name);
        let thread_name = format!("log-exec-{}", ctx.sink_name);
        let handle = spawn_worker(&thread_name, rx, Arc::clone(&ctx.errors), label.clone())?;
        Ok(Self {
            tx,
            worker: Mutex::new(Some(handle)),
            errors: Arc::clone(&ctx.errors),
            label,
            thread_name,
        })
    }

    /// Stop the current worker after everything queued ahead of the stop
    /// marker, and hand back its receiver.
    fn stop_worker(&self, handle: JoinHandle<UnboundedReceiver<Command>>) -> Option<UnboundedReceiver<Command>> {
        if self.tx.send(Command::Stop).is_err() {
            return None;
        }
        match handle.join() {
            Ok(rx) => Some(rx),
            Err(payload) => {
                self.errors.handle(PipelineError::from_panic(self.label.clone(), payload));
                None
            }
        }
    }
}

fn spawn_worker(
    thread_name: &str,
    rx: UnboundedReceiver<Command>,
    errors: Arc<ErrorSink>,
    label: String,
) -> std::io::Result<JoinHandle<UnboundedReceiver<Command>>> {
    thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || worker_loop(rx, &errors, &label))
}

fn worker_loop(
    mut rx: UnboundedReceiver<Command>,
    errors: &ErrorSink,
    label: &str,
) -> UnboundedReceiver<Command> {
    while let Some(first) = rx.blocking_recv() {
        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                Command::Run(action) => run_guarded(errors, label, action),
                Command::Stop => return rx,
            }
            next = rx.try_recv().ok();
        }
    }
    rx
}

impl ExecutionMiddleware for DedicatedThreadExecution {
    fn execute(&self, action: Action) {
        if let Err(mpsc::error::SendError(Command::Run(action))) = self.tx.send(Command::Run(action)) {
            run_guarded(&self.errors, &self.label, action);
        }
    }

    fn flush(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = worker.take() else {
            return;
        };
        let Some(rx) = self.stop_worker(handle) else {
            return;
        };
        match spawn_worker(&self.thread_name, rx, Arc::clone(&self.errors), self.label.clone()) {
            Ok(handle) => *worker = Some(handle),
            Err(err) => self.errors.handle(PipelineError::Runtime(err)),
        }
    }

    fn dispose(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = worker.take() else {
            return;
        };
        if let Some(mut rx) = self.stop_worker(handle) {
            rx.close();
            while let Ok(command) = rx.try_recv() {
                if let Command::Run(action) = command {
                    run_guarded(&self.errors, &self.label, action);
                }
            }
        }
    }
}
