use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ErrorSink, PipelineError, SinkError};
use crate::middleware::{
    BatchTarget, CollectMiddleware, ExecutionMiddleware, FilterMiddleware, FormatMiddleware, MiddlewareContext,
    Stage,
};
use crate::record::LogRecord;
use crate::registry::{MiddlewareObserver, PipelineRegistry};
use crate::sink::{LogBatch, Sink};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Delivery end of a binding: the sink and its current formatter.
pub(crate) struct SinkDelivery {
    name: String,
    sink: Arc<dyn Sink>,
    format: RwLock<Arc<dyn FormatMiddleware>>,
    errors: Arc<ErrorSink>,
    disposed: AtomicBool,
}

impl SinkDelivery {
    fn report(&self, outcome: std::thread::Result<Result<(), SinkError>>, operation: &str) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => self.errors.handle(PipelineError::SinkDelivery {
                sink: self.name.clone(),
                source,
            }),
            Err(payload) => self
                .errors
                .handle(PipelineError::from_panic(format!("sink `{}` {operation}", self.name), payload)),
        }
    }
}

impl BatchTarget for SinkDelivery {
    fn deliver(&self, batch: Vec<Arc<LogRecord>>) {
        if batch.is_empty() || self.disposed.load(Ordering::Acquire) {
            return;
        }
        let format = Arc::clone(&read(&self.format));
        let batch = LogBatch::new(&batch, &*format);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.sink.log(&batch)));
        self.report(outcome, "log");
    }
}

struct Chain {
    filter: Arc<dyn FilterMiddleware>,
    collect: Arc<dyn CollectMiddleware>,
}

/// One sink together with its live middleware chain.
///
/// The binding observes the registry and swaps individual stages in place
/// when the selection for its sink changes; loggers holding the binding
/// never need to be re-acquired.
pub struct SinkBinding {
    name: String,
    kind: String,
    delivery: Arc<SinkDelivery>,
    execution: RwLock<Arc<dyn ExecutionMiddleware>>,
    chain: RwLock<Chain>,
    registry: Arc<PipelineRegistry>,
    context: MiddlewareContext,
    // Serializes rebuilds with dispose.
    lifecycle: Mutex<()>,
    disposed: AtomicBool,
}

impl SinkBinding {
    /// Build the chain currently selected in `registry` for `sink` and
    /// subscribe to future changes.
    pub(crate) fn new(
        sink: Arc<dyn Sink>,
        registry: Arc<PipelineRegistry>,
        context: MiddlewareContext,
    ) -> Result<Arc<Self>, PipelineError> {
        let name = sink.name().to_string();
        let kind = sink.kind().to_string();

        let format = build_format(&registry, &context, &registry.middleware(&name, Stage::Format))?;
        let delivery = Arc::new(SinkDelivery {
            name: name.clone(),
            sink,
            format: RwLock::new(format),
            errors: Arc::clone(&context.errors),
            disposed: AtomicBool::new(false),
        });
        let execution = build_execution(&registry, &context, &registry.middleware(&name, Stage::Execution))?;
        let filter = build_filter(&registry, &context, &registry.middleware(&name, Stage::Filter))?;
        let collect = build_collect(
            &registry,
            &context,
            &delivery,
            &registry.middleware(&name, Stage::Collect),
        )?;

        let binding = Arc::new(Self {
            name,
            kind,
            delivery,
            execution: RwLock::new(execution),
            chain: RwLock::new(Chain { filter, collect }),
            registry: Arc::clone(&registry),
            context,
            lifecycle: Mutex::new(()),
            disposed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&binding);
        registry.subscribe_middleware(weak);
        Ok(binding)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sink's [`Sink::kind`], as seen by filters.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The current execution stage, cloned out so no lock is held while the
    /// caller executes.
    pub(crate) fn execution(&self) -> Arc<dyn ExecutionMiddleware> {
        Arc::clone(&read(&self.execution))
    }

    /// Filter and collect one record. Runs on the thread the execution
    /// stage picked.
    ///
    /// The chain's read lock stays held across `accept`, so a concurrent
    /// reconfiguration cannot dispose the collector underneath it.
    pub(crate) fn dispatch(&self, record: Arc<LogRecord>) {
        if self.delivery.disposed.load(Ordering::Acquire) {
            return;
        }
        let chain = read(&self.chain);
        if chain.filter.admit(&self.kind, &record) {
            chain.collect.accept(record);
        }
    }

    /// Replace the stage `stage` with a fresh instance of middleware `name`.
    ///
    /// The old execution and collect stages are drained while their write
    /// lock is held, so nothing accepted by the new stage overtakes them.
    fn rebuild(&self, stage: Stage, name: &str) -> Result<(), PipelineError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            return Ok(());
        }
        match stage {
            Stage::Execution => {
                let fresh = build_execution(&self.registry, &self.context, name)?;
                let mut slot = write(&self.execution);
                let old = std::mem::replace(&mut *slot, fresh);
                old.dispose();
            }
            Stage::Filter => {
                let fresh = build_filter(&self.registry, &self.context, name)?;
                write(&self.chain).filter = fresh;
            }
            Stage::Collect => {
                let fresh = build_collect(&self.registry, &self.context, &self.delivery, name)?;
                let mut chain = write(&self.chain);
                let old = std::mem::replace(&mut chain.collect, fresh);
                old.dispose();
            }
            Stage::Format => {
                let fresh = build_format(&self.registry, &self.context, name)?;
                *write(&self.delivery.format) = fresh;
            }
        }
        tracing::debug!(sink = %self.name, stage = %stage, middleware = name, "rebuilt middleware stage");
        Ok(())
    }

    /// Drain execution, then collect, then flush the sink.
    pub fn flush(&self) {
        self.execution().flush();
        let collect = Arc::clone(&read(&self.chain).collect);
        collect.flush();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.delivery.sink.flush()));
        self.delivery.report(outcome, "flush");
    }

    /// Drain and stop every stage, then dispose the sink. Idempotent.
    pub fn dispose(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.execution().dispose();
        read(&self.chain).collect.dispose();
        self.delivery.disposed.store(true, Ordering::Release);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.delivery.sink.dispose()));
        self.delivery.report(outcome, "dispose");
        tracing::debug!(sink = %self.name, "sink binding disposed");
    }
}

impl MiddlewareObserver for SinkBinding {
    fn on_middleware_changed(&self, sink: &str, stage: Stage, name: &str) -> Result<(), PipelineError> {
        if sink != self.name {
            return Ok(());
        }
        self.rebuild(stage, name)
    }
}

impl std::fmt::Debug for SinkBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkBinding")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn construction(context: &MiddlewareContext, stage: Stage, name: &str, err: PipelineError) -> PipelineError {
    match err {
        err @ (PipelineError::MiddlewareConstruction { .. } | PipelineError::UnknownMiddleware { .. }) => err,
        other => PipelineError::MiddlewareConstruction {
            sink: context.sink_name.clone(),
            stage,
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}

fn build_execution(
    registry: &PipelineRegistry,
    context: &MiddlewareContext,
    name: &str,
) -> Result<Arc<dyn ExecutionMiddleware>, PipelineError> {
    let factory = registry.with_catalog(|catalog| catalog.execution_factory(name))?;
    factory(context).map_err(|err| construction(context, Stage::Execution, name, err))
}

fn build_filter(
    registry: &PipelineRegistry,
    context: &MiddlewareContext,
    name: &str,
) -> Result<Arc<dyn FilterMiddleware>, PipelineError> {
    let factory = registry.with_catalog(|catalog| catalog.filter_factory(name))?;
    factory(context).map_err(|err| construction(context, Stage::Filter, name, err))
}

fn build_collect(
    registry: &PipelineRegistry,
    context: &MiddlewareContext,
    delivery: &Arc<SinkDelivery>,
    name: &str,
) -> Result<Arc<dyn CollectMiddleware>, PipelineError> {
    let factory = registry.with_catalog(|catalog| catalog.collect_factory(name))?;
    let target: Arc<dyn BatchTarget> = Arc::clone(delivery) as Arc<dyn BatchTarget>;
    factory(context, target).map_err(|err| construction(context, Stage::Collect, name, err))
}

fn build_format(
    registry: &PipelineRegistry,
    context: &MiddlewareContext,
    name: &str,
) -> Result<Arc<dyn FormatMiddleware>, PipelineError> {
    let factory = registry.with_catalog(|catalog| catalog.format_factory(name))?;
    factory(context).map_err(|err| construction(context, Stage::Format, name, err))
}
