use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::runtime::{Handle, Runtime};

use crate::binding::SinkBinding;
use crate::config::{PipelineConfig, RuntimeConfig};
use crate::error::{ErrorSink, PipelineError};
use crate::level::Level;
use crate::logger::{Logger, SinkLogger};
use crate::middleware::format::FormatOverride;
use crate::middleware::{
    BatchTarget, CollectMiddleware, ExecutionMiddleware, FilterMiddleware, FormatMiddleware, MiddlewareContext,
    Stage,
};
use crate::pool::LoggerPool;
use crate::registry::PipelineRegistry;
use crate::sink::Sink;
use crate::value::{LogValue, ValueKind};

/// Tokio runtime owned by one pipeline. Drives thread-pool drains and
/// timer-queue ticks.
struct PipelineRuntime {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl PipelineRuntime {
    fn new(config: &RuntimeConfig) -> Result<Self, PipelineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.max_blocking_threads.max(1))
            .thread_name("log-pipeline")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    fn shutdown(&self) {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(runtime) = runtime {
            // Safe to call from within another runtime, unlike dropping it.
            runtime.shutdown_background();
        }
    }
}

static GLOBAL: OnceCell<Arc<Pipeline>> = OnceCell::new();

/// A complete, independent logging pipeline: registry, logger pool, sink
/// bindings and the runtime their middleware runs on.
///
/// Every administrative call funnels into the registry, which propagates
/// the change to live bindings and loggers. Loggers handed out earlier keep
/// working across any reconfiguration.
///
/// ```ignore
/// let pipeline = Pipeline::new(PipelineConfig::default())?;
/// pipeline.add_sink(ConsoleSink::stdout("console"))?;
/// pipeline.set_execution_middleware("console", catalog::THREAD_POOL)?;
/// pipeline.logger("app").info("started in {Ms} ms", log_args![12]);
/// pipeline.dispose();
/// ```
pub struct Pipeline {
    registry: Arc<PipelineRegistry>,
    pool: LoggerPool,
    bindings: RwLock<Vec<Arc<SinkBinding>>>,
    runtime: PipelineRuntime,
    runtime_config: RuntimeConfig,
    errors: Arc<ErrorSink>,
    // Serializes administrative calls with each other and with dispose.
    admin: Mutex<()>,
    disposed: AtomicBool,
}

impl Pipeline {
    /// Build an isolated pipeline with its own error sink.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_errors(config, Arc::new(ErrorSink::new()))
    }

    /// Build a pipeline that reports into `errors`.
    pub fn with_errors(config: PipelineConfig, errors: Arc<ErrorSink>) -> Result<Self, PipelineError> {
        let runtime = PipelineRuntime::new(&config.runtime)?;
        let registry = Arc::new(PipelineRegistry::new(config.level, Arc::clone(&errors)));
        let pool = LoggerPool::new(Arc::clone(&registry), Arc::clone(&errors), config.late_sinks);
        let pipeline = Self {
            registry,
            pool,
            bindings: RwLock::new(Vec::new()),
            runtime,
            runtime_config: config.runtime.clone(),
            errors,
            admin: Mutex::new(()),
            disposed: AtomicBool::new(false),
        };
        pipeline.apply(&config)?;
        tracing::debug!(level = %config.level, "log pipeline created");
        Ok(pipeline)
    }

    /// Process-wide default pipeline, configured from the environment on
    /// first use. Nothing in the crate requires it.
    pub fn global() -> Result<Arc<Pipeline>, PipelineError> {
        GLOBAL
            .get_or_try_init(|| Pipeline::with_errors(PipelineConfig::from_env(), ErrorSink::global()).map(Arc::new))
            .map(Arc::clone)
    }

    fn admin(&self) -> Result<MutexGuard<'_, ()>, PipelineError> {
        let guard = self.admin.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_disposed() {
            return Err(PipelineError::Disposed);
        }
        Ok(guard)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn level(&self) -> Level {
        self.registry.level()
    }

    /// Change the global level. Existing loggers pick it up immediately.
    pub fn set_level(&self, level: Level) -> Result<bool, PipelineError> {
        let _admin = self.admin()?;
        Ok(self.registry.set_level(level))
    }

    /// Select middleware `name` for `sink` at `stage`.
    ///
    /// **Returns**
    /// - `Ok(true)` when the sink's chain was rebuilt.
    /// - `Ok(false)` when `name` was already selected.
    /// - `Err(..)` when the name is unknown or the middleware could not be
    ///   built; the previous middleware stays bound.
    pub fn set_middleware(&self, sink: &str, stage: Stage, name: &str) -> Result<bool, PipelineError> {
        let _admin = self.admin()?;
        self.registry.set_middleware(sink, stage, name)
    }

    pub fn set_execution_middleware(&self, sink: &str, name: &str) -> Result<bool, PipelineError> {
        self.set_middleware(sink, Stage::Execution, name)
    }

    pub fn set_collect_middleware(&self, sink: &str, name: &str) -> Result<bool, PipelineError> {
        self.set_middleware(sink, Stage::Collect, name)
    }

    pub fn set_filter_middleware(&self, sink: &str, name: &str) -> Result<bool, PipelineError> {
        self.set_middleware(sink, Stage::Filter, name)
    }

    pub fn set_format_middleware(&self, sink: &str, name: &str) -> Result<bool, PipelineError> {
        self.set_middleware(sink, Stage::Format, name)
    }

    pub fn middleware(&self, sink: &str, stage: Stage) -> String {
        self.registry.middleware(sink, stage)
    }

    /// Render every argument of `kind` with `render`, in every sink.
    pub fn set_format_override<F>(&self, kind: ValueKind, render: F) -> Result<bool, PipelineError>
    where
        F: Fn(&LogValue) -> String + Send + Sync + 'static,
    {
        let render: FormatOverride = Arc::new(render);
        let _admin = self.admin()?;
        Ok(self.registry.set_format_override(kind, render))
    }

    pub fn clear_format_override(&self, kind: ValueKind) -> Result<bool, PipelineError> {
        let _admin = self.admin()?;
        Ok(self.registry.clear_format_override(kind))
    }

    pub fn register_execution<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext) -> Result<Arc<dyn ExecutionMiddleware>, PipelineError> + Send + Sync + 'static,
    {
        self.registry.register(|catalog| catalog.register_execution(name, factory));
    }

    pub fn register_collect<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext, Arc<dyn BatchTarget>) -> Result<Arc<dyn CollectMiddleware>, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register(|catalog| catalog.register_collect(name, factory));
    }

    pub fn register_filter<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext) -> Result<Arc<dyn FilterMiddleware>, PipelineError> + Send + Sync + 'static,
    {
        self.registry.register(|catalog| catalog.register_filter(name, factory));
    }

    pub fn register_format<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext) -> Result<Arc<dyn FormatMiddleware>, PipelineError> + Send + Sync + 'static,
    {
        self.registry.register(|catalog| catalog.register_format(name, factory));
    }

    pub fn add_sink<S>(&self, sink: S) -> Result<Arc<SinkBinding>, PipelineError>
    where
        S: Sink + 'static,
    {
        self.add_sink_arc(Arc::new(sink))
    }

    /// Bind `sink` with the middleware currently selected for its name.
    ///
    /// Fails with [`PipelineError::DuplicateSink`] if a sink of the same
    /// name is already bound.
    pub fn add_sink_arc(&self, sink: Arc<dyn Sink>) -> Result<Arc<SinkBinding>, PipelineError> {
        let _admin = self.admin()?;
        let name = sink.name().to_string();
        if self.binding(&name).is_some() {
            return Err(PipelineError::DuplicateSink(name));
        }
        let context = MiddlewareContext {
            sink_name: name.clone(),
            runtime: self.runtime.handle.clone(),
            errors: Arc::clone(&self.errors),
            timer_period: self.runtime_config.timer_period(),
            overrides: Arc::clone(self.registry.overrides()),
        };
        let binding = SinkBinding::new(sink, Arc::clone(&self.registry), context)?;
        self.pool.add_prototype(SinkLogger::prototype(Arc::clone(&binding)));
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&binding));
        tracing::debug!(sink = %name, kind = %binding.kind(), "sink added");
        Ok(binding)
    }

    pub fn binding(&self, name: &str) -> Option<Arc<SinkBinding>> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|binding| binding.name() == name)
            .cloned()
    }

    fn bindings(&self) -> Vec<Arc<SinkBinding>> {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Names of the bound sinks, in the order they were added.
    pub fn sinks(&self) -> Vec<String> {
        self.bindings().iter().map(|binding| binding.name().to_string()).collect()
    }

    /// The logger for `category`. Same category, same instance.
    pub fn logger(&self, category: &str) -> Arc<Logger> {
        self.pool.get(category)
    }

    pub fn pool(&self) -> &LoggerPool {
        &self.pool
    }

    pub fn errors(&self) -> &Arc<ErrorSink> {
        &self.errors
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn runtime_handle(&self) -> Handle {
        self.runtime.handle.clone()
    }

    /// Current configuration, with every bound sink listed.
    pub fn snapshot(&self) -> PipelineConfig {
        let mut snapshot = self.registry.snapshot();
        for binding in self.bindings() {
            snapshot.sinks.entry(binding.name().to_string()).or_default();
        }
        snapshot.runtime = self.runtime_config.clone();
        snapshot.late_sinks = self.pool.late_sinks();
        snapshot
    }

    /// Apply the level and middleware selections of `config`.
    ///
    /// Every name is checked against the catalog before anything changes.
    /// If a middleware fails to build, the selections already made are
    /// restored and the error is returned. The level is only set once every
    /// stage is in place. Runtime sizing and the late-sink policy are fixed
    /// at construction and ignored here.
    pub fn apply(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
        let _admin = self.admin()?;
        for stages in config.sinks.values() {
            for stage in Stage::ALL {
                if let Some(name) = stages.get(stage) {
                    if !self.registry.with_catalog(|catalog| catalog.contains(stage, name)) {
                        return Err(PipelineError::UnknownMiddleware {
                            stage,
                            name: name.to_string(),
                        });
                    }
                }
            }
        }
        if config.runtime != self.runtime_config || config.late_sinks != self.pool.late_sinks() {
            tracing::warn!("runtime and late sink settings only take effect when a pipeline is created");
        }

        let mut applied: Vec<(&str, Stage, String)> = Vec::new();
        for (sink, stages) in &config.sinks {
            for stage in Stage::ALL {
                let Some(name) = stages.get(stage) else {
                    continue;
                };
                let previous = self.registry.middleware(sink, stage);
                match self.registry.set_middleware(sink, stage, name) {
                    Ok(true) => applied.push((sink.as_str(), stage, previous)),
                    Ok(false) => {}
                    Err(err) => {
                        self.roll_back(applied);
                        return Err(err);
                    }
                }
            }
        }
        // Last, so a rejected configuration never changes the level.
        self.registry.set_level(config.level);
        Ok(())
    }

    /// Restore selections changed by a failed [`Pipeline::apply`], newest
    /// first.
    fn roll_back(&self, applied: Vec<(&str, Stage, String)>) {
        for (sink, stage, previous) in applied.into_iter().rev() {
            if let Err(err) = self.registry.set_middleware(sink, stage, &previous) {
                self.errors.handle(err);
            }
        }
        tracing::debug!("rolled back a rejected pipeline configuration");
    }

    /// Block until every record logged so far has reached its sink.
    pub fn flush(&self) {
        if self.is_disposed() {
            return;
        }
        for binding in self.bindings() {
            binding.flush();
        }
    }

    /// Drain every binding, then dispose all stages and sinks and stop the
    /// runtime. Idempotent.
    ///
    /// Afterwards administrative calls fail with
    /// [`PipelineError::Disposed`] and records logged through existing
    /// loggers are dropped without reaching a sink.
    pub fn dispose(&self) {
        let _admin = self.admin.lock().unwrap_or_else(PoisonError::into_inner);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let bindings = self.bindings();
        for binding in &bindings {
            binding.flush();
        }
        for binding in &bindings {
            binding.dispose();
        }
        self.runtime.shutdown();
        tracing::debug!(sinks = bindings.len(), "log pipeline disposed");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("level", &self.level())
            .field("sinks", &self.sinks())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
