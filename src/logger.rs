use std::error::Error;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::binding::SinkBinding;
use crate::error::ErrorSink;
use crate::level::Level;
use crate::record::{PendingArgs, PendingRecord, RecordError};
use crate::registry::{LevelObserver, PipelineRegistry};
use crate::scope::{self, ScopeGuard};
use crate::value::LogValue;

static NEXT_LOGGER_ID: AtomicU64 = AtomicU64::new(1);

/// The logger state for one sink: the sink's binding, a category and a
/// cached copy of the global level.
///
/// The pool keeps one category-less prototype per sink and derives
/// per-category instances from it with [`SinkLogger::for_category`].
pub struct SinkLogger {
    binding: Arc<SinkBinding>,
    category: Arc<str>,
    level: AtomicU8,
}

impl SinkLogger {
    pub(crate) fn prototype(binding: Arc<SinkBinding>) -> Self {
        Self {
            binding,
            category: Arc::from(""),
            level: AtomicU8::new(Level::None as u8),
        }
    }

    /// New logger state for `category`.
    ///
    /// Only the binding reference is carried over. The category is stamped
    /// and the level cache starts fresh, subscribed to `registry`.
    pub(crate) fn for_category(&self, category: Arc<str>, registry: &PipelineRegistry) -> Arc<SinkLogger> {
        let clone = Arc::new(SinkLogger {
            binding: Arc::clone(&self.binding),
            category,
            level: AtomicU8::new(Level::None as u8),
        });
        let weak: Weak<dyn LevelObserver> = Arc::downgrade(&clone) as Weak<dyn LevelObserver>;
        registry.subscribe_level(weak);
        clone
    }

    pub fn binding(&self) -> &Arc<SinkBinding> {
        &self.binding
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    #[inline]
    fn enabled(&self, level: Level) -> bool {
        level.passes(self.level())
    }

    /// Hand the record to this sink's execution stage.
    fn dispatch(&self, pending: &Arc<PendingRecord>) {
        let binding = Arc::clone(&self.binding);
        let pending = Arc::clone(pending);
        self.binding
            .execution()
            .execute(Box::new(move || binding.dispatch(pending.record())));
    }
}

impl LevelObserver for SinkLogger {
    fn on_level_changed(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }
}

/// What a [`Logger`] writes to.
pub(crate) enum DispatchTarget {
    Empty,
    Single(Arc<SinkLogger>),
    FanOut(Vec<Arc<SinkLogger>>),
}

impl DispatchTarget {
    pub(crate) fn from_loggers(mut loggers: Vec<Arc<SinkLogger>>) -> Self {
        match loggers.len() {
            0 => DispatchTarget::Empty,
            1 => DispatchTarget::Single(loggers.remove(0)),
            _ => DispatchTarget::FanOut(loggers),
        }
    }

    fn loggers(&self) -> &[Arc<SinkLogger>] {
        match self {
            DispatchTarget::Empty => &[],
            DispatchTarget::Single(logger) => std::slice::from_ref(logger),
            DispatchTarget::FanOut(loggers) => loggers,
        }
    }

    fn push(&mut self, logger: Arc<SinkLogger>) {
        let current = std::mem::replace(self, DispatchTarget::Empty);
        let mut loggers = match current {
            DispatchTarget::Empty => Vec::new(),
            DispatchTarget::Single(existing) => vec![existing],
            DispatchTarget::FanOut(existing) => existing,
        };
        loggers.push(logger);
        *self = DispatchTarget::from_loggers(loggers);
    }
}

/// Per-category entry point used by call sites.
///
/// Obtained from [`Pipeline::logger`](crate::pipeline::Pipeline::logger);
/// the same category always yields the same instance. Logging calls never
/// fail and never panic on behalf of a sink.
///
/// ```ignore
/// let log = pipeline.logger("orders");
/// log.info("order {Id} accepted for {Customer}", log_args![42, "acme"]);
/// ```
pub struct Logger {
    id: u64,
    category: Arc<str>,
    target: RwLock<DispatchTarget>,
    errors: Arc<ErrorSink>,
}

impl Logger {
    pub(crate) fn new(category: Arc<str>, target: DispatchTarget, errors: Arc<ErrorSink>) -> Self {
        Self {
            id: NEXT_LOGGER_ID.fetch_add(1, Ordering::Relaxed),
            category,
            target: RwLock::new(target),
            errors,
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Names of the sinks this logger writes to.
    pub fn sink_names(&self) -> Vec<String> {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loggers()
            .iter()
            .map(|logger| logger.binding.name().to_string())
            .collect()
    }

    pub(crate) fn attach(&self, logger: Arc<SinkLogger>) {
        self.target
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(logger);
    }

    /// Whether a call at `level` would reach at least one sink.
    pub fn is_enabled(&self, level: Level) -> bool {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loggers()
            .iter()
            .any(|logger| logger.enabled(level))
    }

    fn emit(&self, level: Level, template: &str, args: PendingArgs, error: Option<RecordError>) {
        let target = self.target.read().unwrap_or_else(PoisonError::into_inner);
        let loggers = target.loggers();
        if !loggers.iter().any(|logger| logger.enabled(level)) {
            return;
        }
        let pending = Arc::new(PendingRecord::new(
            level,
            Arc::clone(&self.category),
            scope::current(self.id),
            template.to_string(),
            args,
            error,
        ));
        for logger in loggers.iter().filter(|logger| logger.enabled(level)) {
            logger.dispatch(&pending);
        }
    }

    /// Log `template` with positional `args` bound to its placeholders.
    pub fn log(&self, level: Level, template: &str, args: &[LogValue]) {
        self.emit(level, template, PendingArgs::Positional(args.to_vec()), None);
    }

    pub fn log_error<E>(&self, level: Level, error: E, template: &str, args: &[LogValue])
    where
        E: Error + Send + Sync + 'static,
    {
        let error: RecordError = Arc::new(error);
        self.emit(level, template, PendingArgs::Positional(args.to_vec()), Some(error));
    }

    /// Log with arguments already bound by name, e.g. fields of a `tracing`
    /// event.
    pub fn log_named(&self, level: Level, template: &str, pairs: Vec<(String, LogValue)>) {
        self.emit(level, template, PendingArgs::Named(pairs), None);
    }

    pub fn trace(&self, template: &str, args: &[LogValue]) {
        self.log(Level::Trace, template, args);
    }

    pub fn debug(&self, template: &str, args: &[LogValue]) {
        self.log(Level::Debug, template, args);
    }

    pub fn info(&self, template: &str, args: &[LogValue]) {
        self.log(Level::Info, template, args);
    }

    pub fn warn(&self, template: &str, args: &[LogValue]) {
        self.log(Level::Warn, template, args);
    }

    pub fn error(&self, template: &str, args: &[LogValue]) {
        self.log(Level::Error, template, args);
    }

    pub fn fatal(&self, template: &str, args: &[LogValue]) {
        self.log(Level::Fatal, template, args);
    }

    pub fn error_with<E>(&self, error: E, template: &str, args: &[LogValue])
    where
        E: Error + Send + Sync + 'static,
    {
        self.log_error(Level::Error, error, template, args);
    }

    pub fn fatal_with<E>(&self, error: E, template: &str, args: &[LogValue])
    where
        E: Error + Send + Sync + 'static,
    {
        self.log_error(Level::Fatal, error, template, args);
    }

    /// Push `state` onto this logger's scope stack for the current thread.
    ///
    /// Records logged on this thread while the guard lives carry `state`,
    /// wherever they are delivered.
    pub fn begin_scope(&self, state: impl Into<LogValue>) -> ScopeGuard {
        ScopeGuard::enter(self.id, Arc::clone(&self.category), Arc::clone(&self.errors), state.into())
    }

    /// Innermost scope state on the current thread.
    pub fn current_scope(&self) -> Option<LogValue> {
        scope::current(self.id)
    }

    pub fn scope_depth(&self) -> usize {
        scope::depth(self.id)
    }

    /// Flush every sink this logger writes to.
    pub fn flush(&self) {
        let bindings: Vec<Arc<SinkBinding>> = self
            .target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loggers()
            .iter()
            .map(|logger| Arc::clone(&logger.binding))
            .collect();
        for binding in bindings {
            binding.flush();
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("category", &self.category)
            .field("sinks", &self.sink_names())
            .finish()
    }
}
