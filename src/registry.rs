use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::config::{PipelineConfig, SinkStages};
use crate::error::{panic_message, ErrorSink, PipelineError};
use crate::level::Level;
use crate::middleware::catalog::MiddlewareCatalog;
use crate::middleware::format::FormatOverride;
use crate::middleware::{FormatOverrides, Stage};
use crate::value::ValueKind;

/// Notified on every effective change of the global level.
pub trait LevelObserver: Send + Sync {
    fn on_level_changed(&self, level: Level);
}

/// Notified when the middleware selected for a sink changes.
///
/// Every observer sees every change and ignores sinks it does not own.
/// Returning `Err` rejects the change: the registry restores the previous
/// selection and the setter fails.
pub trait MiddlewareObserver: Send + Sync {
    fn on_middleware_changed(&self, sink: &str, stage: Stage, name: &str) -> Result<(), PipelineError>;
}

/// Live configuration of one pipeline.
///
/// Each section (level, one map per stage, format overrides, catalog) has
/// its own lock so unrelated changes never serialize on each other. A
/// mutation reads the current value, compares, writes and notifies while
/// holding its section's writer lock; writing the value already in place
/// is a no-op that notifies nobody.
///
/// Stage selections stay readable while observers rebuild: the map itself
/// is only locked for the read-compare-write, never across notification.
/// A second change to the same stage waits for the first to finish.
pub struct PipelineRegistry {
    level: AtomicU8,
    level_lock: Mutex<()>,
    execution: Section,
    collect: Section,
    filter: Section,
    format: Section,
    overrides: Arc<FormatOverrides>,
    catalog: RwLock<MiddlewareCatalog>,
    level_observers: Mutex<Vec<Weak<dyn LevelObserver>>>,
    middleware_observers: Mutex<Vec<Weak<dyn MiddlewareObserver>>>,
    errors: Arc<ErrorSink>,
}

/// One stage's selections by sink name, plus the lock serializing changes.
#[derive(Default)]
struct Section {
    selections: Mutex<HashMap<String, String>>,
    writer: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Upgrade live observers and drop dead ones.
fn live<T: ?Sized>(observers: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    let mut observers = lock(observers);
    let mut alive = Vec::with_capacity(observers.len());
    observers.retain(|weak| match weak.upgrade() {
        Some(observer) => {
            alive.push(observer);
            true
        }
        None => false,
    });
    alive
}

impl PipelineRegistry {
    pub fn new(level: Level, errors: Arc<ErrorSink>) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
            level_lock: Mutex::new(()),
            execution: Section::default(),
            collect: Section::default(),
            filter: Section::default(),
            format: Section::default(),
            overrides: Arc::new(FormatOverrides::default()),
            catalog: RwLock::new(MiddlewareCatalog::default()),
            level_observers: Mutex::new(Vec::new()),
            middleware_observers: Mutex::new(Vec::new()),
            errors,
        }
    }

    pub fn errors(&self) -> &Arc<ErrorSink> {
        &self.errors
    }

    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Change the global level. Returns `false` when `level` was already set.
    pub fn set_level(&self, level: Level) -> bool {
        let _guard = lock(&self.level_lock);
        if self.level() == level {
            return false;
        }
        self.level.store(level as u8, Ordering::Release);
        for observer in live(&self.level_observers) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer.on_level_changed(level))) {
                self.errors
                    .handle(PipelineError::ObserverPanicked(panic_message(&payload)));
            }
        }
        true
    }

    /// Register a level observer. It is told the current level right away,
    /// under the level lock, so no change can slip in between.
    pub fn subscribe_level(&self, observer: Weak<dyn LevelObserver>) -> Level {
        let _guard = lock(&self.level_lock);
        let level = self.level();
        if let Some(live) = observer.upgrade() {
            live.on_level_changed(level);
            lock(&self.level_observers).push(observer);
        }
        level
    }

    pub fn subscribe_middleware(&self, observer: Weak<dyn MiddlewareObserver>) {
        lock(&self.middleware_observers).push(observer);
    }

    fn section(&self, stage: Stage) -> &Section {
        match stage {
            Stage::Execution => &self.execution,
            Stage::Collect => &self.collect,
            Stage::Filter => &self.filter,
            Stage::Format => &self.format,
        }
    }

    /// Middleware selected for `sink` at `stage`, or the stage default.
    pub fn middleware(&self, sink: &str, stage: Stage) -> String {
        lock(&self.section(stage).selections)
            .get(sink)
            .cloned()
            .unwrap_or_else(|| stage.default_middleware().to_string())
    }

    /// Select middleware `name` for `sink` at `stage`.
    ///
    /// **Returns**
    /// - `Ok(true)` if the selection changed and every observer accepted it.
    /// - `Ok(false)` if `name` was already selected; nobody is notified.
    ///   Selecting the stage default clears the explicit entry.
    /// - `Err(UnknownMiddleware)` if the catalog has no such name. Nothing
    ///   is written.
    /// - `Err(ConfigurationRejected)` if an observer failed to apply the
    ///   change. The previous selection is restored and the failure is also
    ///   reported to the error sink.
    pub fn set_middleware(&self, sink: &str, stage: Stage, name: &str) -> Result<bool, PipelineError> {
        if !self.with_catalog(|catalog| catalog.contains(stage, name)) {
            return Err(PipelineError::UnknownMiddleware {
                stage,
                name: name.to_string(),
            });
        }

        let section = self.section(stage);
        let _writer = lock(&section.writer);
        let previous = {
            let mut map = lock(&section.selections);
            let current = map.get(sink).map(String::as_str).unwrap_or(stage.default_middleware());
            if current == name {
                return Ok(false);
            }
            if name == stage.default_middleware() {
                map.remove(sink)
            } else {
                map.insert(sink.to_string(), name.to_string())
            }
        };

        for observer in live(&self.middleware_observers) {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_middleware_changed(sink, stage, name)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let mut map = lock(&section.selections);
                    match previous {
                        Some(previous) => map.insert(sink.to_string(), previous),
                        None => map.remove(sink),
                    };
                    drop(map);
                    let reason = err.to_string();
                    self.errors.handle(err);
                    return Err(PipelineError::ConfigurationRejected(reason));
                }
                Err(payload) => self
                    .errors
                    .handle(PipelineError::ObserverPanicked(panic_message(&payload))),
            }
        }
        Ok(true)
    }

    /// Shared override table read by the built-in formatters.
    pub fn overrides(&self) -> &Arc<FormatOverrides> {
        &self.overrides
    }

    /// Returns `false` if `render` is already the override for `kind`.
    pub fn set_format_override(&self, kind: ValueKind, render: FormatOverride) -> bool {
        self.overrides.set(kind, render)
    }

    pub fn clear_format_override(&self, kind: ValueKind) -> bool {
        self.overrides.clear(kind)
    }

    pub fn with_catalog<R>(&self, f: impl FnOnce(&MiddlewareCatalog) -> R) -> R {
        f(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Extend the catalog, e.g. with host-specific middleware.
    pub fn register(&self, f: impl FnOnce(&mut MiddlewareCatalog)) {
        f(&mut self.catalog.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Level plus every explicit per-sink selection.
    pub fn snapshot(&self) -> PipelineConfig {
        let mut sinks: BTreeMap<String, SinkStages> = BTreeMap::new();
        for stage in Stage::ALL {
            for (sink, name) in lock(&self.section(stage).selections).iter() {
                sinks.entry(sink.clone()).or_default().set(stage, name.clone());
            }
        }
        PipelineConfig {
            level: self.level(),
            sinks,
            ..PipelineConfig::default()
        }
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}
