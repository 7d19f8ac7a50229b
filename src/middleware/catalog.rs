//! Name → factory table for every middleware stage.
//!
//! The catalog is filled with the built-ins at construction and can be
//! extended by the host before or after sinks are added. Configuration only
//! ever refers to middleware by these names.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::collect::{ConcurrentCollector, PassThroughCollector, TimerQueue};
use super::execution::{DedicatedThreadExecution, SyncExecution, ThreadPoolExecution};
use super::filter::{AllowAll, DenyAll, MinLevelFilter};
use super::format::{JsonFormatter, TextFormatter};
use super::{
    BatchTarget, CollectMiddleware, ExecutionMiddleware, FilterMiddleware, FormatMiddleware,
    MiddlewareContext, Stage,
};
use crate::error::PipelineError;
use crate::level::Level;

pub const SYNC: &str = "sync";
pub const THREAD_POOL: &str = "thread-pool";
pub const DEDICATED_THREAD: &str = "dedicated-thread";

pub const PASS_THROUGH: &str = "pass-through";
pub const CONCURRENT: &str = "concurrent";
pub const TIMER: &str = "timer";

pub const ALLOW_ALL: &str = "allow-all";
pub const DENY_ALL: &str = "deny-all";
/// Prefix of the parameterized level filter, e.g. `min-level:warn`.
pub const MIN_LEVEL_PREFIX: &str = "min-level:";

pub const TEXT: &str = "text";
pub const JSON: &str = "json";

pub type ExecutionFactory =
    Arc<dyn Fn(&MiddlewareContext) -> Result<Arc<dyn ExecutionMiddleware>, PipelineError> + Send + Sync>;
pub type CollectFactory = Arc<
    dyn Fn(&MiddlewareContext, Arc<dyn BatchTarget>) -> Result<Arc<dyn CollectMiddleware>, PipelineError>
        + Send
        + Sync,
>;
pub type FilterFactory =
    Arc<dyn Fn(&MiddlewareContext) -> Result<Arc<dyn FilterMiddleware>, PipelineError> + Send + Sync>;
pub type FormatFactory =
    Arc<dyn Fn(&MiddlewareContext) -> Result<Arc<dyn FormatMiddleware>, PipelineError> + Send + Sync>;

#[derive(Clone)]
pub struct MiddlewareCatalog {
    execution: BTreeMap<String, ExecutionFactory>,
    collect: BTreeMap<String, CollectFactory>,
    filter: BTreeMap<String, FilterFactory>,
    format: BTreeMap<String, FormatFactory>,
}

impl Default for MiddlewareCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MiddlewareCatalog {
    /// A catalog with nothing registered.
    pub fn empty() -> Self {
        Self {
            execution: BTreeMap::new(),
            collect: BTreeMap::new(),
            filter: BTreeMap::new(),
            format: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut catalog = Self::empty();

        catalog.register_execution(SYNC, |ctx| Ok(Arc::new(SyncExecution::new(ctx))));
        catalog.register_execution(THREAD_POOL, |ctx| Ok(Arc::new(ThreadPoolExecution::new(ctx))));
        catalog.register_execution(DEDICATED_THREAD, |ctx| {
            Ok(Arc::new(DedicatedThreadExecution::new(ctx)?))
        });

        catalog.register_collect(PASS_THROUGH, |_, target| Ok(Arc::new(PassThroughCollector::new(target))));
        catalog.register_collect(CONCURRENT, |ctx, target| {
            Ok(Arc::new(ConcurrentCollector::new(ctx, target)?))
        });
        catalog.register_collect(TIMER, |ctx, target| Ok(Arc::new(TimerQueue::new(ctx, target))));

        catalog.register_filter(ALLOW_ALL, |_| Ok(Arc::new(AllowAll)));
        catalog.register_filter(DENY_ALL, |_| Ok(Arc::new(DenyAll)));

        catalog.register_format(TEXT, |ctx| Ok(Arc::new(TextFormatter::new(Arc::clone(&ctx.overrides)))));
        catalog.register_format(JSON, |ctx| Ok(Arc::new(JsonFormatter::new(Arc::clone(&ctx.overrides)))));

        catalog
    }

    pub fn register_execution<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext) -> Result<Arc<dyn ExecutionMiddleware>, PipelineError> + Send + Sync + 'static,
    {
        self.execution.insert(name.into(), Arc::new(factory));
    }

    pub fn register_collect<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext, Arc<dyn BatchTarget>) -> Result<Arc<dyn CollectMiddleware>, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        self.collect.insert(name.into(), Arc::new(factory));
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext) -> Result<Arc<dyn FilterMiddleware>, PipelineError> + Send + Sync + 'static,
    {
        self.filter.insert(name.into(), Arc::new(factory));
    }

    pub fn register_format<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&MiddlewareContext) -> Result<Arc<dyn FormatMiddleware>, PipelineError> + Send + Sync + 'static,
    {
        self.format.insert(name.into(), Arc::new(factory));
    }

    /// Whether `name` resolves for `stage`, including `min-level:<level>`
    /// filters with a valid level.
    pub fn contains(&self, stage: Stage, name: &str) -> bool {
        match stage {
            Stage::Execution => self.execution.contains_key(name),
            Stage::Collect => self.collect.contains_key(name),
            Stage::Filter => self.filter.contains_key(name) || parse_min_level(name).is_some(),
            Stage::Format => self.format.contains_key(name),
        }
    }

    /// Registered names for `stage`, sorted.
    pub fn names(&self, stage: Stage) -> Vec<String> {
        match stage {
            Stage::Execution => self.execution.keys().cloned().collect(),
            Stage::Collect => self.collect.keys().cloned().collect(),
            Stage::Filter => self.filter.keys().cloned().collect(),
            Stage::Format => self.format.keys().cloned().collect(),
        }
    }

    pub fn execution_factory(&self, name: &str) -> Result<ExecutionFactory, PipelineError> {
        self.execution
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(Stage::Execution, name))
    }

    pub fn collect_factory(&self, name: &str) -> Result<CollectFactory, PipelineError> {
        self.collect
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(Stage::Collect, name))
    }

    pub fn filter_factory(&self, name: &str) -> Result<FilterFactory, PipelineError> {
        if let Some(factory) = self.filter.get(name) {
            return Ok(Arc::clone(factory));
        }
        match parse_min_level(name) {
            Some(level) => {
                let factory: FilterFactory = Arc::new(
                    move |_: &MiddlewareContext| -> Result<Arc<dyn FilterMiddleware>, PipelineError> {
                        Ok(Arc::new(MinLevelFilter(level)))
                    },
                );
                Ok(factory)
            }
            None => Err(unknown(Stage::Filter, name)),
        }
    }

    pub fn format_factory(&self, name: &str) -> Result<FormatFactory, PipelineError> {
        self.format
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(Stage::Format, name))
    }
}

fn unknown(stage: Stage, name: &str) -> PipelineError {
    PipelineError::UnknownMiddleware {
        stage,
        name: name.to_string(),
    }
}

fn parse_min_level(name: &str) -> Option<Level> {
    name.strip_prefix(MIN_LEVEL_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let catalog = MiddlewareCatalog::default();
        assert_eq!(catalog.names(Stage::Execution), [DEDICATED_THREAD, SYNC, THREAD_POOL]);
        assert_eq!(catalog.names(Stage::Collect), [CONCURRENT, PASS_THROUGH, TIMER]);
        assert_eq!(catalog.names(Stage::Filter), [ALLOW_ALL, DENY_ALL]);
        assert_eq!(catalog.names(Stage::Format), [JSON, TEXT]);
        for stage in Stage::ALL {
            assert!(catalog.contains(stage, stage.default_middleware()));
        }
    }

    #[test]
    fn min_level_is_parameterized() {
        let catalog = MiddlewareCatalog::default();
        assert!(catalog.contains(Stage::Filter, "min-level:warn"));
        assert!(catalog.contains(Stage::Filter, "min-level:Warning"));
        assert!(!catalog.contains(Stage::Filter, "min-level:loud"));
        assert!(!catalog.contains(Stage::Execution, "min-level:warn"));
        assert!(catalog.filter_factory("min-level:error").is_ok());
    }

    #[test]
    fn unknown_names_are_reported() {
        let catalog = MiddlewareCatalog::default();
        let err = catalog.execution_factory("fibers").err().unwrap();
        assert!(matches!(err, PipelineError::UnknownMiddleware { stage: Stage::Execution, .. }));
    }

    #[test]
    fn hosts_can_register_their_own() {
        let mut catalog = MiddlewareCatalog::empty();
        assert!(!catalog.contains(Stage::Filter, "errors-only"));
        catalog.register_filter("errors-only", |_| {
            Ok(Arc::new(|_: &str, r: &crate::record::LogRecord| r.level >= Level::Error))
        });
        assert!(catalog.contains(Stage::Filter, "errors-only"));
    }
}
