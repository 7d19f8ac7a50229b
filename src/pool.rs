use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::LateSinkPolicy;
use crate::error::ErrorSink;
use crate::logger::{DispatchTarget, Logger, SinkLogger};
use crate::registry::PipelineRegistry;

struct PoolState {
    prototypes: Vec<Arc<SinkLogger>>,
    loggers: HashMap<Arc<str>, Arc<Logger>>,
}

/// Per-category logger cache.
///
/// Holds one prototype [`SinkLogger`] per sink. The first request for a
/// category derives one logger state per prototype and wraps them in a
/// [`Logger`]; every later request for that category returns the same
/// `Arc`.
pub struct LoggerPool {
    state: RwLock<PoolState>,
    registry: Arc<PipelineRegistry>,
    errors: Arc<ErrorSink>,
    late_sinks: LateSinkPolicy,
}

impl LoggerPool {
    pub fn new(registry: Arc<PipelineRegistry>, errors: Arc<ErrorSink>, late_sinks: LateSinkPolicy) -> Self {
        Self {
            state: RwLock::new(PoolState {
                prototypes: Vec::new(),
                loggers: HashMap::new(),
            }),
            registry,
            errors,
            late_sinks,
        }
    }

    pub fn late_sinks(&self) -> LateSinkPolicy {
        self.late_sinks
    }

    /// The logger for `category`, created on first use.
    pub fn get(&self, category: &str) -> Arc<Logger> {
        if let Some(logger) = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loggers
            .get(category)
        {
            return Arc::clone(logger);
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(logger) = state.loggers.get(category) {
            return Arc::clone(logger);
        }
        let category: Arc<str> = Arc::from(category);
        let clones = state
            .prototypes
            .iter()
            .map(|prototype| prototype.for_category(Arc::clone(&category), &self.registry))
            .collect();
        let logger = Arc::new(Logger::new(
            Arc::clone(&category),
            DispatchTarget::from_loggers(clones),
            Arc::clone(&self.errors),
        ));
        state.loggers.insert(category, Arc::clone(&logger));
        tracing::debug!(category = %logger.category(), sinks = state.prototypes.len(), "created logger");
        logger
    }

    /// Register the prototype for a newly added sink.
    ///
    /// Loggers already handed out only pick it up under
    /// [`LateSinkPolicy::Retrofit`].
    ///
    /// Retrofitted loggers are attached after the pool lock is released, so
    /// a sink that looks up a logger while a caller is mid-dispatch cannot
    /// deadlock against it.
    pub(crate) fn add_prototype(&self, prototype: SinkLogger) {
        let prototype = Arc::new(prototype);
        let retrofit: Vec<(Arc<Logger>, Arc<SinkLogger>)> = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.prototypes.push(Arc::clone(&prototype));
            if self.late_sinks != LateSinkPolicy::Retrofit {
                return;
            }
            state
                .loggers
                .iter()
                .map(|(category, logger)| {
                    (
                        Arc::clone(logger),
                        prototype.for_category(Arc::clone(category), &self.registry),
                    )
                })
                .collect()
        };
        for (logger, sink_logger) in retrofit {
            logger.attach(sink_logger);
        }
    }

    /// Number of cached categories.
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .loggers
            .keys()
            .map(|category| category.to_string())
            .collect();
        categories.sort();
        categories
    }
}
