//! Built-in filter middleware.

use std::collections::HashSet;

use super::FilterMiddleware;
use crate::level::Level;
use crate::record::LogRecord;

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl FilterMiddleware for AllowAll {
    fn admit(&self, _sink_kind: &str, _record: &LogRecord) -> bool {
        true
    }
}

/// Admits nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl FilterMiddleware for DenyAll {
    fn admit(&self, _sink_kind: &str, _record: &LogRecord) -> bool {
        false
    }
}

/// Per-sink level floor, applied on top of the pipeline's global gate.
#[derive(Debug, Clone, Copy)]
pub struct MinLevelFilter(pub Level);

impl FilterMiddleware for MinLevelFilter {
    fn admit(&self, _sink_kind: &str, record: &LogRecord) -> bool {
        record.level.passes(self.0)
    }
}

/// Rejects every record bound for one of the listed sink kinds.
#[derive(Debug, Clone, Default)]
pub struct KindFilter {
    rejected: HashSet<String>,
}

impl KindFilter {
    pub fn rejecting<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rejected: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl FilterMiddleware for KindFilter {
    fn admit(&self, sink_kind: &str, _record: &LogRecord) -> bool {
        !self.rejected.contains(sink_kind)
    }
}

/// Admits only categories starting with one of the given prefixes.
#[derive(Debug, Clone, Default)]
pub struct CategoryPrefixFilter {
    prefixes: Vec<String>,
}

impl CategoryPrefixFilter {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl FilterMiddleware for CategoryPrefixFilter {
    fn admit(&self, _sink_kind: &str, record: &LogRecord) -> bool {
        self.prefixes.iter().any(|prefix| record.category.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: Level, category: &str) -> LogRecord {
        LogRecord::new(level, category, "msg")
    }

    #[test]
    fn min_level_uses_the_same_gate_as_loggers() {
        let filter = MinLevelFilter(Level::Warn);
        assert!(!filter.admit("any", &record(Level::Info, "c")));
        assert!(filter.admit("any", &record(Level::Warn, "c")));
        assert!(filter.admit("any", &record(Level::Fatal, "c")));
    }

    #[test]
    fn kind_filter_only_rejects_listed_kinds() {
        let filter = KindFilter::rejecting(["X"]);
        assert!(!filter.admit("X", &record(Level::Info, "c")));
        assert!(filter.admit("Y", &record(Level::Info, "c")));
    }

    #[test]
    fn category_prefix() {
        let filter = CategoryPrefixFilter::new(["app::db", "app::http"]);
        assert!(filter.admit("k", &record(Level::Info, "app::db::pool")));
        assert!(!filter.admit("k", &record(Level::Info, "app::cache")));
    }

    #[test]
    fn closures_are_filters() {
        let only_errors = |_: &str, r: &LogRecord| r.level >= Level::Error;
        let filter: &dyn FilterMiddleware = &only_errors;
        assert!(filter.admit("k", &record(Level::Error, "c")));
        assert!(!filter.admit("k", &record(Level::Info, "c")));
    }
}
