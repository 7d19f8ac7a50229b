use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::error::Error;
use std::sync::Arc;

use crate::level::Level;
use crate::template;
use crate::value::LogValue;

/// Error attached to a record, shared between every sink that receives it.
pub type RecordError = Arc<dyn Error + Send + Sync>;

/// A single log event as seen by middleware and sinks.
///
/// Records are shared as `Arc<LogRecord>` and may be handed to several sinks
/// on different threads at once, so they are never mutated after
/// construction. Enrichment goes through [`LogRecord::with_arg`], which
/// returns a new record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub category: String,
    pub scope: Option<LogValue>,
    pub template: String,
    #[serde(serialize_with = "serialize_args")]
    pub args: Vec<(String, LogValue)>,
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
}

impl LogRecord {
    pub fn new(level: Level, category: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: category.into(),
            scope: None,
            template: template.into(),
            args: Vec::new(),
            error: None,
        }
    }

    /// The template rendered with this record's arguments.
    pub fn message(&self) -> String {
        template::interpolate(&self.template, &self.args)
    }

    /// Look up a bound argument by placeholder name.
    pub fn arg(&self, name: &str) -> Option<&LogValue> {
        self.args.iter().find(|(bound, _)| bound == name).map(|(_, value)| value)
    }

    /// Copy of this record with one more argument appended.
    pub fn with_arg(&self, name: impl Into<String>, value: impl Into<LogValue>) -> LogRecord {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.extend(self.args.iter().cloned());
        args.push((name.into(), value.into()));
        LogRecord { args, ..self.clone() }
    }
}

fn serialize_args<S>(args: &[(String, LogValue)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(args.len()))?;
    for (name, value) in args {
        map.serialize_entry(name, value)?;
    }
    map.end()
}

fn serialize_error<S>(error: &Option<RecordError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match error {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

pub(crate) enum PendingArgs {
    Positional(Vec<LogValue>),
    Named(Vec<(String, LogValue)>),
}

/// Call-site capture of a log call, turned into a [`LogRecord`] on first use.
///
/// Timestamp and scope state are taken by value on the calling thread; the
/// template is only bound once some sink actually needs the record, which
/// may be on a worker thread.
pub(crate) struct PendingRecord {
    timestamp: DateTime<Utc>,
    level: Level,
    category: Arc<str>,
    scope: Option<LogValue>,
    template: String,
    args: PendingArgs,
    error: Option<RecordError>,
    built: OnceCell<Arc<LogRecord>>,
}

impl PendingRecord {
    pub(crate) fn new(
        level: Level,
        category: Arc<str>,
        scope: Option<LogValue>,
        template: String,
        args: PendingArgs,
        error: Option<RecordError>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category,
            scope,
            template,
            args,
            error,
            built: OnceCell::new(),
        }
    }

    pub(crate) fn record(&self) -> Arc<LogRecord> {
        Arc::clone(self.built.get_or_init(|| {
            let args = match &self.args {
                PendingArgs::Positional(values) => template::parse(&self.template, values.iter().cloned()),
                PendingArgs::Named(pairs) => pairs.clone(),
            };
            Arc::new(LogRecord {
                timestamp: self.timestamp,
                level: self.level,
                category: self.category.to_string(),
                scope: self.scope.clone(),
                template: self.template.clone(),
                args,
                error: self.error.clone(),
            })
        }))
    }
}
