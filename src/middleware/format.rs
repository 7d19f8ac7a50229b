//! Format middleware and the per-value-kind override table.

use chrono::SecondsFormat;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};

use super::FormatMiddleware;
use crate::record::LogRecord;
use crate::template;
use crate::value::{LogValue, ValueKind};

/// Custom renderer for every argument of one [`ValueKind`].
pub type FormatOverride = Arc<dyn Fn(&LogValue) -> String + Send + Sync>;

/// Shared table of per-kind renderers consulted by the built-in formatters.
///
/// An explicit `{Name:spec}` in the template takes precedence over an
/// override for that argument.
#[derive(Default)]
pub struct FormatOverrides {
    table: RwLock<HashMap<ValueKind, FormatOverride>>,
}

impl FormatOverrides {
    /// Install `render` for `kind`. Returns `false` if that exact renderer
    /// was already installed.
    pub fn set(&self, kind: ValueKind, render: FormatOverride) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = table.get(&kind) {
            if Arc::ptr_eq(current, &render) {
                return false;
            }
        }
        table.insert(kind, render);
        true
    }

    /// Remove the renderer for `kind`. Returns `false` if none was set.
    pub fn clear(&self, kind: ValueKind) -> bool {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }

    pub fn get(&self, kind: ValueKind) -> Option<FormatOverride> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn kinds(&self) -> Vec<ValueKind> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Render one value the way a placeholder would.
    pub fn render_value(&self, value: &LogValue, spec: Option<&str>) -> String {
        if let Some(spec) = spec {
            return value.format_with(spec);
        }
        match self.get(value.kind()) {
            Some(render) => render(value),
            None => value.to_string(),
        }
    }

    /// The record's message with overrides applied to its arguments.
    pub fn render_message(&self, record: &LogRecord) -> String {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        if table.is_empty() {
            return record.message();
        }
        template::interpolate_with(&record.template, &record.args, |value, spec| match spec {
            Some(spec) => value.format_with(spec),
            None => match table.get(&value.kind()) {
                Some(render) => render(value),
                None => value.to_string(),
            },
        })
    }
}

impl std::fmt::Debug for FormatOverrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatOverrides").field("kinds", &self.kinds()).finish()
    }
}

/// `2024-01-01T00:00:00.000Z INFO  category: message scope=.. error=..`
pub struct TextFormatter {
    overrides: Arc<FormatOverrides>,
}

impl TextFormatter {
    pub fn new(overrides: Arc<FormatOverrides>) -> Self {
        Self { overrides }
    }
}

impl FormatMiddleware for TextFormatter {
    fn render(&self, record: &LogRecord) -> String {
        let mut line = format!(
            "{} {:<5} {}: {}",
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            record.level,
            record.category,
            self.overrides.render_message(record),
        );
        if let Some(scope) = &record.scope {
            let _ = write!(line, " scope={}", self.overrides.render_value(scope, None));
        }
        if let Some(error) = &record.error {
            let _ = write!(line, " error={error}");
        }
        line
    }
}

/// One JSON object per record.
pub struct JsonFormatter {
    overrides: Arc<FormatOverrides>,
}

impl JsonFormatter {
    pub fn new(overrides: Arc<FormatOverrides>) -> Self {
        Self { overrides }
    }
}

impl FormatMiddleware for JsonFormatter {
    fn render(&self, record: &LogRecord) -> String {
        let args: Map<String, Value> = record
            .args
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::to_value(value).unwrap_or(Value::Null)))
            .collect();
        let mut object = json!({
            "timestamp": record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": record.level.as_str(),
            "category": record.category,
            "message": self.overrides.render_message(record),
            "template": record.template,
            "args": args,
        });
        if let Some(scope) = &record.scope {
            object["scope"] = serde_json::to_value(scope).unwrap_or(Value::Null);
        }
        if let Some(error) = &record.error {
            object["error"] = Value::String(error.to_string());
        }
        object.to_string()
    }
}
