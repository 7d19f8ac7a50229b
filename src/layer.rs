use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::level::Level;
use crate::pipeline::Pipeline;
use crate::value::LogValue;

/// Events from this crate are never forwarded, so a pipeline that reports
/// through `tracing` cannot feed on itself.
const OWN_TARGET: &str = "log_pipeline";

/// `tracing_subscriber` layer that forwards events into a [`Pipeline`].
///
/// The event target becomes the logger category and event fields become
/// named record arguments, appended to the message as `key={key}`
/// placeholders so text formatters show them.
pub struct PipelineLayer {
    pipeline: Arc<Pipeline>,
    /// Total events seen by the layer.
    pub total_events: Arc<AtomicU64>,
    /// Events handed to a logger.
    pub forwarded_events: Arc<AtomicU64>,
    /// Events below the pipeline level or emitted by this crate.
    pub skipped_events: Arc<AtomicU64>,
}

impl PipelineLayer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            total_events: Arc::new(AtomicU64::new(0)),
            forwarded_events: Arc::new(AtomicU64::new(0)),
            skipped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<S> Layer<S> for PipelineLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if meta.target().starts_with(OWN_TARGET) {
            self.skipped_events.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let level = Level::from(meta.level());
        let logger = self.pipeline.logger(meta.target());
        if !logger.is_enabled(level) {
            self.skipped_events.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut fields = Vec::new();
        let mut message: Option<String> = None;
        event.record(&mut FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        });

        let mut template = escape_braces(message.as_deref().unwrap_or_default());
        for (name, _) in &fields {
            if !template.is_empty() {
                template.push(' ');
            }
            template.push_str(&format!("{name}={{{name}}}"));
        }
        logger.log_named(level, &template, fields);
        self.forwarded_events.fetch_add(1, Ordering::Relaxed);
    }
}

fn escape_braces(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut Vec<(String, LogValue)>,
    pub message: &'a mut Option<String>,
}

impl FieldVisitor<'_> {
    fn insert(&mut self, field: &Field, value: LogValue) {
        self.fields.push((field.name().to_string(), value));
    }
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.insert(field, LogValue::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, LogValue::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, LogValue::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, LogValue::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, LogValue::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, LogValue::from(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.insert(field, LogValue::from(format!("{:?}", value)));
        }
    }
}
