#![cfg(feature = "tracing-bridge")]

use log_pipeline::layer::PipelineLayer;
use log_pipeline::memory_sink::MemorySink;
use log_pipeline::{Level, LogValue, Pipeline, PipelineConfig};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

fn setup() -> (Arc<Pipeline>, MemorySink) {
    let pipeline = Arc::new(Pipeline::new(PipelineConfig::default()).unwrap());
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    (pipeline, sink)
}

#[test]
fn events_become_records_with_named_fields() {
    let (pipeline, sink) = setup();
    let subscriber = Registry::default().with(PipelineLayer::new(Arc::clone(&pipeline)));

    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(target: "auth", user = "ann", attempts = 2u64, "logged in");
    });
    pipeline.flush();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.category, "auth");
    assert_eq!(record.level, Level::Info);
    assert_eq!(record.message(), "logged in user=ann attempts=2");
    assert_eq!(record.arg("user"), Some(&LogValue::from("ann")));
    assert_eq!(record.arg("attempts"), Some(&LogValue::from(2u64)));
}

#[test]
fn own_events_and_disabled_levels_are_skipped() {
    let (pipeline, sink) = setup();
    let layer = PipelineLayer::new(Arc::clone(&pipeline));
    let total = Arc::clone(&layer.total_events);
    let skipped = Arc::clone(&layer.skipped_events);
    let forwarded = Arc::clone(&layer.forwarded_events);
    let subscriber = Registry::default().with(layer);

    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!(target: "log_pipeline::binding", "internal");
        tracing::debug!(target: "app", "too quiet");
        tracing::error!(target: "app", "loud {}", "enough");
    });
    pipeline.flush();

    assert_eq!(total.load(Ordering::SeqCst), 3);
    assert_eq!(skipped.load(Ordering::SeqCst), 2);
    assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    assert_eq!(sink.messages(), ["loud enough"]);
}

#[test]
fn literal_braces_in_messages_survive() {
    let (pipeline, sink) = setup();
    let subscriber = Registry::default().with(PipelineLayer::new(Arc::clone(&pipeline)));

    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(target: "app", "map {{a}} id={}", 7);
    });
    pipeline.flush();

    assert_eq!(sink.messages(), ["map {a} id=7"]);
}
