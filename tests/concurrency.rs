use log_pipeline::catalog;
use log_pipeline::log_args;
use log_pipeline::{LogBatch, Pipeline, PipelineConfig, Sink, SinkError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const PRODUCERS: usize = 8;
const TOTAL: usize = 1_000_000;

/// Counts records without rendering them.
#[derive(Clone, Default)]
struct Counting {
    records: Arc<AtomicUsize>,
}

impl Sink for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError> {
        self.records.fetch_add(batch.len(), Ordering::Relaxed);
        Ok(())
    }
}

fn hammer(execution: &str, collect: &str) -> usize {
    let pipeline = Arc::new(Pipeline::new(PipelineConfig::default()).unwrap());
    let sink = Counting::default();
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_execution_middleware("counting", execution).unwrap();
    pipeline.set_collect_middleware("counting", collect).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let log = pipeline.logger("load");
                for i in 0..TOTAL / PRODUCERS {
                    log.info("producer {P} record {I}", log_args![p, i]);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    pipeline.flush();
    sink.records.load(Ordering::SeqCst)
}

#[test]
fn thread_pool_delivers_every_record_exactly_once() {
    assert_eq!(hammer(catalog::THREAD_POOL, catalog::PASS_THROUGH), TOTAL);
}

#[test]
fn dedicated_thread_delivers_every_record_exactly_once() {
    assert_eq!(hammer(catalog::DEDICATED_THREAD, catalog::PASS_THROUGH), TOTAL);
}

#[test]
fn concurrent_collector_under_load() {
    assert_eq!(hammer(catalog::THREAD_POOL, catalog::CONCURRENT), TOTAL);
}

/// Remembers which records it saw, to catch duplicates.
#[derive(Clone, Default)]
struct Distinct {
    seen: Arc<Mutex<HashSet<(u64, u64)>>>,
    duplicates: Arc<AtomicUsize>,
}

impl Sink for Distinct {
    fn name(&self) -> &str {
        "distinct"
    }

    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError> {
        let mut seen = self.seen.lock().unwrap();
        for record in batch.records() {
            let key = (
                record.arg("P").and_then(|v| v.to_string().parse().ok()).unwrap_or(u64::MAX),
                record.arg("I").and_then(|v| v.to_string().parse().ok()).unwrap_or(u64::MAX),
            );
            if !seen.insert(key) {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[test]
fn reconfiguring_under_concurrent_load_loses_nothing() {
    const PER_PRODUCER: usize = 20_000;
    let pipeline = Arc::new(Pipeline::new(PipelineConfig::default()).unwrap());
    let sink = Distinct::default();
    pipeline.add_sink(sink.clone()).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                let log = pipeline.logger("switching");
                for i in 0..PER_PRODUCER {
                    log.info("{P}/{I}", log_args![p, i]);
                }
            })
        })
        .collect();

    let stages = [
        (catalog::THREAD_POOL, catalog::CONCURRENT),
        (catalog::DEDICATED_THREAD, catalog::TIMER),
        (catalog::SYNC, catalog::PASS_THROUGH),
        (catalog::THREAD_POOL, catalog::PASS_THROUGH),
    ];
    for (execution, collect) in stages.iter().cycle().take(12) {
        pipeline.set_execution_middleware("distinct", execution).unwrap();
        pipeline.set_collect_middleware("distinct", collect).unwrap();
        thread::sleep(std::time::Duration::from_millis(2));
    }
    for producer in producers {
        producer.join().unwrap();
    }
    pipeline.flush();

    assert_eq!(sink.duplicates.load(Ordering::SeqCst), 0);
    assert_eq!(sink.seen.lock().unwrap().len(), 4 * PER_PRODUCER);
}
