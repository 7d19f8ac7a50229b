use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log_pipeline::catalog;
use log_pipeline::log_args;
use log_pipeline::noop_sink::NoopSink;
use log_pipeline::{Pipeline, PipelineConfig};

const PRODUCERS: u64 = 8;
const PER_PRODUCER: u64 = 125_000;

/// Measures throughput of each execution/collect pairing into a sink that
/// discards everything.
fn main() -> Result<(), Box<dyn Error>> {
    let pairings = [
        (catalog::SYNC, catalog::PASS_THROUGH),
        (catalog::THREAD_POOL, catalog::PASS_THROUGH),
        (catalog::THREAD_POOL, catalog::CONCURRENT),
        (catalog::DEDICATED_THREAD, catalog::PASS_THROUGH),
        (catalog::DEDICATED_THREAD, catalog::TIMER),
    ];

    for (execution, collect) in pairings {
        let pipeline = Arc::new(Pipeline::new(PipelineConfig::from_env())?);
        pipeline.add_sink(NoopSink::default())?;
        pipeline.set_execution_middleware("noop", execution)?;
        pipeline.set_collect_middleware("noop", collect)?;

        let start = Instant::now();
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || {
                    let log = pipeline.logger("load");
                    for i in 0..PER_PRODUCER {
                        log.info("producer {P} iteration {I}", log_args![p, i]);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().map_err(|_| "producer thread panicked")?;
        }
        let logged = start.elapsed();
        pipeline.flush();
        let drained = start.elapsed();

        let n = PRODUCERS * PER_PRODUCER;
        println!(
            "{execution:>16} + {collect:<12} logged {n} events in {logged:?}, drained in {drained:?} (~{:.0} ev/s)",
            n as f64 / drained.as_secs_f64()
        );
        pipeline.dispose();
    }
    Ok(())
}
