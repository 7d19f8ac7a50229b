use log_pipeline::catalog;
use log_pipeline::log_args;
use log_pipeline::memory_sink::MemorySink;
use log_pipeline::middleware::filter::KindFilter;
use log_pipeline::{
    ErrorSink, Level, LateSinkPolicy, LogBatch, LogValue, Pipeline, PipelineConfig, PipelineError, Sink, SinkError,
    Stage, ValueKind,
};
use log_pipeline::registry::PipelineRegistry;
use once_cell::sync::OnceCell;
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig::default()).unwrap()
}

fn capture(errors: &ErrorSink) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    errors.on_error(move |err| sink.lock().unwrap().push(err.to_string()));
    seen
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

struct Failing;

impl Sink for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn log(&self, _batch: &LogBatch<'_>) -> Result<(), SinkError> {
        Err("disk full".into())
    }
}

struct Exploding;

impl Sink for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    fn log(&self, _batch: &LogBatch<'_>) -> Result<(), SinkError> {
        panic!("kaboom")
    }
}

#[test]
fn six_level_gate_table() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    let log = pipeline.logger("levels");

    for gate in Level::ALL {
        pipeline.set_level(gate).unwrap();
        sink.clear();
        for level in Level::ALL {
            assert_eq!(log.is_enabled(level), level >= gate);
            log.log(level, "at {Level}", log_args![level.as_str()]);
        }
        pipeline.flush();
        let delivered: Vec<Level> = sink.records().iter().map(|r| r.level).collect();
        let expected: Vec<Level> = Level::ALL.into_iter().filter(|l| *l >= gate).collect();
        assert_eq!(delivered, expected, "gate {gate}");
    }

    pipeline.set_level(Level::None).unwrap();
    sink.clear();
    log.fatal("silenced", &[]);
    log.log(Level::None, "never", &[]);
    pipeline.flush();
    assert!(sink.is_empty());
}

#[test]
fn lowering_the_level_reaches_existing_loggers() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_level(Level::Warn).unwrap();

    let log = pipeline.logger("svc");
    log.info("hidden", &[]);
    pipeline.flush();
    assert_eq!(sink.len(), 0);

    pipeline.set_level(Level::Info).unwrap();
    log.debug("still hidden", &[]);
    log.info("shown", &[]);
    log.error("also shown", &[]);
    pipeline.flush();
    assert_eq!(sink.messages(), ["shown", "also shown"]);
}

#[test]
fn filter_rejecting_one_sink_kind_leaves_others_alone() {
    let pipeline = pipeline();
    let x = MemorySink::new("x").with_kind("X");
    let plain = MemorySink::new("plain");
    pipeline.add_sink(x.clone()).unwrap();
    pipeline.add_sink(plain.clone()).unwrap();
    pipeline.register_filter("reject-x", |_| Ok(Arc::new(KindFilter::rejecting(["X"]))));
    pipeline.set_filter_middleware("x", "reject-x").unwrap();
    pipeline.set_filter_middleware("plain", "reject-x").unwrap();

    let log = pipeline.logger("fanout");
    for i in 0..10 {
        log.info("record {N}", log_args![i]);
    }
    pipeline.flush();
    assert_eq!(x.len(), 0);
    assert_eq!(plain.len(), 10);
}

#[test]
fn pool_returns_one_logger_per_category() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();

    let a1 = pipeline.logger("X");
    let a2 = pipeline.logger("X");
    let b = pipeline.logger("Y");
    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
    assert_eq!(pipeline.pool().categories(), ["X", "Y"]);

    a1.info("from x", &[]);
    b.info("from y", &[]);
    pipeline.flush();
    let categories: Vec<String> = sink.records().iter().map(|r| r.category.clone()).collect();
    assert_eq!(categories, ["X", "Y"]);
}

#[test]
fn nested_scopes_are_captured_before_the_thread_hop() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_execution_middleware("mem", catalog::THREAD_POOL).unwrap();
    let log = pipeline.logger("scoped");

    {
        let _outer = log.begin_scope("1");
        {
            let _inner = log.begin_scope("2");
            log.info("inner", &[]);
        }
        log.info("outer", &[]);
    }
    log.info("none", &[]);
    pipeline.flush();

    let scopes: Vec<Option<LogValue>> = sink.records().iter().map(|r| r.scope.clone()).collect();
    assert_eq!(scopes, [Some(LogValue::from("2")), Some(LogValue::from("1")), None]);
    assert_eq!(log.scope_depth(), 0);
}

#[test]
fn scopes_do_not_leak_between_loggers_or_threads() {
    let pipeline = pipeline();
    let a = pipeline.logger("a");
    let b = pipeline.logger("b");
    let _scope = a.begin_scope("only-a");
    assert_eq!(a.current_scope(), Some(LogValue::from("only-a")));
    assert_eq!(b.current_scope(), None);
    let a2 = Arc::clone(&a);
    let other_thread = std::thread::spawn(move || a2.current_scope()).join().unwrap();
    assert_eq!(other_thread, None);
}

#[test]
fn out_of_order_scope_release_is_reported() {
    let pipeline = pipeline();
    let errors = capture(pipeline.errors());
    let log = pipeline.logger("misuse");
    let outer = log.begin_scope("outer");
    let inner = log.begin_scope("inner");
    drop(outer);
    assert_eq!(log.current_scope(), Some(LogValue::from("inner")));
    drop(inner);
    assert_eq!(log.current_scope(), None);
    assert_eq!(*errors.lock().unwrap(), ["scope released out of order on logger `misuse`"]);
}

#[test]
fn switching_execution_mid_stream_keeps_every_record_in_order() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_execution_middleware("mem", catalog::THREAD_POOL).unwrap();
    let log = pipeline.logger("switch");

    for i in 0..5_000 {
        log.info("{N}", log_args![i]);
    }
    assert!(pipeline.set_execution_middleware("mem", catalog::SYNC).unwrap());
    for i in 5_000..7_500 {
        log.info("{N}", log_args![i]);
    }
    assert!(pipeline.set_execution_middleware("mem", catalog::DEDICATED_THREAD).unwrap());
    for i in 7_500..10_000 {
        log.info("{N}", log_args![i]);
    }
    pipeline.flush();

    let expected: Vec<String> = (0..10_000).map(|i| i.to_string()).collect();
    assert_eq!(sink.messages(), expected);
}

#[test]
fn switching_collect_mid_stream_delivers_pending_batches() {
    let config = PipelineConfig {
        runtime: log_pipeline::RuntimeConfig {
            timer_period_ms: 60_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let pipeline = Pipeline::new(config).unwrap();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_collect_middleware("mem", catalog::TIMER).unwrap();
    let log = pipeline.logger("collect");

    for i in 0..3 {
        log.info("{N}", log_args![i]);
    }
    assert!(sink.is_empty());
    pipeline.set_collect_middleware("mem", catalog::CONCURRENT).unwrap();
    assert_eq!(sink.messages(), ["0", "1", "2"]);
    assert_eq!(sink.batch_sizes(), [3]);

    log.info("{N}", log_args![3]);
    pipeline.flush();
    assert_eq!(sink.messages(), ["0", "1", "2", "3"]);
}

#[test]
fn timer_queue_delivers_on_its_own() {
    let config = PipelineConfig {
        runtime: log_pipeline::RuntimeConfig {
            timer_period_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    };
    let pipeline = Pipeline::new(config).unwrap();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_collect_middleware("mem", catalog::TIMER).unwrap();
    let log = pipeline.logger("tick");

    log.info("a", &[]);
    log.info("b", &[]);
    wait_for(|| sink.len() == 2);
    assert_eq!(sink.messages(), ["a", "b"]);
    assert_eq!(sink.batch_sizes(), [2]);
}

#[test]
fn failed_construction_keeps_the_old_middleware() {
    let pipeline = pipeline();
    let errors = capture(pipeline.errors());
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.register_execution("broken", |_| {
        Err(PipelineError::ConfigurationRejected("no threads left".into()))
    });

    let err = pipeline.set_execution_middleware("mem", "broken").unwrap_err();
    assert!(matches!(err, PipelineError::ConfigurationRejected(_)));
    assert_eq!(pipeline.middleware("mem", Stage::Execution), catalog::SYNC);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(errors.lock().unwrap()[0].starts_with("failed to build execution middleware `broken` for sink `mem`"));

    pipeline.logger("after").info("still delivered", &[]);
    assert_eq!(sink.messages(), ["still delivered"]);
}

#[test]
fn unknown_and_repeated_names() {
    let pipeline = pipeline();
    pipeline.add_sink(MemorySink::new("mem")).unwrap();
    let err = pipeline.set_collect_middleware("mem", "bogus").unwrap_err();
    assert!(matches!(err, PipelineError::UnknownMiddleware { stage: Stage::Collect, .. }));
    assert_eq!(pipeline.middleware("mem", Stage::Collect), catalog::PASS_THROUGH);

    assert!(!pipeline.set_collect_middleware("mem", catalog::PASS_THROUGH).unwrap());
    assert!(pipeline.set_collect_middleware("mem", catalog::CONCURRENT).unwrap());
    assert!(!pipeline.set_collect_middleware("mem", catalog::CONCURRENT).unwrap());
    assert!(!pipeline.set_level(Level::Info).unwrap());
}

#[test]
fn sink_failures_are_reported_and_do_not_stop_other_sinks() {
    let pipeline = pipeline();
    let errors = capture(pipeline.errors());
    let good = MemorySink::new("good");
    pipeline.add_sink(Failing).unwrap();
    pipeline.add_sink(Exploding).unwrap();
    pipeline.add_sink(good.clone()).unwrap();

    let log = pipeline.logger("errors");
    log.warn("one", &[]);
    log.warn("two", &[]);
    pipeline.flush();

    assert_eq!(good.messages(), ["one", "two"]);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.iter().filter(|e| e.as_str() == "sink `failing` failed to deliver: disk full").count(), 2);
    assert_eq!(errors.iter().filter(|e| e.contains("kaboom")).count(), 2);
}

#[test]
fn duplicate_sink_names_are_rejected() {
    let pipeline = pipeline();
    pipeline.add_sink(MemorySink::new("mem")).unwrap();
    let err = pipeline.add_sink(MemorySink::new("mem")).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateSink(name) if name == "mem"));
    assert_eq!(pipeline.sinks(), ["mem"]);
}

#[test]
fn dispose_is_idempotent_and_final() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.set_execution_middleware("mem", catalog::DEDICATED_THREAD).unwrap();
    pipeline.set_collect_middleware("mem", catalog::CONCURRENT).unwrap();
    let log = pipeline.logger("end");
    for i in 0..1_000 {
        log.info("{N}", log_args![i]);
    }

    pipeline.dispose();
    assert_eq!(sink.len(), 1_000);
    assert!(sink.is_disposed());

    pipeline.dispose();
    log.info("after dispose", &[]);
    assert_eq!(sink.len(), 1_000);
    assert!(matches!(pipeline.set_level(Level::Trace), Err(PipelineError::Disposed)));
    assert!(matches!(
        pipeline.set_execution_middleware("mem", catalog::SYNC),
        Err(PipelineError::Disposed)
    ));
    assert!(matches!(pipeline.add_sink(MemorySink::new("late")), Err(PipelineError::Disposed)));
}

#[test]
fn late_sinks_are_ignored_by_default() {
    let pipeline = pipeline();
    let first = MemorySink::new("first");
    let second = MemorySink::new("second");
    pipeline.add_sink(first.clone()).unwrap();
    let early = pipeline.logger("early");
    pipeline.add_sink(second.clone()).unwrap();
    let late = pipeline.logger("late");

    early.info("early", &[]);
    late.info("late", &[]);
    pipeline.flush();
    assert_eq!(first.messages(), ["early", "late"]);
    assert_eq!(second.messages(), ["late"]);
    assert_eq!(early.sink_names(), ["first"]);
}

#[test]
fn late_sinks_can_be_retrofitted() {
    let config = PipelineConfig {
        late_sinks: LateSinkPolicy::Retrofit,
        ..Default::default()
    };
    let pipeline = Pipeline::new(config).unwrap();
    let empty = pipeline.logger("early");
    empty.info("dropped, no sinks yet", &[]);

    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    empty.info("retrofitted", &[]);
    pipeline.flush();
    assert_eq!(sink.messages(), ["retrofitted"]);
    assert_eq!(empty.sink_names(), ["mem"]);
}

#[test]
fn format_overrides_and_json() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    assert!(pipeline.set_format_override(ValueKind::I64, |v| format!("#{v}")).unwrap());
    let log = pipeline.logger("orders");

    log.info("order {Id} total {Total:F2}", log_args![7, 12.5]);
    assert!(sink.lines()[0].ends_with("INFO  orders: order #7 total 12.50"), "{}", sink.lines()[0]);

    pipeline.set_format_middleware("mem", catalog::JSON).unwrap();
    log.info("order {Id}", log_args![8]);
    let json: serde_json::Value = serde_json::from_str(&sink.lines()[1]).unwrap();
    assert_eq!(json["message"], "order #8");
    assert_eq!(json["args"]["Id"], 8);
    assert_eq!(json["category"], "orders");

    assert!(pipeline.clear_format_override(ValueKind::I64).unwrap());
    log.info("order {Id}", log_args![9]);
    let json: serde_json::Value = serde_json::from_str(&sink.lines()[2]).unwrap();
    assert_eq!(json["message"], "order 9");
}

#[test]
fn per_sink_min_level() {
    let pipeline = pipeline();
    let all = MemorySink::new("all");
    let errors_only = MemorySink::new("errors-only");
    pipeline.add_sink(all.clone()).unwrap();
    pipeline.add_sink(errors_only.clone()).unwrap();
    pipeline.set_filter_middleware("errors-only", "min-level:error").unwrap();

    let log = pipeline.logger("mixed");
    log.info("info", &[]);
    log.error_with(std::io::Error::new(std::io::ErrorKind::Other, "boom"), "failed {Op}", log_args!["save"]);
    pipeline.flush();

    assert_eq!(all.messages(), ["info", "failed save"]);
    assert_eq!(errors_only.messages(), ["failed save"]);
    let record = &errors_only.records()[0];
    assert_eq!(record.error.as_ref().map(|e| e.to_string()).as_deref(), Some("boom"));
    assert!(errors_only.lines()[0].ends_with("failed save error=boom"));
}

#[test]
fn snapshot_round_trips_through_apply() {
    let pipeline = pipeline();
    pipeline.add_sink(MemorySink::new("mem")).unwrap();
    pipeline.set_level(Level::Debug).unwrap();
    pipeline.set_execution_middleware("mem", catalog::THREAD_POOL).unwrap();
    pipeline.set_format_middleware("mem", catalog::JSON).unwrap();

    let json = pipeline.snapshot().to_json().unwrap();
    let restored = Pipeline::new(PipelineConfig::from_json(&json).unwrap()).unwrap();
    assert_eq!(restored.level(), Level::Debug);
    assert_eq!(restored.middleware("mem", Stage::Execution), catalog::THREAD_POOL);
    assert_eq!(restored.middleware("mem", Stage::Format), catalog::JSON);
    assert_eq!(restored.middleware("mem", Stage::Collect), catalog::PASS_THROUGH);

    let sink = MemorySink::new("mem");
    restored.add_sink(sink.clone()).unwrap();
    restored.logger("restored").debug("hello", &[]);
    restored.flush();
    assert_eq!(sink.len(), 1);
}

#[test]
fn apply_checks_every_name_first() {
    let pipeline = pipeline();
    let mut config = PipelineConfig {
        level: Level::Error,
        ..Default::default()
    };
    config.sinks.entry("a".into()).or_default().set(Stage::Execution, catalog::THREAD_POOL);
    config.sinks.entry("b".into()).or_default().set(Stage::Filter, "nonsense");

    assert!(pipeline.apply(&config).is_err());
    assert_eq!(pipeline.level(), Level::Info);
    assert_eq!(pipeline.middleware("a", Stage::Execution), catalog::SYNC);
}

#[test]
fn apply_rolls_back_when_a_later_stage_fails_to_build() {
    let pipeline = pipeline();
    let errors = capture(pipeline.errors());
    let a = MemorySink::new("a");
    pipeline.add_sink(a.clone()).unwrap();
    pipeline.add_sink(MemorySink::new("b")).unwrap();
    pipeline.register_execution("broken", |_| {
        Err(PipelineError::ConfigurationRejected("no threads left".into()))
    });
    let before = pipeline.snapshot();

    let mut config = PipelineConfig {
        level: Level::Error,
        ..Default::default()
    };
    let stages = config.sinks.entry("a".into()).or_default();
    stages.set(Stage::Collect, catalog::CONCURRENT);
    stages.set(Stage::Format, catalog::JSON);
    config.sinks.entry("b".into()).or_default().set(Stage::Execution, "broken");

    let err = pipeline.apply(&config).unwrap_err();
    assert!(matches!(err, PipelineError::ConfigurationRejected(_)));
    assert_eq!(pipeline.level(), Level::Info);
    assert_eq!(pipeline.middleware("a", Stage::Collect), catalog::PASS_THROUGH);
    assert_eq!(pipeline.middleware("a", Stage::Format), catalog::TEXT);
    assert_eq!(pipeline.middleware("b", Stage::Execution), catalog::SYNC);
    assert_eq!(pipeline.snapshot(), before);
    assert_eq!(errors.lock().unwrap().len(), 1);

    pipeline.logger("after").info("plain {N}", log_args![1]);
    assert_eq!(a.messages(), ["plain 1"]);
    assert!(a.lines()[0].ends_with("INFO  after: plain 1"));
}

#[test]
fn flush_reaches_the_sink() {
    let pipeline = pipeline();
    let sink = MemorySink::new("mem");
    pipeline.add_sink(sink.clone()).unwrap();
    pipeline.flush();
    pipeline.logger("f").flush();
    assert_eq!(sink.flush_count(), 2);
}

/// Reads the live configuration from inside `log`.
struct Inspecting {
    registry: Arc<PipelineRegistry>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Sink for Inspecting {
    fn name(&self) -> &str {
        "inspecting"
    }

    fn log(&self, batch: &LogBatch<'_>) -> Result<(), SinkError> {
        let collect = self.registry.middleware("inspecting", Stage::Collect);
        let snapshot = self.registry.snapshot();
        assert_eq!(snapshot.sinks["inspecting"].collect.as_deref(), Some(collect.as_str()));
        let mut seen = self.seen.lock().unwrap();
        seen.extend(batch.records().iter().map(|_| collect.clone()));
        Ok(())
    }
}

#[test]
fn sinks_can_read_the_configuration_while_a_stage_drains() {
    let pipeline = Arc::new(pipeline());
    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .add_sink(Inspecting {
            registry: Arc::clone(pipeline.registry()),
            seen: Arc::clone(&seen),
        })
        .unwrap();
    pipeline.set_collect_middleware("inspecting", catalog::TIMER).unwrap();
    let log = pipeline.logger("drain");
    for i in 0..3 {
        log.info("{I}", log_args![i]);
    }

    // Switching drains the pending timer batch into the sink.
    let (done_tx, done_rx) = mpsc::channel();
    let switching = Arc::clone(&pipeline);
    thread::spawn(move || {
        let outcome = switching.set_collect_middleware("inspecting", catalog::CONCURRENT);
        let _ = done_tx.send(outcome.is_ok());
    });
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    assert_eq!(*seen.lock().unwrap(), [catalog::CONCURRENT; 3]);
}

/// Blocks in its first `log` until released, then looks up a new logger.
struct Reentrant {
    pipeline: Arc<OnceCell<Weak<Pipeline>>>,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Sink for Reentrant {
    fn name(&self) -> &str {
        "reentrant"
    }

    fn log(&self, _batch: &LogBatch<'_>) -> Result<(), SinkError> {
        let entered = self.entered.lock().unwrap().take();
        if let Some(entered) = entered {
            let _ = entered.send(());
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            if let Some(pipeline) = self.pipeline.get().and_then(Weak::upgrade) {
                pipeline.logger("looked-up-from-a-sink");
            }
        }
        Ok(())
    }
}

#[test]
fn retrofitting_does_not_block_sinks_that_look_up_loggers() {
    let pipeline = Arc::new(
        Pipeline::new(PipelineConfig {
            late_sinks: LateSinkPolicy::Retrofit,
            ..Default::default()
        })
        .unwrap(),
    );
    let handle = Arc::new(OnceCell::new());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    pipeline
        .add_sink(Reentrant {
            pipeline: Arc::clone(&handle),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        })
        .unwrap();
    let _ = handle.set(Arc::downgrade(&pipeline));
    let log = pipeline.logger("hot");

    let (done_tx, done_rx) = mpsc::channel();
    let logging = {
        let log = Arc::clone(&log);
        let done = done_tx.clone();
        thread::spawn(move || {
            log.info("first", log_args![]);
            let _ = done.send("logged");
        })
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let adding = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || {
            pipeline.add_sink(MemorySink::new("late")).unwrap();
            let _ = done_tx.send("added");
        })
    };
    thread::sleep(Duration::from_millis(100));
    release_tx.send(()).unwrap();

    let mut finished = vec![
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    finished.sort();
    assert_eq!(finished, ["added", "logged"]);
    logging.join().unwrap();
    adding.join().unwrap();
    assert_eq!(log.sink_names(), ["reentrant", "late"]);
}
