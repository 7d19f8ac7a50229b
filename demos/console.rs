use std::error::Error;
use std::sync::Arc;

use log_pipeline::catalog;
use log_pipeline::console_sink::ConsoleSink;
use log_pipeline::init::init_tracing;
use log_pipeline::log_args;
use log_pipeline::{Level, LogValue, Pipeline, PipelineConfig, Stage, ValueKind};

/// Walks through live reconfiguration against a console sink.
fn main() -> Result<(), Box<dyn Error>> {
    let pipeline = Arc::new(Pipeline::new(PipelineConfig::from_env())?);
    pipeline.add_sink(ConsoleSink::stdout("console").split_at(Level::Error))?;
    pipeline.errors().on_error(|err| eprintln!("[pipeline] {err}"));

    let log = pipeline.logger("demo");
    let execution = pipeline.middleware("console", Stage::Execution);
    log.info("starting with {Execution} execution", log_args![execution]);

    {
        let _request = log.begin_scope("request-42");
        log.info("user {Name} paid {Amount:F2}", log_args!["ann", 19.5]);
        log.debug("hidden at the default level", log_args![]);
    }

    pipeline.set_level(Level::Debug)?;
    log.debug("now visible without re-acquiring the logger", log_args![]);

    pipeline.set_execution_middleware("console", catalog::THREAD_POOL)?;
    pipeline.set_format_middleware("console", catalog::JSON)?;
    log.warn("switched to {Execution} and {Format}", log_args![catalog::THREAD_POOL, catalog::JSON]);

    pipeline.set_format_middleware("console", catalog::TEXT)?;
    pipeline.set_format_override(ValueKind::Bool, |value| match value {
        LogValue::Bool(true) => "yes".to_string(),
        _ => "no".to_string(),
    })?;
    log.info("cache warm: {Warm}", log_args![true]);

    if let Err(err) = "forty-two".parse::<u32>() {
        log.error_with(err, "could not parse {Input}", log_args!["forty-two"]);
    }

    init_tracing(Arc::clone(&pipeline))?;
    tracing::info!(target: "demo::tracing", port = 8080u64, "listening");

    pipeline.flush();
    pipeline.dispose();
    Ok(())
}
