use crate::error::PipelineError;
use crate::layer::PipelineLayer;
use crate::pipeline::Pipeline;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Configuration of the global `tracing` bridge.
///
/// **Fields**
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   installed next to [`PipelineLayer`] and every event is also printed
///   to the console.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub enable_stdout: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { enable_stdout: false }
    }
}

/// Install a global `tracing` subscriber that forwards every event into
/// `pipeline`.
///
/// **Parameters**
/// - `pipeline`: the pipeline receiving events; the event target is used
///   as the logger category.
/// - `config`: [`BridgeConfig`].
///
/// **Returns**
/// - `Err(PipelineError::Subscriber)` if a global subscriber is already set.
pub fn init_tracing_with_config(pipeline: Arc<Pipeline>, config: BridgeConfig) -> Result<(), PipelineError> {
    let layer = PipelineLayer::new(pipeline);

    // The two subscriber shapes have different types, hence the branches.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Equivalent to [`init_tracing_with_config`] with [`BridgeConfig::default`].
pub fn init_tracing(pipeline: Arc<Pipeline>) -> Result<(), PipelineError> {
    init_tracing_with_config(pipeline, BridgeConfig::default())
}
