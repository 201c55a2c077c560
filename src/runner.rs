//! Application runner: builds the collaborators the pipeline needs and runs it.

use crate::config::{Config, SinkConfig};
use crate::metrics;
use crate::pipeline::{self, PipelineSummary};
use crate::sink::{InfluxWriter, NoopSink, PointSink};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Build the sink selected by configuration.
///
/// Returns a [`NoopSink`] when writes are disabled, otherwise an [`InfluxWriter`].
pub fn build_point_sink(config: &SinkConfig) -> Result<Arc<dyn PointSink>> {
    if config.noop {
        info!("sink writes disabled; points are only printed");
        return Ok(Arc::new(NoopSink));
    }

    let writer = InfluxWriter::new(config).context("failed to configure InfluxDB sink")?;
    Ok(Arc::new(writer))
}

/// Runs the agent until `cancel` fires or, in one-shot mode, the file is drained.
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<PipelineSummary> {
    info!("status-agent starting");

    let metrics_server = config.metrics.listen.map(|addr| {
        let cancel = cancel.child_token();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(err) = metrics::serve(addr, cancel).await {
                    error!(error = %err, "metrics server exited unexpectedly");
                }
            }
        });
        (cancel, handle)
    });

    let sink = build_point_sink(&config.sink)?;
    let result = pipeline::run(config, sink, cancel).await;

    if let Some((stop, handle)) = metrics_server {
        stop.cancel();
        let _ = handle.await;
    }

    result
}
