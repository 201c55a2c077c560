use crate::error::PipelineError;
use crate::metrics;
use crate::model::Point;
use crate::pipeline::{recv_shared, SharedReceiver};
use crate::reader::FileDrained;
use crate::report::ErrorReporter;
use crate::sink::PointSink;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, trace, warn};

/// Counters one uploader worker kept over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub total: u64,
    /// Points handled after the last end-of-file signal.
    pub since_drained: u64,
    pub files: u64,
}

/// Uploader worker: drains points into the sink until the point channel closes.
///
/// Each worker keeps its own count of points handled since the last
/// end-of-file signal; the count is logged and reset on every signal.
pub async fn run_uploader(
    worker: usize,
    points: SharedReceiver<Point>,
    sink: Arc<dyn PointSink>,
    dump_json: bool,
    mut drained: broadcast::Receiver<FileDrained>,
    errors: ErrorReporter,
) -> UploadStats {
    let mut stats = UploadStats::default();
    let mut listening = true;

    loop {
        tokio::select! {
            signal = drained.recv(), if listening => match signal {
                Ok(FileDrained { sequence, blocks }) => {
                    info!(worker, sequence, blocks, points = stats.since_drained, "uploaded points for status file");
                    stats.since_drained = 0;
                    stats.files += 1;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(worker, missed, "uploader missed end of file signals");
                }
                Err(RecvError::Closed) => listening = false,
            },
            point = recv_shared(&points) => match point {
                Some(point) => {
                    upload(worker, &point, sink.as_ref(), dump_json, &errors).await;
                    stats.since_drained += 1;
                    stats.total += 1;
                }
                None => break,
            },
        }
    }

    debug!(
        worker,
        total = stats.total,
        pending = stats.since_drained,
        "uploader worker finished"
    );
    stats
}

async fn upload(
    worker: usize,
    point: &Point,
    sink: &dyn PointSink,
    dump_json: bool,
    errors: &ErrorReporter,
) {
    if dump_json {
        match serde_json::to_string_pretty(point) {
            Ok(json) => println!("{json}"),
            Err(err) => warn!(worker, identity = %point.identity, error = %err, "failed to encode point as JSON"),
        }
    }

    let started = Instant::now();
    let result = sink.write_point(point).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::SINK_WRITE_DURATION
        .with_label_values(&[status])
        .observe(started.elapsed().as_secs_f64());
    metrics::POINT_WRITES_TOTAL
        .with_label_values(&[status])
        .inc();

    match result {
        Ok(()) => trace!(worker, identity = %point.identity, "point written"),
        Err(err) => {
            errors
                .report(PipelineError::SinkWrite {
                    identity: point.identity.clone(),
                    message: format!("{err:#}"),
                })
                .await
        }
    }
}
