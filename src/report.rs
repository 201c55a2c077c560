//! Error aggregation: every stage reports non-fatal problems here.

use crate::error::PipelineError;
use crate::metrics;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cloneable handle stages use to report errors to the aggregator.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<PipelineError>,
}

pub fn error_channel(capacity: usize) -> (ErrorReporter, mpsc::Receiver<PipelineError>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorReporter { tx }, rx)
}

impl ErrorReporter {
    pub async fn report(&self, err: PipelineError) {
        metrics::PIPELINE_ERRORS_TOTAL
            .with_label_values(&[err.kind()])
            .inc();
        if let Err(mpsc::error::SendError(err)) = self.tx.send(err).await {
            warn!(error = %err, "error channel closed; logging report directly");
        }
    }
}

/// Drains the error channel until every reporter is dropped.
///
/// Returns how many reports were seen.
pub async fn aggregate_errors(mut rx: mpsc::Receiver<PipelineError>) -> u64 {
    let mut seen: u64 = 0;
    while let Some(err) = rx.recv().await {
        seen += 1;
        match err {
            PipelineError::NonNumeric(_) => debug!(kind = err.kind(), "{err}"),
            _ => warn!(kind = err.kind(), "{err}"),
        }
    }
    info!(reports = seen, "error aggregator finished");
    seen
}
