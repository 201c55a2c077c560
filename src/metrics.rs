//! Prometheus metrics for the status agent.
//!
//! All metrics use the default Prometheus registry:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ==================== LATENCY METRICS ====================
    pub static ref SINK_WRITE_DURATION: HistogramVec = register_histogram_vec!(
        "status_agent_sink_write_duration_seconds",
        "Time spent writing one point to the sink",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref FILES_READ_TOTAL: IntCounter = register_int_counter!(
        "status_agent_files_read_total",
        "Status files read to completion"
    )
    .unwrap();
    pub static ref BLOCKS_READ_TOTAL: IntCounter = register_int_counter!(
        "status_agent_blocks_read_total",
        "Blocks emitted by the reader"
    )
    .unwrap();
    pub static ref BLOCKS_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "status_agent_blocks_skipped_total",
        "Blocks that produced no point, by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref POINTS_EMITTED_TOTAL: IntCounter = register_int_counter!(
        "status_agent_points_emitted_total",
        "Points handed to the uploader pool"
    )
    .unwrap();
    pub static ref POINT_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "status_agent_point_writes_total",
        "Sink writes by outcome",
        &["status"]
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================
    pub static ref PIPELINE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "status_agent_pipeline_errors_total",
        "Errors reported to the aggregator by kind",
        &["kind"]
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref CURRENT_EPOCH: IntGauge = register_int_gauge!(
        "status_agent_current_epoch",
        "Created time of the status file currently being read"
    )
    .unwrap();
    pub static ref LAST_EPOCH: IntGauge = register_int_gauge!(
        "status_agent_last_epoch",
        "Created time of the previously read status file"
    )
    .unwrap();
}

/// Serves the default registry at `GET /metrics` until `cancel` fires.
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::Encoder;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;

    info!(%addr, "prometheus metrics server listening");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("metrics server shutting down");
                return Ok(());
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        if req.uri().path() != "/metrics" {
                            return Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Full::new(Bytes::from("Not Found")));
                        }

                        let encoder = prometheus::TextEncoder::new();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
                            return Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Full::new(Bytes::from(err.to_string())));
                        }

                        Response::builder()
                            .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                            .body(Full::new(Bytes::from(buffer)))
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}
