//! Pipeline supervisor.
//!
//! Wires the stages together and shuts them down in dependency order:
//! 1. stop feeding files (watcher cancelled, or the one-shot file sent)
//! 2. reader exits and drops the block sender
//! 3. parser workers exit and drop the point senders
//! 4. uploader workers exit
//! 5. the last error reporter is dropped and the aggregator exits
//!
//! Every channel is closed by its senders going away, so no stage can send on
//! a channel that has already been closed.

use crate::config::Config;
use crate::model::{Point, RunState};
use crate::parsers::run_parser;
use crate::reader::{Reader, StatusFile};
use crate::report::{aggregate_errors, error_channel, ErrorReporter};
use crate::sink::PointSink;
use crate::uploader::{run_uploader, UploadStats};
use crate::watcher::{watch_recreation, WatchTarget};
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Receiver shared by every worker of a pool.
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub fn share<T>(rx: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(rx))
}

/// Takes the next message for whichever worker holds the lock first.
pub async fn recv_shared<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

/// What a completed run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub state: RunState,
    pub points: u64,
    pub errors: u64,
}

/// Runs the pipeline until `cancel` fires, or until the single file has been
/// drained when `config.input.oneshot` is set.
///
/// Fatal errors from the watcher or reader still go through the full
/// shutdown before being returned.
pub async fn run(
    config: &Config,
    sink: Arc<dyn PointSink>,
    cancel: CancellationToken,
) -> Result<PipelineSummary> {
    let input = config
        .input_path()
        .ok_or_else(|| anyhow!("an input status file must be configured"))?;
    let sizes = &config.pipeline;

    let (errors, error_rx) = error_channel(sizes.error_channel_capacity);
    let aggregator = tokio::spawn(aggregate_errors(error_rx));

    let (file_tx, file_rx) = mpsc::channel(sizes.file_channel_capacity);
    let (block_tx, block_rx) = mpsc::channel(sizes.block_channel_capacity);
    let (point_tx, point_rx) = mpsc::channel::<Point>(sizes.point_channel_capacity);
    let (drained_tx, _) = broadcast::channel(sizes.eof_channel_capacity);

    let point_rx = share(point_rx);
    let uploaders: Vec<JoinHandle<UploadStats>> = (0..sizes.uploaders)
        .map(|worker| {
            tokio::spawn(run_uploader(
                worker,
                point_rx.clone(),
                sink.clone(),
                config.sink.dump_json,
                drained_tx.subscribe(),
                errors.clone(),
            ))
        })
        .collect();

    let block_rx = share(block_rx);
    let parsers: Vec<JoinHandle<()>> = (0..sizes.parsers)
        .map(|worker| {
            tokio::spawn(run_parser(
                worker,
                block_rx.clone(),
                point_tx.clone(),
                errors.clone(),
            ))
        })
        .collect();
    drop(point_tx);

    let mut reader = tokio::spawn(Reader::new(block_tx, drained_tx, errors.clone()).run(file_rx));
    info!(
        input = %input.display(),
        parsers = sizes.parsers,
        uploaders = sizes.uploaders,
        oneshot = config.input.oneshot,
        "pipeline started"
    );

    let mut reader_done = None;
    let feed_result = if config.input.oneshot {
        feed_once(&input, file_tx).await
    } else {
        match WatchTarget::resolve(&input) {
            Ok(target) => {
                if config.input.load_on_start {
                    load_on_start(&target.file, &file_tx, &errors).await;
                }

                let stop_watching = cancel.child_token();
                let mut watcher = tokio::spawn(watch_recreation(
                    target,
                    config.watcher.clone(),
                    file_tx,
                    errors.clone(),
                    stop_watching.clone(),
                ));

                let mut watcher_done = None;
                tokio::select! {
                    _ = cancel.cancelled() => info!("shutdown requested"),
                    joined = &mut watcher => watcher_done = Some(joined),
                    joined = &mut reader => reader_done = Some(joined),
                }

                stop_watching.cancel();
                let joined = match watcher_done {
                    Some(joined) => joined,
                    None => watcher.await,
                };
                info!("watcher stopped");
                flatten("watcher", joined)
            }
            Err(err) => {
                drop(file_tx);
                Err(err.into())
            }
        }
    };

    let joined = match reader_done {
        Some(joined) => joined,
        None => reader.await,
    };
    let reader_result = flatten("reader", joined);
    info!("reader stopped");

    for parser in parsers {
        if let Err(err) = parser.await {
            error!(error = %err, "parser task failed");
        }
    }
    info!("parsers stopped");

    let mut points = 0;
    for uploader in uploaders {
        match uploader.await {
            Ok(stats) => points += stats.total,
            Err(err) => error!(error = %err, "uploader task failed"),
        }
    }
    info!(points, "uploaders stopped");

    drop(errors);
    let errors = aggregator.await.unwrap_or_else(|err| {
        error!(error = %err, "error aggregator task failed");
        0
    });

    // A reader failure is the root cause when both fail: the watcher only
    // notices that the file channel went away.
    let state = match (reader_result, feed_result) {
        (Err(err), _) | (Ok(_), Err(err)) => {
            error!(error = %err, "pipeline stopped on a fatal error");
            return Err(err);
        }
        (Ok(state), Ok(())) => state,
    };

    info!(
        last_epoch = state.last_epoch,
        current_epoch = state.current_epoch,
        points,
        errors,
        "pipeline stopped"
    );
    Ok(PipelineSummary {
        state,
        points,
        errors,
    })
}

async fn feed_once(input: &Path, files: mpsc::Sender<StatusFile>) -> Result<()> {
    let file = StatusFile::open(input).await?;
    files
        .send(file)
        .await
        .map_err(|_| anyhow!("reader stopped before the status file was sent"))
}

async fn load_on_start(path: &Path, files: &mpsc::Sender<StatusFile>, errors: &ErrorReporter) {
    match StatusFile::open(path).await {
        Ok(file) => {
            if files.send(file).await.is_err() {
                warn!(path = %path.display(), "reader stopped before the initial load");
            }
        }
        Err(err) => errors.report(err).await,
    }
}

fn flatten<T>(stage: &str, joined: Result<Result<T>, JoinError>) -> Result<T> {
    joined
        .with_context(|| format!("{stage} task failed"))
        .and_then(|result| result)
}
