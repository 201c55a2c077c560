//! Block parsing: turns one status block into at most one [`Point`].
//!
//! Parsing is pure. Problems that only degrade a block (non-numeric values,
//! malformed performance tokens) are pushed to an `issues` list, while
//! problems that make the block unusable are returned as the error.

pub mod perfdata;
pub mod values;

use crate::error::PipelineError;
use crate::metrics;
use crate::model::{Block, BlockKind, Point};
use crate::pipeline::{recv_shared, SharedReceiver};
use crate::report::ErrorReporter;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub use perfdata::{parse_perf_data, PERF_DATA_PREFIX};
pub use values::{normalize, parse_data_value};

/// Key whose value embeds performance data.
pub const PERF_DATA_KEY: &str = "performance_data";
/// Key naming the host a block belongs to.
pub const HOST_NAME_KEY: &str = "host_name";
/// Key naming the check a service block belongs to.
pub const CHECK_COMMAND_KEY: &str = "check_command";
/// Key carrying the creation time of the status file in the metadata block.
pub const CREATED_KEY: &str = "created";
/// Identity of points produced from the metadata block.
pub const METADATA_IDENTITY: &str = "info";

/// Result of parsing a block that had no defect.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Point(Point),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Timestamp not newer than the previous file's creation time.
    Stale { timestamp: i64, last_epoch: i64 },
    /// Kind has no timestamp policy yet.
    Undecided,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Stale { .. } => "stale",
            SkipReason::Undecided => "undecided",
        }
    }
}

/// Parses one block, deduplicating it against the block's `last_epoch`.
pub fn parse_block(
    block: &Block,
    issues: &mut Vec<PipelineError>,
) -> Result<BlockOutcome, PipelineError> {
    let kind = BlockKind::from_name(&block.kind);
    if kind == BlockKind::Unrecognized {
        return Err(PipelineError::EmptyIdentity {
            kind: block.kind.clone(),
        });
    }
    let Some(timestamp_key) = kind.timestamp_key() else {
        return Ok(BlockOutcome::Skipped(SkipReason::Undecided));
    };

    let pairs = key_values(block, issues);

    let raw_timestamp = pairs
        .iter()
        .find(|(key, _)| *key == timestamp_key)
        .map(|(_, value)| *value)
        .ok_or_else(|| PipelineError::MissingTimestamp {
            kind: block.kind.clone(),
            key: timestamp_key,
        })?;
    let timestamp =
        raw_timestamp
            .trim()
            .parse::<i64>()
            .map_err(|_| PipelineError::BadTimestamp {
                kind: block.kind.clone(),
                key: timestamp_key,
                value: raw_timestamp.to_string(),
            })?;
    if timestamp <= block.last_epoch {
        return Ok(BlockOutcome::Skipped(SkipReason::Stale {
            timestamp,
            last_epoch: block.last_epoch,
        }));
    }

    let mut primary = if kind == BlockKind::Info {
        METADATA_IDENTITY
    } else {
        ""
    };
    let mut secondary = "";
    let mut fields = BTreeMap::new();

    for (key, value) in pairs {
        if key == timestamp_key {
            continue;
        }
        if key == PERF_DATA_KEY {
            if !value.is_empty() {
                parse_perf_data(value, &mut fields, issues);
            }
            continue;
        }

        match kind {
            BlockKind::HostStatus => {
                if key == HOST_NAME_KEY {
                    primary = value;
                }
            }
            BlockKind::ServiceStatus => {
                if key == HOST_NAME_KEY {
                    primary = value;
                } else if key == CHECK_COMMAND_KEY {
                    secondary = value;
                }
            }
            BlockKind::HostComment | BlockKind::ServiceComment | BlockKind::HostDowntime => {
                if key == HOST_NAME_KEY {
                    primary = value;
                    secondary = &block.kind;
                }
            }
            BlockKind::Info
            | BlockKind::ProgramStatus
            | BlockKind::ContactStatus
            | BlockKind::Unrecognized => {}
        }

        if !value.is_empty() {
            fields.insert(key.to_string(), normalize(value, issues));
        }
    }

    // A secondary label alone does not name a point.
    if primary.is_empty() {
        return Err(PipelineError::EmptyIdentity {
            kind: block.kind.clone(),
        });
    }
    let identity = assemble_identity(primary, secondary);

    Ok(BlockOutcome::Point(Point {
        identity,
        fields,
        timestamp,
    }))
}

/// Joins identity labels with `.`, dropping an empty secondary label.
pub fn assemble_identity(primary: &str, secondary: &str) -> String {
    if secondary.is_empty() {
        primary.to_string()
    } else {
        format!("{primary}.{secondary}")
    }
}

/// Reads the `created` value from the metadata block's lines.
pub fn metadata_created(lines: &[String]) -> Result<i64, PipelineError> {
    let raw = lines
        .iter()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim_start() == CREATED_KEY)
        .map(|(_, value)| value)
        .ok_or_else(|| PipelineError::MetadataTimestamp(format!("no {CREATED_KEY} field")))?;

    raw.trim()
        .parse::<i64>()
        .map_err(|err| PipelineError::MetadataTimestamp(format!("{raw:?}: {err}")))
}

/// Splits block lines into `(key, value)` pairs, keys stripped of indentation.
fn key_values<'a>(block: &'a Block, issues: &mut Vec<PipelineError>) -> Vec<(&'a str, &'a str)> {
    let mut pairs = Vec::with_capacity(block.lines.len());
    for line in &block.lines {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => pairs.push((key.trim_start(), value)),
            None => issues.push(PipelineError::MalformedLine {
                kind: block.kind.clone(),
                line: line.clone(),
            }),
        }
    }
    pairs
}

/// Parser pool worker: consumes blocks until the block channel closes.
pub async fn run_parser(
    worker: usize,
    blocks: SharedReceiver<Block>,
    points: mpsc::Sender<Point>,
    errors: ErrorReporter,
) {
    let mut issues = Vec::new();
    let mut emitted: u64 = 0;

    while let Some(block) = recv_shared(&blocks).await {
        let outcome = parse_block(&block, &mut issues);
        for issue in issues.drain(..) {
            errors.report(issue).await;
        }

        match outcome {
            Ok(BlockOutcome::Point(point)) => {
                trace!(worker, identity = %point.identity, "parsed point");
                if points.send(point).await.is_err() {
                    debug!(worker, "point channel closed; parser stopping");
                    break;
                }
                metrics::POINTS_EMITTED_TOTAL.inc();
                emitted += 1;
            }
            Ok(BlockOutcome::Skipped(reason)) => {
                metrics::BLOCKS_SKIPPED_TOTAL
                    .with_label_values(&[reason.label()])
                    .inc();
                trace!(worker, kind = %block.kind, ?reason, "skipped block");
            }
            Err(err) => errors.report(err).await,
        }
    }

    debug!(worker, emitted, "parser worker finished");
}
