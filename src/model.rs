//! Records passed between pipeline stages.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Reference clocks anchoring deduplication across replacements of the
/// status file. Owned by the reader; every block carries a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    pub last_epoch: i64,
    pub current_epoch: i64,
}

impl RunState {
    /// Rolls the clocks forward after a metadata block reported `created`.
    pub fn advance(&mut self, created: i64) {
        self.last_epoch = self.current_epoch;
        self.current_epoch = created;
    }
}

/// One brace-delimited section of one read of the status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: String,
    /// Raw lines between the opening and closing boundary, indentation kept.
    pub lines: Vec<String>,
    pub current_epoch: i64,
    pub last_epoch: i64,
}

impl Block {
    pub fn new(kind: impl Into<String>, lines: Vec<String>, state: RunState) -> Self {
        Self {
            kind: kind.into(),
            lines,
            current_epoch: state.current_epoch,
            last_epoch: state.last_epoch,
        }
    }
}

/// Closed set of block kinds the parser knows how to name and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    HostStatus,
    ServiceStatus,
    Info,
    ProgramStatus,
    ContactStatus,
    HostComment,
    ServiceComment,
    HostDowntime,
    Unrecognized,
}

impl BlockKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "hoststatus" => BlockKind::HostStatus,
            "servicestatus" => BlockKind::ServiceStatus,
            "info" => BlockKind::Info,
            "programstatus" => BlockKind::ProgramStatus,
            "contactstatus" => BlockKind::ContactStatus,
            "hostcomment" => BlockKind::HostComment,
            "servicecomment" => BlockKind::ServiceComment,
            "hostdowntime" => BlockKind::HostDowntime,
            _ => BlockKind::Unrecognized,
        }
    }

    /// Key holding the block's authoritative timestamp.
    ///
    /// `None` for kinds that are never emitted or cannot be named.
    pub fn timestamp_key(self) -> Option<&'static str> {
        match self {
            BlockKind::HostStatus | BlockKind::ServiceStatus => Some("last_check"),
            BlockKind::Info => Some("created"),
            BlockKind::HostComment | BlockKind::ServiceComment | BlockKind::HostDowntime => {
                Some("entry_time")
            }
            // TODO: pick a timestamp field for programstatus and contactstatus so they can be emitted.
            BlockKind::ProgramStatus | BlockKind::ContactStatus => None,
            BlockKind::Unrecognized => None,
        }
    }
}

/// A normalized field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(value) => write!(f, "{value}"),
            FieldValue::Text(value) => f.write_str(value),
        }
    }
}

/// One timestamped record ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub identity: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: i64,
}
