//! Streams status files and splits them into blocks.
//!
//! The first block of every file is the metadata block; its `created` value
//! advances the [`RunState`] stamped onto every block that follows.

use crate::error::PipelineError;
use crate::metrics;
use crate::model::{Block, BlockKind, RunState};
use crate::parsers::metadata_created;
use crate::report::ErrorReporter;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const BLOCK_OPEN_SUFFIX: &str = " {";
const COMMENT_PREFIX: char = '#';
const BLOCK_LINE_CAPACITY: usize = 64;
const LINE_BUFFER_CAPACITY: usize = 256;

/// An opened status file waiting to be read.
#[derive(Debug)]
pub struct StatusFile {
    pub path: PathBuf,
    pub file: File,
}

impl StatusFile {
    pub async fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)
            .await
            .map_err(|source| PipelineError::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

/// Broadcast after a file has been fully read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDrained {
    pub sequence: u64,
    pub blocks: u64,
}

/// What the scanner observed after consuming a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Closed { kind: String, lines: Vec<String> },
    Unterminated { kind: String, lines: usize },
}

/// Block boundary state machine: outside a block, or inside block `kind`.
#[derive(Debug, Default)]
pub struct BlockScanner {
    current: Option<(String, Vec<String>)>,
}

impl BlockScanner {
    pub fn push_line(&mut self, line: String) -> Option<ScanEvent> {
        if line.starts_with(COMMENT_PREFIX) {
            return None;
        }

        if let Some(kind) = line.strip_suffix(BLOCK_OPEN_SUFFIX) {
            let previous = self
                .current
                .replace((kind.to_string(), Vec::with_capacity(BLOCK_LINE_CAPACITY)));
            return previous.map(|(kind, lines)| ScanEvent::Unterminated {
                kind,
                lines: lines.len(),
            });
        }

        if is_block_close(&line) {
            return self
                .current
                .take()
                .map(|(kind, lines)| ScanEvent::Closed { kind, lines });
        }

        if let Some((_, lines)) = self.current.as_mut() {
            lines.push(line);
        }
        None
    }

    /// Reports a block left open at end of input.
    pub fn finish(&mut self) -> Option<ScanEvent> {
        self.current
            .take()
            .map(|(kind, lines)| ScanEvent::Unterminated {
                kind,
                lines: lines.len(),
            })
    }
}

/// Strips the line terminator; invalid UTF-8 is replaced rather than rejected.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// A closing line is one indentation character followed by `}`.
fn is_block_close(line: &str) -> bool {
    matches!(line.as_bytes(), [b'\t' | b' ', b'}'])
}

/// Single reader task. Owns the run state for the life of the process.
pub struct Reader {
    state: RunState,
    sequence: u64,
    blocks: mpsc::Sender<Block>,
    drained: broadcast::Sender<FileDrained>,
    errors: ErrorReporter,
}

impl Reader {
    pub fn new(
        blocks: mpsc::Sender<Block>,
        drained: broadcast::Sender<FileDrained>,
        errors: ErrorReporter,
    ) -> Self {
        Self {
            state: RunState::default(),
            sequence: 0,
            blocks,
            drained,
            errors,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Reads files one at a time until the file channel closes.
    ///
    /// Returns the final run state, or the fatal error that stopped reading.
    pub async fn run(mut self, mut files: mpsc::Receiver<StatusFile>) -> Result<RunState> {
        while let Some(StatusFile { path, file }) = files.recv().await {
            self.sequence += 1;
            info!(path = %path.display(), sequence = self.sequence, "reading status file");

            let mut source = BufReader::new(file);
            let blocks = self.read_blocks(&path, &mut source).await?;
            info!(path = %path.display(), blocks, "finished reading status file");
            metrics::FILES_READ_TOTAL.inc();

            let signal = FileDrained {
                sequence: self.sequence,
                blocks,
            };
            if self.drained.send(signal).is_err() {
                debug!(sequence = self.sequence, "no uploader listening for end of file");
            }
            drop(source);
        }

        debug!(state = ?self.state, "file channel closed; reader stopping");
        Ok(self.state)
    }

    /// Streams one file's lines and forwards completed blocks.
    pub async fn read_blocks<R>(&mut self, path: &Path, mut source: R) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::with_capacity(LINE_BUFFER_CAPACITY);
        let mut scanner = BlockScanner::default();
        let mut emitted: u64 = 0;
        let mut awaiting_metadata = true;

        loop {
            buf.clear();
            match source.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    self.errors
                        .report(PipelineError::FileRead {
                            path: path.to_path_buf(),
                            source: err,
                        })
                        .await;
                    break;
                }
            }
            let line = decode_line(&buf);

            match scanner.push_line(line) {
                None => {}
                Some(ScanEvent::Unterminated { kind, lines }) => {
                    self.errors
                        .report(PipelineError::UnterminatedBlock { kind, lines })
                        .await;
                }
                Some(ScanEvent::Closed { kind, lines }) => {
                    if awaiting_metadata {
                        awaiting_metadata = false;
                        self.apply_metadata(&kind, &lines)?;
                    }

                    self.blocks
                        .send(Block::new(kind, lines, self.state))
                        .await
                        .map_err(|_| anyhow!("block channel closed while reader was running"))?;
                    metrics::BLOCKS_READ_TOTAL.inc();
                    emitted += 1;
                }
            }
        }

        if let Some(ScanEvent::Unterminated { kind, lines }) = scanner.finish() {
            self.errors
                .report(PipelineError::UnterminatedBlock { kind, lines })
                .await;
        }

        Ok(emitted)
    }

    fn apply_metadata(&mut self, kind: &str, lines: &[String]) -> Result<(), PipelineError> {
        if BlockKind::from_name(kind) != BlockKind::Info {
            warn!(kind, "first block is not an info block; using it as metadata");
        }
        let created = metadata_created(lines)?;
        self.state.advance(created);
        metrics::CURRENT_EPOCH.set(self.state.current_epoch);
        metrics::LAST_EPOCH.set(self.state.last_epoch);
        info!(
            last_epoch = self.state.last_epoch,
            current_epoch = self.state.current_epoch,
            "metadata block parsed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::error_channel;

    fn scan(lines: &[&str]) -> Vec<ScanEvent> {
        let mut scanner = BlockScanner::default();
        let mut events: Vec<ScanEvent> = lines
            .iter()
            .filter_map(|line| scanner.push_line(line.to_string()))
            .collect();
        events.extend(scanner.finish());
        events
    }

    const STATUS: &str = "\
# generated by the monitoring daemon
info {
\tcreated=1000
\tversion=4.4.6
\t}

hoststatus {
\thost_name=web01
\tlast_check=990
\t}

servicestatus {
\thost_name=web01
\tcheck_command=check_load
\tlast_check=1001
\tperformance_data=load1=0.50;5.00;10.00;0.00;0.00
\t}
";

    #[test]
    fn info_block_is_scanned() {
        assert_eq!(
            scan(&["info {", "\tcreated=123456", "\t}"]),
            vec![ScanEvent::Closed {
                kind: "info".to_string(),
                lines: vec!["\tcreated=123456".to_string()],
            }]
        );
    }

    #[test]
    fn scanning_is_repeatable() {
        let lines: Vec<&str> = STATUS.lines().collect();
        assert_eq!(scan(&lines), scan(&lines));
        assert_eq!(scan(&lines).len(), 3);
    }

    #[test]
    fn comments_and_lines_outside_blocks_are_ignored() {
        let events = scan(&["# comment", "stray=1", "", "hoststatus {", "#\t}", "\ta=1", "\t}"]);
        assert_eq!(
            events,
            vec![ScanEvent::Closed {
                kind: "hoststatus".to_string(),
                lines: vec!["\ta=1".to_string()],
            }]
        );
    }

    #[test]
    fn indentation_is_preserved() {
        let events = scan(&["servicestatus {", "\t\tnested=1", "\tflat=2", "\t}"]);
        let ScanEvent::Closed { lines, .. } = &events[0] else {
            panic!("expected a closed block");
        };
        assert_eq!(lines, &vec!["\t\tnested=1".to_string(), "\tflat=2".to_string()]);
    }

    #[test]
    fn reopening_or_eof_inside_a_block_is_reported() {
        let events = scan(&["a {", "\tx=1", "b {", "\ty=2", "\t}", "c {", "\tz=3"]);
        assert_eq!(
            events,
            vec![
                ScanEvent::Unterminated {
                    kind: "a".to_string(),
                    lines: 1
                },
                ScanEvent::Closed {
                    kind: "b".to_string(),
                    lines: vec!["\ty=2".to_string()],
                },
                ScanEvent::Unterminated {
                    kind: "c".to_string(),
                    lines: 1
                },
            ]
        );
    }

    fn reader(capacity: usize) -> (Reader, mpsc::Receiver<Block>) {
        let (block_tx, block_rx) = mpsc::channel(capacity);
        let (drained_tx, _) = broadcast::channel(4);
        let (errors, _error_rx) = error_channel(16);
        (Reader::new(block_tx, drained_tx, errors), block_rx)
    }

    #[tokio::test]
    async fn blocks_carry_the_run_state_of_their_file() {
        let (mut reader, mut blocks) = reader(16);

        let count = reader
            .read_blocks(Path::new("status.dat"), STATUS.as_bytes())
            .await
            .unwrap();
        assert_eq!(count, 3);
        for _ in 0..3 {
            let block = blocks.recv().await.unwrap();
            assert_eq!(block.current_epoch, 1000);
            assert_eq!(block.last_epoch, 0);
        }

        let second = STATUS.replace("created=1000", "created=2000");
        reader
            .read_blocks(Path::new("status.dat"), second.as_bytes())
            .await
            .unwrap();
        let info = blocks.recv().await.unwrap();
        assert_eq!(info.kind, "info");
        assert_eq!(info.current_epoch, 2000);
        assert_eq!(info.last_epoch, 1000);
        assert_eq!(
            reader.state(),
            RunState {
                last_epoch: 1000,
                current_epoch: 2000
            }
        );
    }

    #[tokio::test]
    async fn invalid_utf8_only_degrades_its_own_line() {
        let (reader, mut blocks) = reader(16);
        let (errors, mut error_rx) = error_channel(16);
        let mut reader = Reader { errors, ..reader };

        let mut input = b"info {\n\tcreated=1000\n\t}\nhoststatus {\n\thost_name=web01\n\tplugin_output=caf".to_vec();
        input.push(0xE9);
        input.extend_from_slice(b" OK\r\n\tlast_check=1001\n\t}\nhoststatus {\n\thost_name=web02\n\t}\n");

        let count = reader
            .read_blocks(Path::new("status.dat"), &input[..])
            .await
            .unwrap();
        assert_eq!(count, 3);
        drop(reader);
        assert!(error_rx.recv().await.is_none());

        blocks.recv().await.unwrap();
        let host = blocks.recv().await.unwrap();
        assert_eq!(host.lines[1], "\tplugin_output=caf\u{FFFD} OK");
        assert_eq!(host.lines[2], "\tlast_check=1001");
        assert_eq!(blocks.recv().await.unwrap().lines, vec!["\thost_name=web02"]);
    }

    #[tokio::test]
    async fn missing_created_is_fatal() {
        let (mut reader, _blocks) = reader(16);
        let input = "info {\n\tversion=4\n\t}\n";
        let err = reader
            .read_blocks(Path::new("status.dat"), input.as_bytes())
            .await
            .unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(err.is_fatal());
        assert_eq!(reader.state(), RunState::default());
    }

    #[tokio::test]
    async fn run_signals_end_of_file_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.dat");
        std::fs::write(&path, STATUS).unwrap();

        let (block_tx, mut block_rx) = mpsc::channel(16);
        let (drained_tx, mut drained_rx) = broadcast::channel(4);
        let (errors, _error_rx) = error_channel(16);
        let (file_tx, file_rx) = mpsc::channel(2);

        let task = tokio::spawn(Reader::new(block_tx, drained_tx, errors).run(file_rx));
        file_tx.send(StatusFile::open(&path).await.unwrap()).await.unwrap();
        drop(file_tx);

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.current_epoch, 1000);
        assert_eq!(
            drained_rx.recv().await.unwrap(),
            FileDrained {
                sequence: 1,
                blocks: 3
            }
        );

        let mut kinds = Vec::new();
        while let Some(block) = block_rx.recv().await {
            kinds.push(block.kind);
        }
        assert_eq!(kinds, vec!["info", "hoststatus", "servicestatus"]);
    }

    #[tokio::test]
    async fn opening_a_missing_file_is_reported() {
        let err = StatusFile::open(Path::new("/definitely/not/here/status.dat"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "file_open");
        assert!(!err.is_fatal());
    }
}
