use crate::config::WatcherConfig;
use crate::error::PipelineError;
use crate::reader::StatusFile;
use crate::report::ErrorReporter;
use anyhow::{bail, Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WATCHER_CHANNEL_CAPACITY: usize = 128;

/// Filesystem operation carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub op: WatchOp,
    pub path: PathBuf,
}

/// Maps a notify event onto per-path operations.
///
/// A rename onto a name counts as creating it: atomic replacement ends with
/// the temporary file being moved over the target. Back-ends that pair the
/// two halves of a rename also send a separate `To` event, so the paired
/// `Both` event is only a rename.
pub fn classify(event: &Event) -> Vec<WatchEvent> {
    let all = |op: WatchOp| {
        event
            .paths
            .iter()
            .map(|path| WatchEvent {
                op,
                path: path.clone(),
            })
            .collect::<Vec<_>>()
    };

    match &event.kind {
        EventKind::Create(_) => all(WatchOp::Create),
        EventKind::Remove(_) => all(WatchOp::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(WatchOp::Create),
        EventKind::Modify(ModifyKind::Name(_)) => all(WatchOp::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => all(WatchOp::Chmod),
        EventKind::Modify(_) => all(WatchOp::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => all(WatchOp::Other),
    }
}

/// Re-registration policy used when a watched file is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self {
            delay: config.rewatch_delay(),
            max_attempts: config.rewatch_max_attempts.max(1),
        }
    }
}

/// Watches one path and yields the events whose path matches a filter.
pub struct PathWatcher {
    watcher: RecommendedWatcher,
    path: PathBuf,
    is_dir: bool,
    filter: Option<Regex>,
    policy: RetryPolicy,
    raw_events: mpsc::Receiver<notify::Result<Event>>,
    pending: VecDeque<WatchEvent>,
}

impl PathWatcher {
    pub fn new(
        path: &Path,
        filter: Option<Regex>,
        poll_interval: Duration,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let is_dir = std::fs::metadata(path)
            .with_context(|| format!("failed to stat watch path {}", path.display()))?
            .is_dir();

        let (raw_tx, raw_events) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                if raw_tx.blocking_send(res).is_err() {
                    debug!("watch event receiver dropped; discarding event");
                }
            },
            NotifyConfig::default().with_poll_interval(poll_interval),
        )
        .context("failed to create notify watcher")?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch path {}", path.display()))?;

        info!(path = %path.display(), is_dir, "file watcher started");

        Ok(Self {
            watcher,
            path: path.to_path_buf(),
            is_dir,
            filter,
            policy,
            raw_events,
            pending: VecDeque::new(),
        })
    }

    /// Next event matching the filter; `None` once the notify stream ends.
    ///
    /// A removal of a watched plain file re-registers the watch first, since
    /// some back-ends drop the watch along with the file.
    pub async fn next(&mut self) -> Result<Option<WatchEvent>, PipelineError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let event = match self.raw_events.recv().await {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    warn!(error = %err, "file watcher error");
                    continue;
                }
                None => return Ok(None),
            };

            for watch_event in classify(&event) {
                if watch_event.op == WatchOp::Remove && !self.is_dir {
                    self.rewatch().await?;
                }
                if self.matches(&watch_event.path) {
                    self.pending.push_back(watch_event);
                }
            }
        }
    }

    fn matches(&self, path: &Path) -> bool {
        match &self.filter {
            Some(filter) => filter.is_match(&path.to_string_lossy()),
            None => true,
        }
    }

    async fn rewatch(&mut self) -> Result<(), PipelineError> {
        if let Err(err) = self.watcher.unwatch(&self.path) {
            debug!(path = %self.path.display(), error = %err, "unwatch before re-registration failed");
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.watcher.watch(&self.path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(path = %self.path.display(), attempts, "re-registered watch");
                    return Ok(());
                }
                Err(err) if attempts >= self.policy.max_attempts => {
                    return Err(PipelineError::WatchRegistration {
                        path: self.path.clone(),
                        attempts,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        attempts,
                        error = %err,
                        "failed to re-register watch; retrying"
                    );
                    sleep(self.policy.delay).await;
                }
            }
        }
    }
}

/// The status file and the directory watched for its re-creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub file: PathBuf,
    pub directory: PathBuf,
}

impl WatchTarget {
    /// Resolves the parent directory of `input`; failing here ends the run.
    pub fn resolve(input: &Path) -> Result<Self, PipelineError> {
        let parent = match input.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let not_a_directory = || PipelineError::WatchDirectory {
            path: parent.clone(),
        };

        let is_dir = std::fs::metadata(&parent)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(not_a_directory());
        }
        let directory = parent.canonicalize().map_err(|_| not_a_directory())?;
        let file_name = input.file_name().ok_or_else(not_a_directory)?;

        Ok(Self {
            file: directory.join(file_name),
            directory,
        })
    }

    /// Filter matching exactly the status file's path.
    pub fn exact_filter(&self) -> Result<Regex> {
        let pattern = format!("^{}$", regex::escape(&self.file.to_string_lossy()));
        Regex::new(&pattern).context("failed to build watch filter")
    }
}

/// Opens the status file every time it is created and forwards the handle.
///
/// Runs until `cancel` fires. Other operations are logged and ignored.
pub async fn watch_recreation(
    target: WatchTarget,
    config: WatcherConfig,
    files: mpsc::Sender<StatusFile>,
    errors: ErrorReporter,
    cancel: CancellationToken,
) -> Result<()> {
    let filter = match &config.filter {
        Some(pattern) => Regex::new(pattern)
            .with_context(|| format!("invalid watch filter {pattern:?}"))?,
        None => target.exact_filter()?,
    };
    let mut watcher = PathWatcher::new(
        &target.directory,
        Some(filter),
        config.poll_interval(),
        RetryPolicy::from_config(&config),
    )?;

    info!(
        file = %target.file.display(),
        directory = %target.directory.display(),
        "watching for status file re-creation"
    );

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = watcher.next() => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => bail!("file watcher event stream ended"),
            Err(err) => {
                error!(error = %err, "file watcher lost its registration");
                return Err(err.into());
            }
        };

        if event.op != WatchOp::Create {
            debug!(op = ?event.op, path = %event.path.display(), "ignoring watch event");
            continue;
        }

        debug!(path = %event.path.display(), "detected status file creation");
        let file = match StatusFile::open(&target.file).await {
            Ok(file) => file,
            Err(err) => {
                errors.report(err).await;
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = files.send(file) => {
                if sent.is_err() {
                    bail!("file channel closed while watcher was running");
                }
            }
        }
    }

    info!("file watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::error_channel;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    fn ops(event: &Event) -> Vec<(WatchOp, PathBuf)> {
        classify(event)
            .into_iter()
            .map(|event| (event.op, event.path))
            .collect()
    }

    #[test]
    fn creations_and_moves_onto_the_target_are_creates() {
        let created = event(EventKind::Create(CreateKind::File), &["/d/status.dat"]);
        assert_eq!(ops(&created), vec![(WatchOp::Create, "/d/status.dat".into())]);

        let moved = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/d/status.dat"],
        );
        assert_eq!(ops(&moved), vec![(WatchOp::Create, "/d/status.dat".into())]);

        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/d/status.tmp", "/d/status.dat"],
        );
        assert!(ops(&both).iter().all(|(op, _)| *op == WatchOp::Rename));
    }

    #[test]
    fn other_operations_are_not_creates() {
        let cases = [
            (EventKind::Remove(RemoveKind::File), WatchOp::Remove),
            (
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                WatchOp::Write,
            ),
            (
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                WatchOp::Chmod,
            ),
            (
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                WatchOp::Rename,
            ),
            (EventKind::Other, WatchOp::Other),
        ];
        for (kind, expected) in cases {
            assert_eq!(ops(&event(kind, &["/d/x"]))[0].0, expected);
        }
    }

    #[test]
    fn resolve_requires_an_existing_parent_directory() {
        let err = WatchTarget::resolve(Path::new("/no/such/dir/status.dat")).unwrap_err();
        assert!(err.is_fatal());

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, "x").unwrap();
        assert!(WatchTarget::resolve(&plain.join("status.dat")).is_err());

        let target = WatchTarget::resolve(&dir.path().join("status.dat")).unwrap();
        assert_eq!(target.directory, dir.path().canonicalize().unwrap());
        assert!(target.file.ends_with("status.dat"));
    }

    #[test]
    fn exact_filter_matches_only_the_target() {
        let target = WatchTarget {
            file: PathBuf::from("/var/cache/nagios/status.dat"),
            directory: PathBuf::from("/var/cache/nagios"),
        };
        let filter = target.exact_filter().unwrap();
        assert!(filter.is_match("/var/cache/nagios/status.dat"));
        assert!(!filter.is_match("/var/cache/nagios/status.dat.tmp"));
        assert!(!filter.is_match("/var/cache/nagios/statusxdat"));
    }

    async fn next_op(watcher: &mut PathWatcher) -> Result<Option<WatchEvent>, PipelineError> {
        tokio::time::timeout(Duration::from_secs(10), watcher.next())
            .await
            .expect("watch event should arrive before the timeout")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removed_file_is_watched_again_once_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("status.dat");
        std::fs::write(&file, "a").unwrap();

        let policy = RetryPolicy {
            delay: Duration::from_millis(50),
            max_attempts: 100,
        };
        let mut watcher =
            PathWatcher::new(&file, None, Duration::from_millis(100), policy).unwrap();

        std::fs::remove_file(&file).unwrap();
        let writer = tokio::spawn({
            let file = file.clone();
            async move {
                sleep(Duration::from_millis(200)).await;
                std::fs::write(&file, "b").unwrap();
                sleep(Duration::from_millis(300)).await;
                std::fs::write(&file, "c").unwrap();
            }
        });

        let mut ops = Vec::new();
        loop {
            let event = next_op(&mut watcher).await.unwrap().unwrap();
            ops.push(event.op);
            if event.op == WatchOp::Write && ops.contains(&WatchOp::Remove) {
                break;
            }
        }
        writer.await.unwrap();

        let removed = ops.iter().position(|op| *op == WatchOp::Remove).unwrap();
        assert!(ops[removed..].contains(&WatchOp::Write), "ops: {ops:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhausted_rewatch_attempts_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("status.dat");
        std::fs::write(&file, "a").unwrap();

        let policy = RetryPolicy {
            delay: Duration::from_millis(10),
            max_attempts: 3,
        };
        let mut watcher =
            PathWatcher::new(&file, None, Duration::from_millis(100), policy).unwrap();
        std::fs::remove_file(&file).unwrap();

        let err = loop {
            match next_op(&mut watcher).await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("watch stream ended without an error"),
                Err(err) => break err,
            }
        };
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            PipelineError::WatchRegistration { attempts: 3, .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn atomic_replacement_delivers_a_file_handle() {
        let dir = tempfile::tempdir().unwrap();
        let target = WatchTarget::resolve(&dir.path().join("status.dat")).unwrap();
        let (file_tx, mut file_rx) = mpsc::channel(1);
        let (errors, _error_rx) = error_channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(watch_recreation(
            target.clone(),
            WatcherConfig::default(),
            file_tx,
            errors,
            cancel.clone(),
        ));
        sleep(Duration::from_millis(200)).await;

        let temp = target.directory.join("status.tmp");
        std::fs::write(&temp, "info {\n\tcreated=1\n\t}\n").unwrap();
        std::fs::rename(&temp, &target.file).unwrap();

        let file = tokio::time::timeout(Duration::from_secs(10), file_rx.recv())
            .await
            .expect("watcher should forward the new file")
            .unwrap();
        assert_eq!(file.path, target.file);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
