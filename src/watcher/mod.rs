// SPDX-License-Identifier: MIT
//! File watcher (C1).
//!
//! Watches a set of log directories for create/write/remove/rename activity
//! and forwards a normalized [`WatchEvent`] stream to the tailer. Built on
//! `notify`, the same crate the daemon's mailbox/repo watchers use — the
//! `notify` callback runs on a library-owned thread and must not touch async
//! state directly, so it only ever does a `blocking_send` into an mpsc channel.

use std::path::PathBuf;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::WatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Written(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Watches one or more directories and streams [`WatchEvent`]s. Registration
/// is per-path and tolerant of individual failures (spec.md §4.1 "Partial
/// failure"): a path that can't be watched is logged and skipped, and the
/// watcher only refuses to start if *every* configured path failed.
pub struct FileWatcher {
    _inner: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
}

impl FileWatcher {
    /// Register watches on every directory in `paths`. Returns
    /// [`WatchError::AllPathsFailed`] only if none of them could be watched.
    pub fn new(paths: &[PathBuf]) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::channel(1024);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                // Best-effort: if the async side has already shut down the
                // channel is closed and there is nothing useful to do.
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )
        .map_err(|source| WatchError::Register {
            path: "<init>".to_string(),
            source,
        })?;

        let mut registered = 0usize;
        for path in paths {
            match watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    registered += 1;
                    info!(path = %path.display(), "watching directory");
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "failed to register watch, skipping");
                }
            }
        }

        if registered == 0 {
            return Err(WatchError::AllPathsFailed);
        }

        Ok(Self { _inner: watcher, rx })
    }

    /// Pull the next normalized event, or `None` once the watcher has shut down.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            let res = self.rx.recv().await?;
            match res {
                Ok(event) => {
                    if let Some(mapped) = map_event(event) {
                        return Some(mapped);
                    }
                    // Event kind we don't care about (e.g. Access); keep polling.
                }
                Err(err) => {
                    warn!(error = %err, "watch backend error");
                }
            }
        }
    }
}

fn map_event(event: notify::Event) -> Option<WatchEvent> {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().next().map(WatchEvent::Created),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            let mut paths = event.paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => Some(WatchEvent::Renamed { from, to }),
                (Some(p), None) => Some(WatchEvent::Created(p)),
                _ => None,
            }
        }
        EventKind::Modify(_) => event.paths.into_iter().next().map(WatchEvent::Written),
        EventKind::Remove(_) => event.paths.into_iter().next().map(WatchEvent::Removed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn watcher_reports_created_file() {
        let dir = tempdir().unwrap();
        let mut watcher = FileWatcher::new(&[dir.path().to_path_buf()]).unwrap();

        let file_path = dir.path().join("mainlog");
        tokio::fs::write(&file_path, b"hello\n").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.next_event())
            .await
            .expect("timed out waiting for watch event");
        assert!(event.is_some());
    }

    #[test]
    fn all_paths_failed_when_nothing_registers() {
        let bogus = PathBuf::from("/nonexistent/definitely-not-a-real-path-xyz");
        let result = FileWatcher::new(&[bogus]);
        assert!(matches!(result, Err(WatchError::AllPathsFailed)));
    }
}
