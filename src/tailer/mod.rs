// SPDX-License-Identifier: MIT
//! Log tailer (C2).
//!
//! Maintains per-file `(identity, offset)` state, splits incoming bytes into
//! lines, and detects rotation/truncation by comparing file identity
//! (`dev`/`ino` on Unix) and length against what was last seen. A plain async
//! task per watched file, as SPEC_FULL.md §4 specifies — no dependency on the
//! watcher or store beyond the line-producing interface.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::TailError;

/// Maximum line length before we give up looking for a newline and emit a
/// truncated line with a warning (spec.md §4.2 "pathological input").
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self { dev: meta.dev(), ino: meta.ino() }
    }

    #[cfg(not(unix))]
    fn from_metadata(_meta: &std::fs::Metadata) -> Self {
        // No stable device/inode on non-Unix targets; rotation detection
        // falls back to length-shrink detection only.
        Self { dev: 0, ino: 0 }
    }
}

#[derive(Debug, Clone)]
struct TailState {
    identity: FileIdentity,
    offset: u64,
    len: u64,
}

/// Diagnostics snapshot for one watched file, for an operator-facing status view.
#[derive(Debug, Clone)]
pub struct TailDiagnostics {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
    pub rotations_detected: u64,
    pub lines_truncated: u64,
}

struct TailEntry {
    state: TailState,
    rotations_detected: u64,
    lines_truncated: u64,
}

/// Shared, mutex-guarded map of per-file tail state, readable by a
/// diagnostics endpoint while a tail task owns the write side.
#[derive(Default, Clone)]
pub struct TailRegistry {
    inner: Arc<RwLock<HashMap<PathBuf, TailEntry>>>,
}

impl TailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<TailDiagnostics> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(path, entry)| TailDiagnostics {
                path: path.clone(),
                offset: entry.state.offset,
                len: entry.state.len,
                rotations_detected: entry.rotations_detected,
                lines_truncated: entry.lines_truncated,
            })
            .collect()
    }
}

/// Tails a single file, yielding complete lines as they're appended and
/// detecting rotation (identity or length-shrink change) transparently.
pub struct FileTailer {
    path: PathBuf,
    registry: TailRegistry,
    reader: Option<BufReader<File>>,
    pending: Vec<u8>,
}

impl FileTailer {
    /// Open `path` and seek to EOF — a newly added watch only sees lines
    /// written after it starts (spec.md §4.2 "New file").
    pub async fn open_at_eof(path: PathBuf, registry: TailRegistry) -> Result<Self, TailError> {
        let mut tailer = Self { path: path.clone(), registry, reader: None, pending: Vec::new() };
        tailer.reopen_at(u64::MAX).await?;
        Ok(tailer)
    }

    /// Open `path` from the beginning — used by historical import, which is
    /// exclusive with live tailing of the same file (spec.md §4.2).
    pub async fn open_from_start(path: PathBuf, registry: TailRegistry) -> Result<Self, TailError> {
        let mut tailer = Self { path: path.clone(), registry, reader: None, pending: Vec::new() };
        tailer.reopen_at(0).await?;
        Ok(tailer)
    }

    async fn reopen_at(&mut self, offset_hint: u64) -> Result<(), TailError> {
        let file = File::open(&self.path).await.map_err(|source| TailError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let std_meta = file.metadata().await.map_err(|source| TailError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let len = std_meta.len();
        let identity = FileIdentity::from_metadata(&std_meta);
        let offset = offset_hint.min(len);

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| TailError::Io { path: self.path.display().to_string(), source })?;
        self.reader = Some(reader);

        let mut guard = self.registry.inner.write().await;
        guard.insert(
            self.path.clone(),
            TailEntry {
                state: TailState { identity, offset, len },
                rotations_detected: 0,
                lines_truncated: 0,
            },
        );
        Ok(())
    }

    /// Check whether the underlying file has rotated or been truncated since
    /// we last looked, without consuming any bytes.
    async fn check_rotation(&mut self) -> Result<bool, TailError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(true); // file gone; caller should wait for a Created event
            }
            Err(source) => {
                return Err(TailError::Io { path: self.path.display().to_string(), source })
            }
        };
        let new_identity = FileIdentity::from_metadata(&meta);
        let new_len = meta.len();

        let guard = self.registry.inner.read().await;
        let Some(entry) = guard.get(&self.path) else { return Ok(false) };
        let identity_changed = entry.state.identity != new_identity;
        let truncated = new_len < entry.state.offset;
        Ok(identity_changed || truncated)
    }

    /// Handle rotation: reopen the file from its start (the rotated-to-fresh
    /// file is new and has nothing we've already seen).
    async fn handle_rotation(&mut self) -> Result<(), TailError> {
        info!(path = %self.path.display(), "rotation detected, reopening from start");
        {
            let mut guard = self.registry.inner.write().await;
            if let Some(entry) = guard.get_mut(&self.path) {
                entry.rotations_detected += 1;
            }
        }
        self.pending.clear();
        self.reopen_at(0).await
    }

    /// Read and return any complete lines available right now (non-blocking
    /// with respect to "wait for more data" — returns an empty vec if there's
    /// nothing new). Caller is expected to call this in response to watcher
    /// `Written` events.
    pub async fn read_available_lines(&mut self) -> Result<Vec<String>, TailError> {
        if self.check_rotation().await? {
            self.handle_rotation().await?;
        }

        let reader = self.reader.as_mut().expect("reader initialized in open_*");
        let mut lines = Vec::new();
        loop {
            let mut buf = Vec::new();
            let n = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|source| TailError::Io { path: self.path.display().to_string(), source })?;
            if n == 0 {
                break;
            }
            let ends_with_newline = buf.last() == Some(&b'\n');
            if !ends_with_newline {
                // Partial line at EOF: stash it and wait for more bytes.
                self.pending.extend_from_slice(&buf);
                if self.pending.len() > MAX_LINE_BYTES {
                    warn!(path = %self.path.display(), "line exceeded max length without newline, truncating");
                    let mut guard = self.registry.inner.write().await;
                    if let Some(entry) = guard.get_mut(&self.path) {
                        entry.lines_truncated += 1;
                    }
                    lines.push(String::from_utf8_lossy(&self.pending).to_string());
                    self.pending.clear();
                }
                break;
            }

            let mut full = std::mem::take(&mut self.pending);
            full.extend_from_slice(&buf);
            let line = String::from_utf8_lossy(&full).trim_end_matches(['\r', '\n']).to_string();
            lines.push(line);
        }

        let consumed = reader.stream_position().await.map_err(|source| TailError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let mut guard = self.registry.inner.write().await;
        if let Some(entry) = guard.get_mut(&self.path) {
            entry.state.offset = consumed;
            if let Ok(meta) = std::fs::metadata(&self.path) {
                entry.state.len = meta.len();
            }
        }

        Ok(lines)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads an entire file from the beginning in batches (minimum 100 lines per
/// batch, per spec.md §4.2 "Historical import"), for backfilling old log
/// files. Exclusive with live tailing of the same path — callers must not run
/// both against the same file concurrently.
pub async fn historical_import_batches(
    path: PathBuf,
    batch_size: usize,
    mut on_batch: impl FnMut(Vec<String>) -> bool,
) -> Result<(), TailError> {
    let batch_size = batch_size.max(100);
    let file = File::open(&path).await.map_err(|source| TailError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let mut buf = Vec::new();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|source| TailError::Io { path: path.display().to_string(), source })?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
        batch.push(line);
        if batch.len() >= batch_size {
            let keep_going = on_batch(std::mem::take(&mut batch));
            if !keep_going {
                return Ok(());
            }
        }
    }
    if !batch.is_empty() {
        on_batch(batch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn new_file_starts_at_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mainlog");
        tokio::fs::write(&path, b"line one\nline two\n").await.unwrap();

        let registry = TailRegistry::new();
        let mut tailer = FileTailer::open_at_eof(path.clone(), registry).await.unwrap();
        let lines = tailer.read_available_lines().await.unwrap();
        assert!(lines.is_empty(), "should not see pre-existing content");

        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"line three\n").await.unwrap();
        file.flush().await.unwrap();

        let lines = tailer.read_available_lines().await.unwrap();
        assert_eq!(lines, vec!["line three".to_string()]);
    }

    #[tokio::test]
    async fn historical_import_reads_from_start_in_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mainlog");
        let content: String = (0..250).map(|i| format!("line {i}\n")).collect();
        tokio::fs::write(&path, content).await.unwrap();

        let mut total = 0usize;
        let mut batches = 0usize;
        historical_import_batches(path, 100, |batch| {
            total += batch.len();
            batches += 1;
            true
        })
        .await
        .unwrap();

        assert_eq!(total, 250);
        assert!(batches >= 3);
    }

    #[tokio::test]
    async fn rotation_detected_via_identity_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mainlog");
        tokio::fs::write(&path, b"before rotation\n").await.unwrap();

        let registry = TailRegistry::new();
        let mut tailer = FileTailer::open_from_start(path.clone(), registry.clone()).await.unwrap();
        let lines = tailer.read_available_lines().await.unwrap();
        assert_eq!(lines, vec!["before rotation".to_string()]);

        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::write(&path, b"after rotation\n").await.unwrap();

        let lines = tailer.read_available_lines().await.unwrap();
        assert_eq!(lines, vec!["after rotation".to_string()]);

        let snapshot = registry.snapshot().await;
        let entry = snapshot.iter().find(|d| d.path == path).unwrap();
        assert_eq!(entry.rotations_detected, 1);
    }
}
