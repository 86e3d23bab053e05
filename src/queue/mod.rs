// SPDX-License-Identifier: MIT
//! Queue Controller (C6): invokes the MTA binary for list/inspect/manipulate
//! operations, enforces per-operation timeouts, and serializes concurrent
//! access to the same message id. Mirrors the `run_shell_command` timeout
//! pattern and the process-pool-style `Mutex`-guarded bookkeeping this
//! codebase already uses elsewhere.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::QueueError;
use crate::model::{MessageId, QueueAction, QueueSnapshot};

#[derive(Debug, Clone)]
pub struct OpTimeouts {
    pub list: Duration,
    pub inspect: Duration,
    pub manipulate: Duration,
}

impl Default for OpTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(10),
            inspect: Duration::from_secs(30),
            manipulate: Duration::from_secs(15),
        }
    }
}

/// Invokes the configured MTA binary with fixed argument lists (never shell
/// interpolation) and a per-operation timeout.
pub struct QueueController {
    binary_path: PathBuf,
    timeouts: OpTimeouts,
    in_flight: Mutex<HashSet<MessageId>>,
    bulk_semaphore: Arc<Semaphore>,
}

/// Outcome of one message-id operation inside a bulk request.
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub message_id: MessageId,
    pub result: Result<(), String>,
}

#[derive(Debug, Clone)]
pub struct BulkResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<OpOutcome>,
}

/// One entry from a parsed `exim -bp` queue listing (spec.md §6.2
/// `ListQueue`).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub age_seconds: i64,
    pub size_bytes: i64,
    pub sender: String,
    pub recipients: Vec<String>,
    pub frozen: bool,
}

/// `ListQueue`'s sort field (spec.md §6.2): `RetryCount` always sorts as `0`
/// for every entry since the raw `-bp` listing never carries a retry
/// counter — a stable sort, so ties fall back to listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Id,
    Sender,
    Size,
    Age,
    Status,
    RetryCount,
}

/// Header line, e.g. `" 25m   2.5K 1hKj4x-0008Oi-3r <sender@example.com>"` or
/// `"3w2d   512 1hKj4x-0008Oi-3r <sender@example.com>"`. The age column is
/// one or two `<number><unit>` groups (`w`eek/`d`ay/`h`our/`m`inute); the
/// size column is a byte count with an optional `K`/`M` suffix.
static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*((?:\d+[wdhm])+)\s+([\d.]+[KM]?)\s+(\S+)\s+<([^>]*)>\s*$").unwrap()
});

fn parse_age_to_seconds(age: &str) -> i64 {
    static COMPONENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)([wdhm])").unwrap());
    COMPONENT_RE
        .captures_iter(age)
        .map(|c| {
            let n: i64 = c[1].parse().unwrap_or(0);
            match &c[2] {
                "w" => n * 7 * 24 * 3600,
                "d" => n * 24 * 3600,
                "h" => n * 3600,
                "m" => n * 60,
                _ => 0,
            }
        })
        .sum()
}

fn parse_size_to_bytes(size: &str) -> i64 {
    if let Some(kb) = size.strip_suffix('K') {
        (kb.parse::<f64>().unwrap_or(0.0) * 1024.0) as i64
    } else if let Some(mb) = size.strip_suffix('M') {
        (mb.parse::<f64>().unwrap_or(0.0) * 1024.0 * 1024.0) as i64
    } else {
        size.parse().unwrap_or(0)
    }
}

/// Best-effort parser for `exim -bp`'s text format: one header line per
/// message (age, size, id, sender), followed by indented recipient lines,
/// with a `*** frozen ***`-style marker line for frozen messages and a blank
/// line separating entries. Lines that don't match the expected shape are
/// skipped rather than failing the whole listing — the raw text remains
/// available via [`QueueController::list_queue`] for anything this misses.
pub fn parse_queue_listing(raw: &str) -> Vec<QueueMessage> {
    let mut messages = Vec::new();
    let mut current: Option<QueueMessage> = None;

    for line in raw.lines() {
        if let Some(captures) = HEADER_RE.captures(line) {
            if let Some(done) = current.take() {
                messages.push(done);
            }
            let Some(message_id) = MessageId::parse(&captures[3]) else { continue };
            current = Some(QueueMessage {
                message_id,
                age_seconds: parse_age_to_seconds(&captures[1]),
                size_bytes: parse_size_to_bytes(&captures[2]),
                sender: captures[4].to_string(),
                recipients: Vec::new(),
                frozen: false,
            });
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(msg) = current.as_mut() {
            if trimmed.eq_ignore_ascii_case("*** frozen ***") {
                msg.frozen = true;
            } else {
                msg.recipients.push(trimmed.to_string());
            }
        }
    }
    if let Some(done) = current.take() {
        messages.push(done);
    }
    messages
}

fn sort_key_status(frozen: bool) -> &'static str {
    if frozen { "frozen" } else { "queued" }
}

/// Sort parsed queue entries in place by `field` (spec.md §6.2 `ListQueue`
/// sort support). Ascending in every case; callers reverse the slice
/// themselves for descending order.
pub fn sort_queue_messages(messages: &mut [QueueMessage], field: SortField) {
    match field {
        SortField::Id => messages.sort_by(|a, b| a.message_id.as_str().cmp(b.message_id.as_str())),
        SortField::Sender => messages.sort_by(|a, b| a.sender.cmp(&b.sender)),
        SortField::Size => messages.sort_by_key(|m| m.size_bytes),
        SortField::Age => messages.sort_by_key(|m| m.age_seconds),
        SortField::Status => messages.sort_by_key(|m| sort_key_status(m.frozen)),
        SortField::RetryCount => {} // no retry counter in the raw listing; stable no-op.
    }
}

impl QueueController {
    pub fn new(binary_path: PathBuf, timeouts: OpTimeouts, bulk_concurrency_limit: usize) -> Self {
        Self {
            binary_path,
            timeouts,
            in_flight: Mutex::new(HashSet::new()),
            bulk_semaphore: Arc::new(Semaphore::new(bulk_concurrency_limit.max(1))),
        }
    }

    async fn run(&self, args: &[&str], op_timeout: Duration) -> Result<String, QueueError> {
        if !self.binary_path.exists() {
            return Err(QueueError::BinaryMissing(self.binary_path.display().to_string()));
        }
        let mut command = tokio::process::Command::new(&self.binary_path);
        command.args(args);

        let output = timeout(op_timeout, command.output())
            .await
            .map_err(|_| QueueError::Timeout(op_timeout))?
            .map_err(QueueError::Spawn)?;

        if !output.status.success() {
            return Err(QueueError::NonZeroExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `exim -bp` — raw queue listing. Parsing the output into structured
    /// entries is the Parser's concern if ever needed; this returns raw text
    /// per spec.md §4.6's "wraps the binary" contract.
    pub async fn list_queue(&self) -> Result<String, QueueError> {
        self.run(&["-bp"], self.timeouts.list).await
    }

    /// Like [`Self::list_queue`] but parsed into structured entries, sorted
    /// by `sort` (spec.md §6.2 `ListQueue`). Pass `descending` to reverse.
    pub async fn list_queue_parsed(&self, sort: SortField, descending: bool) -> Result<Vec<QueueMessage>, QueueError> {
        let raw = self.list_queue().await?;
        let mut messages = parse_queue_listing(&raw);
        sort_queue_messages(&mut messages, sort);
        if descending {
            messages.reverse();
        }
        Ok(messages)
    }

    pub async fn inspect_headers(&self, message_id: &MessageId) -> Result<String, QueueError> {
        self.run(&["-Mvh", message_id.as_str()], self.timeouts.inspect).await
    }

    pub async fn inspect_body(&self, message_id: &MessageId) -> Result<String, QueueError> {
        self.run(&["-Mvb", message_id.as_str()], self.timeouts.inspect).await
    }

    pub async fn inspect_log(&self, message_id: &MessageId) -> Result<String, QueueError> {
        self.run(&["-Mvl", message_id.as_str()], self.timeouts.inspect).await
    }

    /// Acquire the per-message-id in-flight lock, run `f`, then release.
    /// Returns [`QueueError::AlreadyInFlight`] if another operation already
    /// holds this id (spec.md §4.6 "no concurrent ops on the same message").
    async fn with_lock<F, Fut>(&self, message_id: &MessageId, f: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), QueueError>>,
    {
        {
            let mut guard = self.in_flight.lock().await;
            if !guard.insert(message_id.clone()) {
                return Err(QueueError::AlreadyInFlight);
            }
        }
        let result = f().await;
        self.in_flight.lock().await.remove(message_id);
        result
    }

    pub async fn deliver(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let args = ["-M", message_id.as_str()];
        let timeouts = self.timeouts.clone();
        self.with_lock(message_id, || async { self.run(&args, timeouts.manipulate).await.map(|_| ()) }).await
    }

    pub async fn freeze(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let args = ["-Mf", message_id.as_str()];
        let timeouts = self.timeouts.clone();
        self.with_lock(message_id, || async { self.run(&args, timeouts.manipulate).await.map(|_| ()) }).await
    }

    pub async fn thaw(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let args = ["-Mt", message_id.as_str()];
        let timeouts = self.timeouts.clone();
        self.with_lock(message_id, || async { self.run(&args, timeouts.manipulate).await.map(|_| ()) }).await
    }

    pub async fn delete(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let args = ["-Mrm", message_id.as_str()];
        let timeouts = self.timeouts.clone();
        self.with_lock(message_id, || async { self.run(&args, timeouts.manipulate).await.map(|_| ()) }).await
    }

    pub async fn apply_action(&self, message_id: &MessageId, action: QueueAction) -> Result<(), QueueError> {
        match action {
            QueueAction::Deliver => self.deliver(message_id).await,
            QueueAction::Freeze => self.freeze(message_id).await,
            QueueAction::Thaw => self.thaw(message_id).await,
            QueueAction::Delete => self.delete(message_id).await,
        }
    }

    /// Bulk operation over many ids, bounded by a concurrency cap, with no
    /// fail-fast: every id is attempted and its outcome recorded regardless
    /// of whether earlier ids failed (spec.md §8 "Bulk freeze with one bad id").
    pub async fn bulk_apply(&self, ids: &[MessageId], action: QueueAction) -> BulkResult {
        // No tokio::spawn here — futures borrow `self` and are all driven to
        // completion within this function, so there's no need for `Self` to
        // be `Clone`/`'static` just to fan out with bounded concurrency.
        let mut outcomes = Vec::with_capacity(ids.len());
        let mut futures = futures_util::stream::FuturesUnordered::new();
        for id in ids.iter().cloned() {
            let semaphore = self.bulk_semaphore.clone();
            futures.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let result = self.apply_action(&id, action).await.map_err(|e| e.to_string());
                OpOutcome { message_id: id, result }
            });
        }
        use futures_util::StreamExt;
        while let Some(outcome) = futures.next().await {
            if let Err(err) = &outcome.result {
                warn!(message_id = %outcome.message_id, action = %action, error = %err, "bulk operation failed for id");
            }
            outcomes.push(outcome);
        }

        let successful = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let failed = outcomes.len() - successful;
        info!(total = outcomes.len(), successful, failed, action = %action, "bulk operation complete");
        BulkResult { total: outcomes.len(), successful, failed, outcomes }
    }

    /// Takes a point-in-time [`QueueSnapshot`] from a parsed `-bp` listing.
    /// "Deferred" here means queued and not frozen — the raw listing has no
    /// separate marker for a message that has been retried at least once.
    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let raw = self.list_queue().await?;
        let messages = parse_queue_listing(&raw);
        let total = messages.len() as i64;
        let frozen = messages.iter().filter(|m| m.frozen).count() as i64;
        let deferred = total - frozen;
        let oldest_age_seconds = messages.iter().map(|m| m.age_seconds).max().unwrap_or(0);
        Ok(QueueSnapshot { timestamp: chrono::Utc::now(), total, deferred, frozen, oldest_age_seconds })
    }
}
