// SPDX-License-Identifier: MIT
//! The Store (C4): embedded SQLite persistence for every entity in the data
//! model, with a single dedicated writer connection and a capped reader pool
//! (SPEC_FULL.md "Store connection pool sizing"), matching the spec's
//! single-writer embedded DB model.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Connection, Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::*;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Default timeout for individual queries — protects against a wedged
/// connection blocking the daemon indefinitely.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.message().contains("database is locked") || e.message().contains("busy"))
}

/// Page of results plus whether more rows exist past this page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub sender_contains: Option<String>,
    pub recipient_contains: Option<String>,
    pub message_id: Option<MessageId>,
    pub statuses: Vec<MessageStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl MessageFilter {
    /// Per spec.md §6 "pagination": `limit` clamps to 200, `offset` floors at 0.
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, 200);
        self.offset = self.offset.max(0);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogEntryFilter {
    pub message_id: Option<MessageId>,
    pub raw_line_contains: Option<String>,
    pub event_types: Vec<EventType>,
    pub smtp_code: Option<String>,
    pub host: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl LogEntryFilter {
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, 200);
        self.offset = self.offset.max(0);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub log_entries_days: i64,
    pub delivery_attempts_days: i64,
    pub audit_entries_days: i64,
    pub queue_snapshots_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            log_entries_days: 90,
            delivery_attempts_days: 180,
            audit_entries_days: 365,
            queue_snapshots_days: 30,
        }
    }
}

/// Embedded SQLite store. `writer` serializes all mutating statements through
/// one connection (SQLite allows a single writer at a time regardless of WAL
/// mode); `reader_pool` is for concurrent read-only queries.
#[derive(Clone)]
pub struct Storage {
    writer: std::sync::Arc<Mutex<sqlx::SqliteConnection>>,
    reader_pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_path: &Path, max_reader_conns: u32) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        let make_opts = || {
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .expect("db path is valid sqlite connection string")
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true)
        };

        use sqlx::ConnectOptions;
        let writer_conn = make_opts().connect().await?;
        let reader_pool = SqlitePoolOptions::new()
            .max_connections(max_reader_conns.max(1))
            .connect_with(make_opts())
            .await?;

        let storage = Self {
            writer: std::sync::Arc::new(Mutex::new(writer_conn)),
            reader_pool,
        };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().await;
        sqlx::migrate!("src/store/migrations")
            .run(&mut *guard)
            .await?;
        Ok(())
    }

    // ─── Log entries ────────────────────────────────────────────────────

    /// Insert a parsed log entry. Idempotent on `(timestamp, raw_line,
    /// log_source)` — a duplicate insert (e.g. after a crash-and-reread) is
    /// silently ignored rather than erroring (spec.md §4.4 "Idempotent writes").
    pub async fn create_log_entry(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let recipients_csv = entry.recipients.clone();
        let message_id = entry.message_id.as_ref().map(|m| m.as_str().to_string());
        retry_with_backoff(&RetryConfig::default(), || async {
            let mut guard = self.writer.lock().await;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO log_entries
                 (timestamp, log_source, event_type, message_id, sender, recipients, host, smtp_code, error, raw_line)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.timestamp.to_rfc3339())
            .bind(entry.log_source.as_str())
            .bind(entry.event_type.as_str())
            .bind(&message_id)
            .bind(&entry.sender)
            .bind(&recipients_csv)
            .bind(&entry.host)
            .bind(&entry.smtp_code)
            .bind(&entry.error)
            .bind(&entry.raw_line)
            .execute(&mut *guard)
            .await;
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_busy(&e) => Err(e),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(())
    }

    pub async fn list_log_entries(&self, filter: LogEntryFilter) -> Result<Page<LogEntry>, StoreError> {
        let filter = filter.normalized();
        with_timeout(async {
            let mut sql = String::from("SELECT * FROM log_entries WHERE 1=1");
            let mut count_sql = String::from("SELECT COUNT(*) FROM log_entries WHERE 1=1");
            let mut binds: Vec<String> = Vec::new();

            if let Some(mid) = &filter.message_id {
                sql.push_str(" AND message_id = ?");
                count_sql.push_str(" AND message_id = ?");
                binds.push(mid.as_str().to_string());
            }
            if let Some(contains) = &filter.raw_line_contains {
                sql.push_str(" AND raw_line LIKE ?");
                count_sql.push_str(" AND raw_line LIKE ?");
                binds.push(format!("%{contains}%"));
            }
            if let Some(code) = &filter.smtp_code {
                sql.push_str(" AND smtp_code = ?");
                count_sql.push_str(" AND smtp_code = ?");
                binds.push(code.clone());
            }
            if let Some(host) = &filter.host {
                sql.push_str(" AND host = ?");
                count_sql.push_str(" AND host = ?");
                binds.push(host.clone());
            }
            if !filter.event_types.is_empty() {
                let placeholders = filter.event_types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                sql.push_str(&format!(" AND event_type IN ({placeholders})"));
                count_sql.push_str(&format!(" AND event_type IN ({placeholders})"));
                for et in &filter.event_types {
                    binds.push(et.as_str().to_string());
                }
            }
            sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");

            let mut count_query = sqlx::query(&count_sql);
            for b in &binds {
                count_query = count_query.bind(b);
            }
            let total: i64 = count_query.fetch_one(&self.reader_pool).await?.try_get(0)?;

            let mut query = sqlx::query(&sql);
            for b in &binds {
                query = query.bind(b);
            }
            query = query.bind(filter.limit).bind(filter.offset);
            let rows = query.fetch_all(&self.reader_pool).await?;
            let items = rows.iter().map(row_to_log_entry).collect::<Result<Vec<_>, _>>()?;
            Ok(Page { items, total })
        })
        .await
    }

    // ─── Messages ───────────────────────────────────────────────────────

    /// Insert-or-update a message, enforcing monotonic status transitions
    /// (spec.md §4.5): an update whose `timestamp` is older than the
    /// message's `last_state_change` is rejected rather than applied, and a
    /// terminal status is never overwritten.
    pub async fn upsert_message(
        &self,
        message_id: &MessageId,
        first_seen_at: DateTime<Utc>,
        sender: &str,
        size_bytes: Option<i64>,
        new_status: MessageStatus,
        event_timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        retry_with_backoff(&RetryConfig::default(), || async {
            let mut guard = self.writer.lock().await;
            let mut tx = guard.begin().await?;

            let existing = sqlx::query("SELECT current_status, last_state_change FROM messages WHERE message_id = ?")
                .bind(message_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

            match existing {
                None => {
                    sqlx::query(
                        "INSERT INTO messages (message_id, first_seen_at, sender, size_bytes, current_status, last_state_change)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(message_id.as_str())
                    .bind(first_seen_at.to_rfc3339())
                    .bind(sender)
                    .bind(size_bytes)
                    .bind(new_status.as_str())
                    .bind(event_timestamp.to_rfc3339())
                    .execute(&mut *tx)
                    .await?;
                }
                Some(row) => {
                    let current_status_str: String = row.try_get("current_status")?;
                    let last_change_str: String = row.try_get("last_state_change")?;
                    let current_status = MessageStatus::parse(&current_status_str)
                        .ok_or_else(|| StoreError::InvalidFilter(format!("unknown status {current_status_str}")))?;
                    let last_change = DateTime::parse_from_rfc3339(&last_change_str)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or(event_timestamp);

                    if current_status.is_terminal() {
                        debug!(message_id = %message_id, "ignoring transition into terminal message, already terminal");
                        return Ok(());
                    }
                    if event_timestamp < last_change {
                        warn!(message_id = %message_id, "rejecting out-of-order status update");
                        return Ok(());
                    }
                    sqlx::query(
                        "UPDATE messages SET current_status = ?, last_state_change = ? WHERE message_id = ?",
                    )
                    .bind(new_status.as_str())
                    .bind(event_timestamp.to_rfc3339())
                    .bind(message_id.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM messages WHERE message_id = ?")
                .bind(message_id.as_str())
                .fetch_optional(&self.reader_pool)
                .await?;
            row.map(|r| row_to_message(&r)).transpose()
        })
        .await
    }

    pub async fn list_messages(&self, filter: MessageFilter) -> Result<Page<Message>, StoreError> {
        let filter = filter.normalized();
        with_timeout(async {
            let mut sql = String::from("SELECT * FROM messages WHERE 1=1");
            let mut count_sql = String::from("SELECT COUNT(*) FROM messages WHERE 1=1");
            let mut binds: Vec<String> = Vec::new();

            if let Some(s) = &filter.sender_contains {
                sql.push_str(" AND sender LIKE ?");
                count_sql.push_str(" AND sender LIKE ?");
                binds.push(format!("%{s}%"));
            }
            if let Some(mid) = &filter.message_id {
                sql.push_str(" AND message_id = ?");
                count_sql.push_str(" AND message_id = ?");
                binds.push(mid.as_str().to_string());
            }
            if let Some(r) = &filter.recipient_contains {
                sql.push_str(" AND message_id IN (SELECT message_id FROM recipients WHERE recipient_address LIKE ?)");
                count_sql.push_str(" AND message_id IN (SELECT message_id FROM recipients WHERE recipient_address LIKE ?)");
                binds.push(format!("%{r}%"));
            }
            if !filter.statuses.is_empty() {
                let placeholders = filter.statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                sql.push_str(&format!(" AND current_status IN ({placeholders})"));
                count_sql.push_str(&format!(" AND current_status IN ({placeholders})"));
                for s in &filter.statuses {
                    binds.push(s.as_str().to_string());
                }
            }
            sql.push_str(" ORDER BY first_seen_at DESC LIMIT ? OFFSET ?");

            let mut count_query = sqlx::query(&count_sql);
            for b in &binds {
                count_query = count_query.bind(b);
            }
            let total: i64 = count_query.fetch_one(&self.reader_pool).await?.try_get(0)?;

            let mut query = sqlx::query(&sql);
            for b in &binds {
                query = query.bind(b);
            }
            query = query.bind(filter.limit).bind(filter.offset);
            let rows = query.fetch_all(&self.reader_pool).await?;
            let items = rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
            Ok(Page { items, total })
        })
        .await
    }

    // ─── Recipients ─────────────────────────────────────────────────────

    pub async fn upsert_recipient_pending(
        &self,
        message_id: &MessageId,
        recipient_address: &str,
    ) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().await;
        sqlx::query(
            "INSERT OR IGNORE INTO recipients (message_id, recipient_address, status, attempt_count)
             VALUES (?, ?, 'pending', 0)",
        )
        .bind(message_id.as_str())
        .bind(recipient_address)
        .execute(&mut *guard)
        .await?;
        Ok(())
    }

    pub async fn list_recipients(&self, message_id: &MessageId) -> Result<Vec<Recipient>, StoreError> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM recipients WHERE message_id = ? ORDER BY recipient_address")
                .bind(message_id.as_str())
                .fetch_all(&self.reader_pool)
                .await?;
            rows.iter().map(row_to_recipient).collect()
        })
        .await
    }

    // ─── Delivery attempts ──────────────────────────────────────────────

    /// Record an observed delivery attempt and update the recipient's summary
    /// (status, attempt_count, last_* fields) in the same transaction, so a
    /// reader never sees one without the other. Idempotent on the natural key
    /// `(message_id, recipient, timestamp, status)` (spec.md §9's recommended
    /// dedup key for this table, adopted here as the Open Question decision).
    pub async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError> {
        retry_with_backoff(&RetryConfig::default(), || async {
            let mut guard = self.writer.lock().await;
            let mut tx = guard.begin().await?;

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO delivery_attempts
                 (message_id, recipient_address, timestamp, remote_host, remote_ip, status, smtp_code, error_message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(attempt.message_id.as_str())
            .bind(&attempt.recipient_address)
            .bind(attempt.timestamp.to_rfc3339())
            .bind(&attempt.remote_host)
            .bind(&attempt.remote_ip)
            .bind(attempt.status.as_str())
            .bind(&attempt.smtp_code)
            .bind(&attempt.error_message)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                // Already recorded (e.g. reread after a crash); no-op.
                tx.commit().await?;
                return Ok(());
            }

            let recipient_status = match attempt.status {
                AttemptStatus::Success => RecipientStatus::Delivered,
                AttemptStatus::Bounce => RecipientStatus::Bounced,
                AttemptStatus::Defer | AttemptStatus::Timeout => RecipientStatus::Deferred,
            };

            sqlx::query(
                "UPDATE recipients SET status = ?, attempt_count = attempt_count + 1,
                 last_attempt_at = ?, last_smtp_code = ?, last_error_text = ?
                 WHERE message_id = ? AND recipient_address = ?
                   AND status NOT IN ('delivered', 'bounced')",
            )
            .bind(recipient_status.as_str())
            .bind(attempt.timestamp.to_rfc3339())
            .bind(&attempt.smtp_code)
            .bind(&attempt.error_message)
            .bind(attempt.message_id.as_str())
            .bind(&attempt.recipient_address)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn list_attempts(&self, message_id: &MessageId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        with_timeout(async {
            let rows = sqlx::query(
                "SELECT * FROM delivery_attempts WHERE message_id = ? ORDER BY timestamp ASC",
            )
            .bind(message_id.as_str())
            .fetch_all(&self.reader_pool)
            .await?;
            rows.iter().map(row_to_attempt).collect()
        })
        .await
    }

    // ─── Queue snapshots ────────────────────────────────────────────────

    pub async fn insert_queue_snapshot(&self, snapshot: &QueueSnapshot) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().await;
        sqlx::query(
            "INSERT INTO queue_snapshots (timestamp, total, deferred, frozen, oldest_age_seconds)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(snapshot.total)
        .bind(snapshot.deferred)
        .bind(snapshot.frozen)
        .bind(snapshot.oldest_age_seconds)
        .execute(&mut *guard)
        .await?;
        Ok(())
    }

    pub async fn latest_queue_snapshot(&self) -> Result<Option<QueueSnapshot>, StoreError> {
        with_timeout(async {
            let row = sqlx::query("SELECT * FROM queue_snapshots ORDER BY timestamp DESC LIMIT 1")
                .fetch_optional(&self.reader_pool)
                .await?;
            row.map(|r| row_to_snapshot(&r)).transpose()
        })
        .await
    }

    // ─── Audit entries ──────────────────────────────────────────────────

    /// Record an audit entry. Per spec.md §4.6, exactly one entry is written
    /// per operator action — including failed and bulk operations — so this
    /// is never wrapped in the same transaction as the action it records
    /// (the audit trail must reflect what was attempted, not just what
    /// succeeded).
    pub async fn record_audit_entry(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().await;
        sqlx::query(
            "INSERT INTO audit_entries (timestamp, action, message_id, actor, source_address, details_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.action)
        .bind(entry.message_id.as_ref().map(|m| m.as_str().to_string()))
        .bind(&entry.actor)
        .bind(&entry.source_address)
        .bind(&entry.details_json)
        .execute(&mut *guard)
        .await?;
        Ok(())
    }

    pub async fn list_audit_entries(&self, message_id: Option<&MessageId>, limit: i64, offset: i64) -> Result<Page<AuditEntry>, StoreError> {
        let limit = limit.clamp(1, 200);
        let offset = offset.max(0);
        with_timeout(async {
            let (sql, count_sql): (&str, &str) = if message_id.is_some() {
                (
                    "SELECT * FROM audit_entries WHERE message_id = ? ORDER BY timestamp DESC LIMIT ? OFFSET ?",
                    "SELECT COUNT(*) FROM audit_entries WHERE message_id = ?",
                )
            } else {
                (
                    "SELECT * FROM audit_entries ORDER BY timestamp DESC LIMIT ? OFFSET ?",
                    "SELECT COUNT(*) FROM audit_entries",
                )
            };

            let total: i64 = if let Some(mid) = message_id {
                sqlx::query(count_sql).bind(mid.as_str()).fetch_one(&self.reader_pool).await?.try_get(0)?
            } else {
                sqlx::query(count_sql).fetch_one(&self.reader_pool).await?.try_get(0)?
            };

            let rows = if let Some(mid) = message_id {
                sqlx::query(sql).bind(mid.as_str()).bind(limit).bind(offset).fetch_all(&self.reader_pool).await?
            } else {
                sqlx::query(sql).bind(limit).bind(offset).fetch_all(&self.reader_pool).await?
            };
            let items = rows.iter().map(row_to_audit).collect::<Result<Vec<_>, _>>()?;
            Ok(Page { items, total })
        })
        .await
    }

    // ─── Notes & tags ───────────────────────────────────────────────────

    pub async fn add_note(
        &self,
        message_id: &MessageId,
        author: &str,
        text: &str,
        visibility: Visibility,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut guard = self.writer.lock().await;
        let result = sqlx::query(
            "INSERT INTO notes (message_id, author, text, visibility, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.as_str())
        .bind(author)
        .bind(text)
        .bind(visibility.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *guard)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_notes(&self, message_id: &MessageId) -> Result<Vec<Note>, StoreError> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM notes WHERE message_id = ? ORDER BY created_at ASC")
                .bind(message_id.as_str())
                .fetch_all(&self.reader_pool)
                .await?;
            rows.iter().map(row_to_note).collect()
        })
        .await
    }

    pub async fn add_tag(&self, message_id: &MessageId, author: &str, tag: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut guard = self.writer.lock().await;
        sqlx::query("INSERT OR IGNORE INTO tags (message_id, author, tag, created_at) VALUES (?, ?, ?, ?)")
            .bind(message_id.as_str())
            .bind(author)
            .bind(tag)
            .bind(&now)
            .execute(&mut *guard)
            .await?;
        Ok(())
    }

    pub async fn list_tags(&self, message_id: &MessageId) -> Result<Vec<Tag>, StoreError> {
        with_timeout(async {
            let rows = sqlx::query("SELECT * FROM tags WHERE message_id = ? ORDER BY created_at ASC")
                .bind(message_id.as_str())
                .fetch_all(&self.reader_pool)
                .await?;
            rows.iter().map(row_to_tag).collect()
        })
        .await
    }

    /// Edit a note's text. Notes are mutable by their author only (spec.md
    /// §3.1 "mutable by author within message lifetime"); returns `false`
    /// without writing anything if `note_id` doesn't exist or belongs to a
    /// different author.
    pub async fn update_note(&self, note_id: i64, author: &str, text: &str) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut guard = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE notes SET text = ?, updated_at = ? WHERE id = ? AND author = ?",
        )
        .bind(text)
        .bind(&now)
        .bind(note_id)
        .bind(author)
        .execute(&mut *guard)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a note. Same author-ownership rule as [`Self::update_note`].
    pub async fn delete_note(&self, note_id: i64, author: &str) -> Result<bool, StoreError> {
        let mut guard = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM notes WHERE id = ? AND author = ?")
            .bind(note_id)
            .bind(author)
            .execute(&mut *guard)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a tag. Tags carry no separate edit operation (spec.md §3.1
    /// lists them as add/remove only), so there is no `update_tag`.
    pub async fn delete_tag(&self, message_id: &MessageId, tag: &str) -> Result<bool, StoreError> {
        let mut guard = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM tags WHERE message_id = ? AND tag = ?")
            .bind(message_id.as_str())
            .bind(tag)
            .execute(&mut *guard)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ─── Retention & maintenance ────────────────────────────────────────

    /// Delete rows older than the configured retention windows. Returns the
    /// number of rows removed per table, for logging.
    pub async fn apply_retention(&self, config: &RetentionConfig) -> Result<RetentionResult, StoreError> {
        let now = Utc::now();
        let mut guard = self.writer.lock().await;

        let log_cutoff = (now - chrono::Duration::days(config.log_entries_days)).to_rfc3339();
        let log_entries = sqlx::query("DELETE FROM log_entries WHERE timestamp < ?")
            .bind(&log_cutoff)
            .execute(&mut *guard)
            .await?
            .rows_affected();

        let attempt_cutoff = (now - chrono::Duration::days(config.delivery_attempts_days)).to_rfc3339();
        let delivery_attempts = sqlx::query("DELETE FROM delivery_attempts WHERE timestamp < ?")
            .bind(&attempt_cutoff)
            .execute(&mut *guard)
            .await?
            .rows_affected();

        let audit_cutoff = (now - chrono::Duration::days(config.audit_entries_days)).to_rfc3339();
        let audit_entries = sqlx::query("DELETE FROM audit_entries WHERE timestamp < ?")
            .bind(&audit_cutoff)
            .execute(&mut *guard)
            .await?
            .rows_affected();

        let snapshot_cutoff = (now - chrono::Duration::days(config.queue_snapshots_days)).to_rfc3339();
        let queue_snapshots = sqlx::query("DELETE FROM queue_snapshots WHERE timestamp < ?")
            .bind(&snapshot_cutoff)
            .execute(&mut *guard)
            .await?
            .rows_affected();

        Ok(RetentionResult { log_entries, delivery_attempts, audit_entries, queue_snapshots })
    }

    pub async fn vacuum(&self) -> Result<(), StoreError> {
        let mut guard = self.writer.lock().await;
        sqlx::query("VACUUM").execute(&mut *guard).await?;
        Ok(())
    }

    /// Cheap liveness probe for [`crate::health::checks::DatabaseHealthCheck`].
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.reader_pool).await?;
        Ok(())
    }

    /// Expose the reader pool for health checks that need a raw `SqlitePool`.
    pub fn reader_pool(&self) -> SqlitePool {
        self.reader_pool.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionResult {
    pub log_entries: u64,
    pub delivery_attempts: u64,
    pub audit_entries: u64,
    pub queue_snapshots: u64,
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, StoreError> {
    let message_id: String = row.try_get("message_id")?;
    let first_seen_at: String = row.try_get("first_seen_at")?;
    let status: String = row.try_get("current_status")?;
    let last_state_change: String = row.try_get("last_state_change")?;
    Ok(Message {
        message_id: MessageId(message_id),
        first_seen_at: parse_dt(&first_seen_at)?,
        sender: row.try_get("sender")?,
        size_bytes: row.try_get("size_bytes")?,
        current_status: MessageStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidFilter(format!("unknown status {status}")))?,
        last_state_change: parse_dt(&last_state_change)?,
    })
}

fn row_to_recipient(row: &sqlx::sqlite::SqliteRow) -> Result<Recipient, StoreError> {
    let message_id: String = row.try_get("message_id")?;
    let status: String = row.try_get("status")?;
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;
    Ok(Recipient {
        message_id: MessageId(message_id),
        recipient_address: row.try_get("recipient_address")?,
        status: RecipientStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidFilter(format!("unknown status {status}")))?,
        attempt_count: row.try_get("attempt_count")?,
        last_attempt_at: last_attempt_at.map(|s| parse_dt(&s)).transpose()?,
        next_retry_at: next_retry_at.map(|s| parse_dt(&s)).transpose()?,
        last_smtp_code: row.try_get("last_smtp_code")?,
        last_error_text: row.try_get("last_error_text")?,
    })
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> Result<DeliveryAttempt, StoreError> {
    let message_id: String = row.try_get("message_id")?;
    let timestamp: String = row.try_get("timestamp")?;
    let status: String = row.try_get("status")?;
    Ok(DeliveryAttempt {
        message_id: MessageId(message_id),
        recipient_address: row.try_get("recipient_address")?,
        timestamp: parse_dt(&timestamp)?,
        remote_host: row.try_get("remote_host")?,
        remote_ip: row.try_get("remote_ip")?,
        status: AttemptStatus::parse(&status)
            .ok_or_else(|| StoreError::InvalidFilter(format!("unknown status {status}")))?,
        smtp_code: row.try_get("smtp_code")?,
        error_message: row.try_get("error_message")?,
    })
}

fn row_to_log_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry, StoreError> {
    let timestamp: String = row.try_get("timestamp")?;
    let log_source: String = row.try_get("log_source")?;
    let event_type: String = row.try_get("event_type")?;
    let message_id: Option<String> = row.try_get("message_id")?;
    Ok(LogEntry {
        timestamp: parse_dt(&timestamp)?,
        log_source: LogSource::parse(&log_source)
            .ok_or_else(|| StoreError::InvalidFilter(format!("unknown log_source {log_source}")))?,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| StoreError::InvalidFilter(format!("unknown event_type {event_type}")))?,
        message_id: message_id.map(MessageId),
        sender: row.try_get("sender")?,
        recipients: row.try_get("recipients")?,
        host: row.try_get("host")?,
        smtp_code: row.try_get("smtp_code")?,
        error: row.try_get("error")?,
        raw_line: row.try_get("raw_line")?,
    })
}

fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<QueueSnapshot, StoreError> {
    let timestamp: String = row.try_get("timestamp")?;
    Ok(QueueSnapshot {
        timestamp: parse_dt(&timestamp)?,
        total: row.try_get("total")?,
        deferred: row.try_get("deferred")?,
        frozen: row.try_get("frozen")?,
        oldest_age_seconds: row.try_get("oldest_age_seconds")?,
    })
}

fn row_to_audit(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, StoreError> {
    let timestamp: String = row.try_get("timestamp")?;
    let message_id: Option<String> = row.try_get("message_id")?;
    Ok(AuditEntry {
        timestamp: parse_dt(&timestamp)?,
        action: row.try_get("action")?,
        message_id: message_id.map(MessageId),
        actor: row.try_get("actor")?,
        source_address: row.try_get("source_address")?,
        details_json: row.try_get("details_json")?,
    })
}

fn row_to_note(row: &sqlx::sqlite::SqliteRow) -> Result<Note, StoreError> {
    let message_id: String = row.try_get("message_id")?;
    let visibility: String = row.try_get("visibility")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Note {
        id: row.try_get("id")?,
        message_id: MessageId(message_id),
        author: row.try_get("author")?,
        text: row.try_get("text")?,
        visibility: Visibility::parse(&visibility)
            .ok_or_else(|| StoreError::InvalidFilter(format!("unknown visibility {visibility}")))?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_tag(row: &sqlx::sqlite::SqliteRow) -> Result<Tag, StoreError> {
    let message_id: String = row.try_get("message_id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Tag {
        id: row.try_get("id")?,
        message_id: MessageId(message_id),
        author: row.try_get("author")?,
        tag: row.try_get("tag")?,
        created_at: parse_dt(&created_at)?,
    })
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidFilter(format!("bad timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("queuewatch.db");
        let storage = Storage::connect(&db_path, 4).await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn insert_and_fetch_message() {
        let (storage, _dir) = test_storage().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        let now = Utc::now();
        storage
            .upsert_message(&mid, now, "sender@example.com", Some(1024), MessageStatus::Received, now)
            .await
            .unwrap();

        let fetched = storage.get_message(&mid).await.unwrap().unwrap();
        assert_eq!(fetched.sender, "sender@example.com");
        assert_eq!(fetched.current_status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn out_of_order_status_update_is_rejected() {
        let (storage, _dir) = test_storage().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        storage.upsert_message(&mid, t0, "s@x", None, MessageStatus::Queued, t1).await.unwrap();
        // Stale event claiming "received" arrives after the newer "queued" one.
        storage.upsert_message(&mid, t0, "s@x", None, MessageStatus::Received, t0).await.unwrap();

        let fetched = storage.get_message(&mid).await.unwrap().unwrap();
        assert_eq!(fetched.current_status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let (storage, _dir) = test_storage().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        storage.upsert_message(&mid, t0, "s@x", None, MessageStatus::Delivered, t0).await.unwrap();
        storage.upsert_message(&mid, t0, "s@x", None, MessageStatus::Deferred, t1).await.unwrap();

        let fetched = storage.get_message(&mid).await.unwrap().unwrap();
        assert_eq!(fetched.current_status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn duplicate_log_entry_insert_is_idempotent() {
        let (storage, _dir) = test_storage().await;
        let entry = LogEntry {
            timestamp: Utc::now(),
            log_source: LogSource::Main,
            event_type: EventType::Received,
            message_id: Some(MessageId::parse("1hKj4x-0008Oi-3r").unwrap()),
            sender: Some("s@x".to_string()),
            recipients: None,
            host: None,
            smtp_code: None,
            error: None,
            raw_line: "2024-01-01 08:15:00 1hKj4x-0008Oi-3r <= s@x".to_string(),
        };
        storage.create_log_entry(&entry).await.unwrap();
        storage.create_log_entry(&entry).await.unwrap();

        let page = storage
            .list_log_entries(LogEntryFilter { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn record_attempt_updates_recipient_summary() {
        let (storage, _dir) = test_storage().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        storage.upsert_message(&mid, Utc::now(), "s@x", None, MessageStatus::Queued, Utc::now()).await.unwrap();
        storage.upsert_recipient_pending(&mid, "r@y").await.unwrap();

        let attempt = DeliveryAttempt {
            message_id: mid.clone(),
            recipient_address: "r@y".to_string(),
            timestamp: Utc::now(),
            remote_host: Some("mx.y".to_string()),
            remote_ip: Some("192.0.2.1".to_string()),
            status: AttemptStatus::Success,
            smtp_code: Some("250".to_string()),
            error_message: None,
        };
        storage.record_attempt(&attempt).await.unwrap();

        let recipients = storage.list_recipients(&mid).await.unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].status, RecipientStatus::Delivered);
        assert_eq!(recipients[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn notes_and_tags_crud() {
        let (storage, _dir) = test_storage().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        storage.upsert_message(&mid, Utc::now(), "s@x", None, MessageStatus::Queued, Utc::now()).await.unwrap();

        let note_id = storage.add_note(&mid, "alice", "first note", Visibility::Private).await.unwrap();
        assert!(!storage.update_note(note_id, "bob", "hijacked").await.unwrap());
        assert!(storage.update_note(note_id, "alice", "edited note").await.unwrap());
        let notes = storage.list_notes(&mid).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].text, "edited note");

        assert!(!storage.delete_note(note_id, "bob").await.unwrap());
        assert!(storage.delete_note(note_id, "alice").await.unwrap());
        assert!(storage.list_notes(&mid).await.unwrap().is_empty());

        storage.add_tag(&mid, "alice", "vip").await.unwrap();
        assert_eq!(storage.list_tags(&mid).await.unwrap().len(), 1);
        assert!(storage.delete_tag(&mid, "vip").await.unwrap());
        assert!(!storage.delete_tag(&mid, "vip").await.unwrap());
        assert!(storage.list_tags(&mid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_deletes_old_rows_only() {
        let (storage, _dir) = test_storage().await;
        let old_entry = LogEntry {
            timestamp: Utc::now() - chrono::Duration::days(400),
            log_source: LogSource::Main,
            event_type: EventType::Unknown,
            message_id: None,
            sender: None,
            recipients: None,
            host: None,
            smtp_code: None,
            error: None,
            raw_line: "ancient line".to_string(),
        };
        let recent_entry = LogEntry { raw_line: "recent line".to_string(), timestamp: Utc::now(), ..old_entry.clone() };
        storage.create_log_entry(&old_entry).await.unwrap();
        storage.create_log_entry(&recent_entry).await.unwrap();

        let result = storage.apply_retention(&RetentionConfig::default()).await.unwrap();
        assert_eq!(result.log_entries, 1);

        let page = storage.list_log_entries(LogEntryFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].raw_line, "recent line");
    }
}
