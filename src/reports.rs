// SPDX-License-Identifier: MIT
//! Reporting queries (spec.md §6.2 "Reports"): a handful of parameterized
//! aggregate views over the Store, grounded on the same multi-query
//! aggregate pattern the daemon's task storage uses for its summary
//! endpoint, but returning typed structs instead of a loose JSON blob.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::store::Storage;

/// A half-open `[from, to)` time range shared by every report query.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Message volume received/delivered/bounced/deferred within a [`TimeRange`]
/// (spec.md §6.2 `VolumeReport`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct VolumeReport {
    pub range: (DateTime<Utc>, DateTime<Utc>),
    pub received: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub deferred: i64,
    pub frozen: i64,
}

/// Overall delivery success rate within a [`TimeRange`] (spec.md §6.2
/// `DeliverabilityReport`). `rate` is `None` when no message in the range
/// reached a terminal state yet.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliverabilityReport {
    pub range: (DateTime<Utc>, DateTime<Utc>),
    pub delivered: i64,
    pub bounced: i64,
    pub rate: Option<f64>,
}

/// One bucket in a [`FailureReport`]: an SMTP code seen on bounced/rejected
/// delivery attempts, with how many times it occurred.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailureBucket {
    pub smtp_code: String,
    pub count: i64,
}

/// Breakdown of failures by SMTP code within a [`TimeRange`] (spec.md §6.2
/// `FailureReport`), most frequent first.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailureReport {
    pub range: (DateTime<Utc>, DateTime<Utc>),
    pub buckets: Vec<FailureBucket>,
}

async fn count_messages_by_status(pool: &SqlitePool, range: TimeRange, status: &str) -> Result<i64, StoreError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM messages WHERE current_status = ? AND first_seen_at >= ? AND first_seen_at < ?",
    )
    .bind(status)
    .bind(range.from.to_rfc3339())
    .bind(range.to.to_rfc3339())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Build a [`VolumeReport`] for `range`.
pub async fn volume_report(store: &Storage, range: TimeRange) -> Result<VolumeReport, StoreError> {
    let pool = store.reader_pool();
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM messages WHERE first_seen_at >= ? AND first_seen_at < ?",
    )
    .bind(range.from.to_rfc3339())
    .bind(range.to.to_rfc3339())
    .fetch_one(&pool)
    .await?;
    let delivered = count_messages_by_status(&pool, range, "delivered").await?;
    let bounced = count_messages_by_status(&pool, range, "bounced").await?;
    let deferred = count_messages_by_status(&pool, range, "deferred").await?;
    let frozen = count_messages_by_status(&pool, range, "frozen").await?;

    Ok(VolumeReport { range: (range.from, range.to), received: total, delivered, bounced, deferred, frozen })
}

/// Build a [`DeliverabilityReport`] for `range`.
pub async fn deliverability_report(store: &Storage, range: TimeRange) -> Result<DeliverabilityReport, StoreError> {
    let pool = store.reader_pool();
    let delivered = count_messages_by_status(&pool, range, "delivered").await?;
    let bounced = count_messages_by_status(&pool, range, "bounced").await?;
    let terminal = delivered + bounced;
    let rate = if terminal > 0 { Some(delivered as f64 / terminal as f64) } else { None };

    Ok(DeliverabilityReport { range: (range.from, range.to), delivered, bounced, rate })
}

/// Build a [`FailureReport`] for `range`, grouping `delivery_attempts` rows
/// with a non-success status by their SMTP code.
pub async fn failure_report(store: &Storage, range: TimeRange) -> Result<FailureReport, StoreError> {
    let pool = store.reader_pool();
    let rows: Vec<(Option<String>, i64)> = sqlx::query_as(
        "SELECT smtp_code, COUNT(*) FROM delivery_attempts
         WHERE status != 'success' AND timestamp >= ? AND timestamp < ?
         GROUP BY smtp_code ORDER BY COUNT(*) DESC",
    )
    .bind(range.from.to_rfc3339())
    .bind(range.to.to_rfc3339())
    .fetch_all(&pool)
    .await?;

    let buckets = rows
        .into_iter()
        .map(|(code, count)| FailureBucket { smtp_code: code.unwrap_or_else(|| "unknown".to_string()), count })
        .collect();

    Ok(FailureReport { range: (range.from, range.to), buckets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttemptStatus, DeliveryAttempt, MessageId, MessageStatus};

    async fn test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::connect(&dir.path().join("q.db"), 4).await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn volume_report_counts_by_status() {
        let (storage, _dir) = test_storage().await;
        let now = Utc::now();
        let range = TimeRange { from: now - chrono::Duration::hours(1), to: now + chrono::Duration::hours(1) };

        let delivered_id = MessageId::parse("1AAA-000001-AB").unwrap();
        let bounced_id = MessageId::parse("1BBB-000002-CD").unwrap();
        storage.upsert_message(&delivered_id, now, "s@x", None, MessageStatus::Delivered, now).await.unwrap();
        storage.upsert_message(&bounced_id, now, "s@x", None, MessageStatus::Bounced, now).await.unwrap();

        let report = volume_report(&storage, range).await.unwrap();
        assert_eq!(report.received, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.bounced, 1);
    }

    #[tokio::test]
    async fn deliverability_rate_is_none_with_no_terminal_messages() {
        let (storage, _dir) = test_storage().await;
        let now = Utc::now();
        let range = TimeRange { from: now - chrono::Duration::hours(1), to: now + chrono::Duration::hours(1) };
        let report = deliverability_report(&storage, range).await.unwrap();
        assert_eq!(report.rate, None);
    }

    #[tokio::test]
    async fn failure_report_groups_by_smtp_code() {
        let (storage, _dir) = test_storage().await;
        let now = Utc::now();
        let mid = MessageId::parse("1CCC-000003-EF").unwrap();
        storage.upsert_message(&mid, now, "s@x", None, MessageStatus::Queued, now).await.unwrap();

        for (recipient, code) in [("a@x", "550"), ("b@x", "550"), ("c@x", "421")] {
            storage
                .record_attempt(&DeliveryAttempt {
                    message_id: mid.clone(),
                    recipient_address: recipient.to_string(),
                    timestamp: now,
                    remote_host: Some("mx.x".to_string()),
                    remote_ip: None,
                    status: AttemptStatus::Bounce,
                    smtp_code: Some(code.to_string()),
                    error_message: None,
                })
                .await
                .unwrap();
        }

        let range = TimeRange { from: now - chrono::Duration::hours(1), to: now + chrono::Duration::hours(1) };
        let report = failure_report(&storage, range).await.unwrap();
        assert_eq!(report.buckets[0].smtp_code, "550");
        assert_eq!(report.buckets[0].count, 2);
    }
}
