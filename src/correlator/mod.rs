// SPDX-License-Identifier: MIT
//! Correlator (C5): applies parsed events to the Store's state machines in
//! timestamp order and offers read-mostly derived views (timelines, retry
//! schedules, incident windows). Holds no long-lived in-memory graph — every
//! query re-reads from the Store (spec.md §9 "Cyclic references").

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::*;
use crate::parser::LogEvent;
use crate::store::Storage;

/// Applies one parsed [`LogEvent`] to the message/recipient state machines.
/// This is the only place outside the Queue Controller that mutates message
/// state — log-derived transitions and operator actions both flow through
/// the Store's monotonic-transition guard, so ordering races resolve the
/// same way regardless of source.
pub struct Correlator {
    pub(crate) store: Storage,
}

impl Correlator {
    pub fn new(store: Storage) -> Self {
        Self { store }
    }

    pub async fn apply(&self, event: &LogEvent) -> Result<(), StoreError> {
        match event {
            LogEvent::Received { timestamp, message_id, sender, size_bytes, .. } => {
                self.store
                    .upsert_message(message_id, *timestamp, sender, *size_bytes, MessageStatus::Received, *timestamp)
                    .await?;
            }
            LogEvent::DeliveryAttempt { timestamp, message_id, recipient, host, ip, smtp_code, status, error } => {
                self.store.upsert_recipient_pending(message_id, recipient).await?;
                let attempt = DeliveryAttempt {
                    message_id: message_id.clone(),
                    recipient_address: recipient.clone(),
                    timestamp: *timestamp,
                    remote_host: host.clone(),
                    remote_ip: ip.clone(),
                    status: *status,
                    smtp_code: smtp_code.clone(),
                    error_message: error.clone(),
                };
                self.store.record_attempt(&attempt).await?;

                let recipients = self.store.list_recipients(message_id).await?;
                let aggregate = aggregate_status(&recipients);
                if let Some(aggregate) = aggregate {
                    if let Some(message) = self.store.get_message(message_id).await? {
                        self.store
                            .upsert_message(message_id, message.first_seen_at, &message.sender, message.size_bytes, aggregate, *timestamp)
                            .await?;
                    }
                }
            }
            LogEvent::QueueOp { timestamp, message_id, action } => {
                let status = match action {
                    QueueAction::Freeze => Some(MessageStatus::Frozen),
                    QueueAction::Thaw => Some(MessageStatus::Queued),
                    QueueAction::Delete => Some(MessageStatus::Deleted),
                    QueueAction::Deliver => None, // a delivery attempt follows separately
                };
                if let (Some(status), Some(message)) = (status, self.store.get_message(message_id).await?) {
                    self.store
                        .upsert_message(message_id, message.first_seen_at, &message.sender, message.size_bytes, status, *timestamp)
                        .await?;
                }
            }
            LogEvent::Rejected { reason, .. } => {
                debug!(%reason, "rejected line has no message id to correlate against");
            }
            LogEvent::Panic { text, .. } => {
                warn!(%text, "MTA panic log entry observed");
            }
            LogEvent::Unknown { .. } => {}
        }
        Ok(())
    }

    /// Timeline of everything known about one message, grouped by recipient
    /// (spec.md §4.5 "Threaded timeline").
    pub async fn timeline(&self, message_id: &MessageId) -> Result<Timeline, StoreError> {
        let message = self.store.get_message(message_id).await?;
        let recipients = self.store.list_recipients(message_id).await?;
        let attempts = self.store.list_attempts(message_id).await?;

        let groups = recipients
            .into_iter()
            .map(|recipient| {
                let recipient_attempts: Vec<DeliveryAttempt> = attempts
                    .iter()
                    .filter(|a| a.recipient_address == recipient.recipient_address)
                    .cloned()
                    .collect();
                RecipientTimeline { recipient, attempts: recipient_attempts }
            })
            .collect();

        Ok(Timeline { message, recipients: groups })
    }

    /// The full threaded view the operator UI renders for one message
    /// (spec.md §4.5 "Threaded timeline" / §6.2 `DeliveryTrace`): the
    /// per-recipient timeline from [`Self::timeline`], plus the matching
    /// `log_entries` thread per remote host and a catch-all "system" thread
    /// for entries that never named a recipient (panics, rejects without a
    /// resolvable message id).
    pub async fn delivery_trace(&self, message_id: &MessageId) -> Result<DeliveryTrace, StoreError> {
        let timeline = self.timeline(message_id).await?;
        let retry_schedule = self.retry_schedule(message_id).await?;

        let entries = self
            .store
            .list_log_entries(crate::store::LogEntryFilter {
                message_id: Some(message_id.clone()),
                limit: 200,
                ..Default::default()
            })
            .await?
            .items;

        let mut by_host: std::collections::BTreeMap<String, Vec<LogEntry>> = std::collections::BTreeMap::new();
        let mut system: Vec<LogEntry> = Vec::new();
        for entry in entries {
            match &entry.host {
                Some(host) => by_host.entry(host.clone()).or_default().push(entry),
                None => system.push(entry),
            }
        }
        let host_threads = by_host
            .into_iter()
            .map(|(host, entries)| HostThread { host, entries })
            .collect();

        Ok(DeliveryTrace { timeline, retry_schedule, host_threads, system_entries: system })
    }

    /// Pending retries, derived from recipients in `deferred` status. Exim's
    /// actual next-retry time depends on its retry config which this crate
    /// does not parse, so `estimated` is always `true` here (spec.md §4.5
    /// "Retry schedule view").
    pub async fn retry_schedule(&self, message_id: &MessageId) -> Result<Vec<RetryEstimate>, StoreError> {
        let recipients = self.store.list_recipients(message_id).await?;
        Ok(recipients
            .into_iter()
            .filter(|r| r.status == RecipientStatus::Deferred)
            .map(|r| RetryEstimate {
                recipient_address: r.recipient_address,
                last_attempt_at: r.last_attempt_at,
                next_retry_at: r.next_retry_at,
                estimated: true,
            })
            .collect())
    }

    /// Other log entries that plausibly share a cause with `message_id`'s
    /// most recent delivery attempt: same remote host, same SMTP-code class
    /// (2xx/4xx/5xx), within `window` of that attempt's timestamp (spec.md
    /// §4.5 "Correlated incidents"). Returns an empty list if the message has
    /// no delivery attempt with both a host and an SMTP code recorded yet.
    pub async fn correlated_incidents(
        &self,
        message_id: &MessageId,
        window: ChronoDuration,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let attempts = self.store.list_attempts(message_id).await?;
        let Some(latest) = attempts
            .iter()
            .filter(|a| a.remote_host.is_some() && a.smtp_code.is_some())
            .max_by_key(|a| a.timestamp)
        else {
            return Ok(Vec::new());
        };
        let host = latest.remote_host.clone().expect("filtered for Some above");
        let class = smtp_code_class(latest.smtp_code.as_deref().expect("filtered for Some above"));

        let filter = crate::store::LogEntryFilter {
            host: Some(host),
            event_types: vec![EventType::DeliveryAttempt, EventType::Rejected],
            limit: 200,
            ..Default::default()
        };
        let page = self.store.list_log_entries(filter).await?;
        let lo = latest.timestamp - window;
        let hi = latest.timestamp + window;
        Ok(page
            .items
            .into_iter()
            .filter(|e| e.message_id.as_ref() != Some(message_id))
            .filter(|e| e.timestamp >= lo && e.timestamp <= hi)
            .filter(|e| e.smtp_code.as_deref().map(smtp_code_class) == Some(class))
            .collect())
    }
}

/// Default sliding window for [`Correlator::correlated_incidents`] (spec.md
/// §4.5: "default 15 min").
pub const DEFAULT_INCIDENT_WINDOW_MINUTES: i64 = 15;

/// First digit of an SMTP reply code, e.g. `"550"` -> `'5'`. Malformed codes
/// fall back to `'0'`, which never matches a real class.
fn smtp_code_class(code: &str) -> char {
    code.chars().next().unwrap_or('0')
}

#[derive(Debug, Clone)]
pub struct Timeline {
    pub message: Option<Message>,
    pub recipients: Vec<RecipientTimeline>,
}

#[derive(Debug, Clone)]
pub struct RecipientTimeline {
    pub recipient: Recipient,
    pub attempts: Vec<DeliveryAttempt>,
}

/// Combined view backing spec.md §6.2's `InspectMessage`/`DeliveryTrace`:
/// the per-recipient timeline plus the raw log threads grouped by remote
/// host, with entries that never named a host (panics, pre-handshake
/// rejects) collected into `system_entries`.
#[derive(Debug, Clone)]
pub struct DeliveryTrace {
    pub timeline: Timeline,
    pub retry_schedule: Vec<RetryEstimate>,
    pub host_threads: Vec<HostThread>,
    pub system_entries: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct HostThread {
    pub host: String,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct RetryEstimate {
    pub recipient_address: String,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub estimated: bool,
}

/// Aggregate status rules (spec.md §4.5):
/// - all recipients delivered => Delivered
/// - all recipients in a terminal state (delivered/bounced), at least one bounced => Bounced
/// - any recipient pending or deferred, none bounced => Queued/Deferred depending on mix
/// - no recipients yet => None (caller keeps existing status, e.g. Received)
fn aggregate_status(recipients: &[Recipient]) -> Option<MessageStatus> {
    if recipients.is_empty() {
        return None;
    }
    let all_terminal = recipients.iter().all(|r| r.status.is_terminal());
    let any_bounced = recipients.iter().any(|r| r.status == RecipientStatus::Bounced);
    let any_deferred = recipients.iter().any(|r| r.status == RecipientStatus::Deferred);

    if all_terminal {
        return Some(if any_bounced { MessageStatus::Bounced } else { MessageStatus::Delivered });
    }
    if any_deferred {
        return Some(MessageStatus::Deferred);
    }
    Some(MessageStatus::Queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_correlator() -> (Correlator, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::connect(&dir.path().join("q.db"), 4).await.unwrap();
        (Correlator::new(storage), dir)
    }

    #[tokio::test]
    async fn basic_delivery_end_to_end() {
        let (correlator, _dir) = test_correlator().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        let t0 = Utc::now();

        correlator
            .apply(&LogEvent::Received {
                timestamp: t0,
                message_id: mid.clone(),
                sender: "sender@example.com".to_string(),
                size_bytes: Some(2048),
                host: None,
            })
            .await
            .unwrap();

        correlator
            .apply(&LogEvent::DeliveryAttempt {
                timestamp: t0 + ChronoDuration::seconds(5),
                message_id: mid.clone(),
                recipient: "r@example.com".to_string(),
                host: Some("mx.example.com".to_string()),
                ip: Some("192.0.2.1".to_string()),
                smtp_code: Some("250".to_string()),
                status: AttemptStatus::Success,
                error: None,
            })
            .await
            .unwrap();

        let timeline = correlator.timeline(&mid).await.unwrap();
        assert_eq!(timeline.message.unwrap().current_status, MessageStatus::Delivered);
        assert_eq!(timeline.recipients[0].recipient.status, RecipientStatus::Delivered);
    }

    #[tokio::test]
    async fn defer_then_bounce_aggregates_to_bounced() {
        let (correlator, _dir) = test_correlator().await;
        let mid = MessageId::parse("1AAA-000001-AB").unwrap();
        let t0 = Utc::now();

        correlator
            .apply(&LogEvent::Received { timestamp: t0, message_id: mid.clone(), sender: "s@x".to_string(), size_bytes: None, host: None })
            .await
            .unwrap();
        correlator
            .apply(&LogEvent::DeliveryAttempt {
                timestamp: t0 + ChronoDuration::minutes(1),
                message_id: mid.clone(),
                recipient: "r@x".to_string(),
                host: None,
                ip: None,
                smtp_code: Some("451".to_string()),
                status: AttemptStatus::Defer,
                error: None,
            })
            .await
            .unwrap();

        let mid_snapshot = correlator.store.get_message(&mid).await.unwrap().unwrap();
        assert_eq!(mid_snapshot.current_status, MessageStatus::Deferred);

        correlator
            .apply(&LogEvent::DeliveryAttempt {
                timestamp: t0 + ChronoDuration::minutes(30),
                message_id: mid.clone(),
                recipient: "r@x".to_string(),
                host: None,
                ip: None,
                smtp_code: Some("550".to_string()),
                status: AttemptStatus::Bounce,
                error: Some("mailbox unavailable".to_string()),
            })
            .await
            .unwrap();

        let timeline = correlator.timeline(&mid).await.unwrap();
        assert_eq!(timeline.message.unwrap().current_status, MessageStatus::Bounced);
    }

    #[tokio::test]
    async fn queue_op_freeze_and_thaw() {
        let (correlator, _dir) = test_correlator().await;
        let mid = MessageId::parse("1BBB-000002-CD").unwrap();
        let t0 = Utc::now();
        correlator
            .apply(&LogEvent::Received { timestamp: t0, message_id: mid.clone(), sender: "s@x".to_string(), size_bytes: None, host: None })
            .await
            .unwrap();
        correlator
            .apply(&LogEvent::QueueOp { timestamp: t0 + ChronoDuration::seconds(1), message_id: mid.clone(), action: QueueAction::Freeze })
            .await
            .unwrap();

        let message = correlator.store.get_message(&mid).await.unwrap().unwrap();
        assert_eq!(message.current_status, MessageStatus::Frozen);

        correlator
            .apply(&LogEvent::QueueOp { timestamp: t0 + ChronoDuration::seconds(2), message_id: mid.clone(), action: QueueAction::Thaw })
            .await
            .unwrap();
        let message = correlator.store.get_message(&mid).await.unwrap().unwrap();
        assert_eq!(message.current_status, MessageStatus::Queued);
    }

    /// Applies a DeliveryAttempt event through the correlator (state machine)
    /// and writes the matching `log_entries` row, mirroring what
    /// `process_line` does for a live-tailed line — `Correlator::apply`
    /// alone never touches `log_entries`.
    async fn apply_attempt_with_log(
        correlator: &Correlator,
        timestamp: DateTime<Utc>,
        message_id: &MessageId,
        recipient: &str,
        host: Option<&str>,
        smtp_code: &str,
        status: AttemptStatus,
    ) {
        let event = LogEvent::DeliveryAttempt {
            timestamp,
            message_id: message_id.clone(),
            recipient: recipient.to_string(),
            host: host.map(str::to_string),
            ip: None,
            smtp_code: Some(smtp_code.to_string()),
            status,
            error: Some("rejected".to_string()),
        };
        correlator.apply(&event).await.unwrap();
        correlator
            .store
            .create_log_entry(&LogEntry {
                timestamp,
                log_source: LogSource::Main,
                event_type: EventType::DeliveryAttempt,
                message_id: Some(message_id.clone()),
                sender: None,
                recipients: Some(recipient.to_string()),
                host: host.map(str::to_string),
                smtp_code: Some(smtp_code.to_string()),
                error: Some("rejected".to_string()),
                raw_line: format!("attempt {message_id} {recipient}"),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn correlated_incidents_groups_by_host_and_code_class() {
        let (correlator, _dir) = test_correlator().await;
        let t0 = Utc::now();

        let target = MessageId::parse("1CCC-000003-EF").unwrap();
        let sibling = MessageId::parse("1DDD-000004-GH").unwrap();
        let other_host = MessageId::parse("1EEE-000005-IJ").unwrap();

        for mid in [&target, &sibling, &other_host] {
            correlator
                .apply(&LogEvent::Received { timestamp: t0, message_id: mid.clone(), sender: "s@x".to_string(), size_bytes: None, host: None })
                .await
                .unwrap();
        }

        apply_attempt_with_log(
            &correlator,
            t0 + ChronoDuration::minutes(1),
            &target,
            "r@x",
            Some("mx.example.com"),
            "550",
            AttemptStatus::Bounce,
        )
        .await;

        // Same host, same 5xx class, within the window — should match.
        apply_attempt_with_log(
            &correlator,
            t0 + ChronoDuration::minutes(3),
            &sibling,
            "r2@x",
            Some("mx.example.com"),
            "553",
            AttemptStatus::Bounce,
        )
        .await;

        // Different host — should not match.
        apply_attempt_with_log(
            &correlator,
            t0 + ChronoDuration::minutes(2),
            &other_host,
            "r3@x",
            Some("mx2.example.com"),
            "550",
            AttemptStatus::Bounce,
        )
        .await;

        let incidents = correlator
            .correlated_incidents(&target, ChronoDuration::minutes(DEFAULT_INCIDENT_WINDOW_MINUTES))
            .await
            .unwrap();

        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].message_id, Some(sibling));
    }

    #[tokio::test]
    async fn delivery_trace_threads_entries_by_host() {
        let (correlator, _dir) = test_correlator().await;
        let mid = MessageId::parse("1FFF-000006-KL").unwrap();
        let t0 = Utc::now();

        correlator
            .apply(&LogEvent::Received { timestamp: t0, message_id: mid.clone(), sender: "s@x".to_string(), size_bytes: None, host: None })
            .await
            .unwrap();
        apply_attempt_with_log(
            &correlator,
            t0 + ChronoDuration::minutes(1),
            &mid,
            "r@x",
            Some("mx.example.com"),
            "250",
            AttemptStatus::Success,
        )
        .await;

        let trace = correlator.delivery_trace(&mid).await.unwrap();
        assert_eq!(trace.host_threads.len(), 1);
        assert_eq!(trace.host_threads[0].host, "mx.example.com");
        assert_eq!(trace.timeline.recipients.len(), 1);
    }
}
