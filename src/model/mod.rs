// SPDX-License-Identifier: MIT
//! Shared domain types for messages, recipients, delivery attempts, and the
//! rest of the entities in the data model. These are plain data types with
//! no I/O; the [`crate::store`] module is the only place that knows how to
//! persist or query them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The MTA's opaque message identifier, e.g. `1hKj4x-0008Oi-3r`.
///
/// Always three hyphen-separated alphanumeric groups, total length >= 10.
/// Validated at the edge (CLI / queue controller input); stored as plain
/// text everywhere else since the MTA never reuses the format for anything
/// else we need to distinguish.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Validate the MTA id shape: three `-`-separated alphanumeric groups,
    /// total length at least 10. Does not guarantee the id is known to the
    /// MTA — only that it is well-formed enough to pass to the binary.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() < 10 {
            return None;
        }
        let groups: Vec<&str> = raw.split('-').collect();
        if groups.len() != 3 {
            return None;
        }
        if groups.iter().any(|g| g.is_empty() || !g.chars().all(|c| c.is_ascii_alphanumeric())) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate status of a [`Message`], derived from its recipients (§4.5) plus
/// any explicit freeze/delete override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Queued,
    Delivered,
    Deferred,
    Bounced,
    Frozen,
    Deleted,
}

impl MessageStatus {
    /// Terminal statuses never transition further (spec.md §4.5, the `*` states).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Bounced | Self::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::Bounced => "bounced",
            Self::Frozen => "frozen",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "received" => Self::Received,
            "queued" => Self::Queued,
            "delivered" => Self::Delivered,
            "deferred" => Self::Deferred,
            "bounced" => Self::Bounced,
            "frozen" => Self::Frozen,
            "deleted" => Self::Deleted,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub first_seen_at: DateTime<Utc>,
    pub sender: String,
    pub size_bytes: Option<i64>,
    pub current_status: MessageStatus,
    /// Timestamp of the event that last changed `current_status`, used to
    /// reject out-of-order updates (spec.md §4.5).
    pub last_state_change: DateTime<Utc>,
}

/// Per-recipient delivery status, independent across recipients of the same message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Delivered,
    Deferred,
    Bounced,
}

impl RecipientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Bounced)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::Bounced => "bounced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "delivered" => Self::Delivered,
            "deferred" => Self::Deferred,
            "bounced" => Self::Bounced,
            _ => return None,
        })
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub message_id: MessageId,
    pub recipient_address: String,
    pub status: RecipientStatus,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_smtp_code: Option<String>,
    pub last_error_text: Option<String>,
}

/// Outcome of a single observed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Defer,
    Bounce,
    Timeout,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Defer => "defer",
            Self::Bounce => "bounce",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => Self::Success,
            "defer" => Self::Defer,
            "bounce" => Self::Bounce,
            "timeout" => Self::Timeout,
            _ => return None,
        })
    }

    /// Map an SMTP reply code into a defer/bounce classification.
    /// 2xx => success, 4xx => defer, 5xx => bounce; anything else is `None`.
    pub fn from_smtp_code(code: &str) -> Option<Self> {
        let first = code.chars().next()?;
        match first {
            '2' => Some(Self::Success),
            '4' => Some(Self::Defer),
            '5' => Some(Self::Bounce),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub recipient_address: String,
    pub timestamp: DateTime<Utc>,
    pub remote_host: Option<String>,
    pub remote_ip: Option<String>,
    pub status: AttemptStatus,
    pub smtp_code: Option<String>,
    pub error_message: Option<String>,
}

/// Which log file a line came from, derived from the filename (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Main,
    Reject,
    Panic,
}

impl LogSource {
    /// Classify by filename: contains "reject" => reject, "panic" => panic, else main.
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("reject") {
            Self::Reject
        } else if lower.contains("panic") {
            Self::Panic
        } else {
            Self::Main
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Reject => "reject",
            Self::Panic => "panic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "main" => Self::Main,
            "reject" => Self::Reject,
            "panic" => Self::Panic,
            _ => return None,
        })
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of a parsed log line, independent of its raw-line storage form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Received,
    DeliveryAttempt,
    Rejected,
    Panic,
    QueueOp,
    Unknown,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::DeliveryAttempt => "delivery_attempt",
            Self::Rejected => "rejected",
            Self::Panic => "panic",
            Self::QueueOp => "queue_op",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "received" => Self::Received,
            "delivery_attempt" => Self::DeliveryAttempt,
            "rejected" => Self::Rejected,
            "panic" => Self::Panic,
            "queue_op" => Self::QueueOp,
            "unknown" => Self::Unknown,
            _ => return None,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Row in the `log_entries` table — the raw-plus-parsed form kept for search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub log_source: LogSource,
    pub event_type: EventType,
    pub message_id: Option<MessageId>,
    pub sender: Option<String>,
    pub recipients: Option<String>,
    pub host: Option<String>,
    pub smtp_code: Option<String>,
    pub error: Option<String>,
    pub raw_line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total: i64,
    pub deferred: i64,
    pub frozen: i64,
    pub oldest_age_seconds: i64,
}

/// An operator/queue-controller action ∈ {deliver,freeze,thaw,delete}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Deliver,
    Freeze,
    Thaw,
    Delete,
}

impl QueueAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deliver => "deliver",
            Self::Freeze => "freeze",
            Self::Thaw => "thaw",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "deliver" => Self::Deliver,
            "freeze" => Self::Freeze,
            "thaw" => Self::Thaw,
            "delete" => Self::Delete,
            _ => return None,
        })
    }
}

impl fmt::Display for QueueAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub message_id: Option<MessageId>,
    pub actor: String,
    pub source_address: String,
    pub details_json: String,
}

/// Sentinel actor/source used when the caller did not supply one (spec.md §4.6
/// "Auditing" — an audit entry is still written with a sentinel value).
pub const UNKNOWN_ACTOR: &str = "unknown";
pub const UNKNOWN_SOURCE: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Team,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Team => "team",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "private" => Self::Private,
            "team" => Self::Team,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub message_id: MessageId,
    pub author: String,
    pub text: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub message_id: MessageId,
    pub author: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_requires_three_groups() {
        assert!(MessageId::parse("1hKj4x-0008Oi-3r").is_some());
        assert!(MessageId::parse("1hKj4x-0008Oi").is_none());
        assert!(MessageId::parse("ab-cd-ef").is_none());
        assert!(MessageId::parse("1hKj4x-00!8Oi-3r").is_none());
    }

    #[test]
    fn attempt_status_from_smtp_code() {
        assert_eq!(AttemptStatus::from_smtp_code("250"), Some(AttemptStatus::Success));
        assert_eq!(AttemptStatus::from_smtp_code("451"), Some(AttemptStatus::Defer));
        assert_eq!(AttemptStatus::from_smtp_code("550"), Some(AttemptStatus::Bounce));
        assert_eq!(AttemptStatus::from_smtp_code("x50"), None);
    }

    #[test]
    fn log_source_from_filename() {
        assert_eq!(LogSource::from_filename("mainlog"), LogSource::Main);
        assert_eq!(LogSource::from_filename("reject.log"), LogSource::Reject);
        assert_eq!(LogSource::from_filename("exim_panic.log"), LogSource::Panic);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            MessageStatus::Received,
            MessageStatus::Queued,
            MessageStatus::Delivered,
            MessageStatus::Deferred,
            MessageStatus::Bounced,
            MessageStatus::Frozen,
            MessageStatus::Deleted,
        ] {
            assert_eq!(MessageStatus::parse(s.as_str()), Some(s));
        }
    }
}
