// SPDX-License-Identifier: MIT
//! Log line parser (C3).
//!
//! Converts a raw line plus [`LogSource`] into zero or one [`LogEvent`].
//! Pure function of `(line, log_source)` — no I/O, no shared state beyond the
//! optional [`ParseStats`] counter the caller threads through.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{AttemptStatus, EventType, LogSource, MessageId, QueueAction};

/// Tagged variants of a recognized log line (spec.md §4.3 "LogEvent shape").
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Received {
        timestamp: DateTime<Utc>,
        message_id: MessageId,
        sender: String,
        size_bytes: Option<i64>,
        host: Option<String>,
    },
    DeliveryAttempt {
        timestamp: DateTime<Utc>,
        message_id: MessageId,
        recipient: String,
        host: Option<String>,
        ip: Option<String>,
        smtp_code: Option<String>,
        status: AttemptStatus,
        error: Option<String>,
    },
    Rejected {
        timestamp: DateTime<Utc>,
        sender: Option<String>,
        recipient: Option<String>,
        smtp_code: Option<String>,
        reason: String,
    },
    Panic {
        timestamp: DateTime<Utc>,
        text: String,
    },
    QueueOp {
        timestamp: DateTime<Utc>,
        message_id: MessageId,
        action: QueueAction,
    },
    /// Parsed but not correlated — recognized shape, unrecognized direction.
    Unknown {
        timestamp: DateTime<Utc>,
        message_id: Option<MessageId>,
        raw: String,
    },
}

impl LogEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Received { timestamp, .. }
            | Self::DeliveryAttempt { timestamp, .. }
            | Self::Rejected { timestamp, .. }
            | Self::Panic { timestamp, .. }
            | Self::QueueOp { timestamp, .. }
            | Self::Unknown { timestamp, .. } => *timestamp,
        }
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Received { message_id, .. }
            | Self::DeliveryAttempt { message_id, .. }
            | Self::QueueOp { message_id, .. } => Some(message_id),
            Self::Unknown { message_id, .. } => message_id.as_ref(),
            Self::Rejected { .. } | Self::Panic { .. } => None,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::Received { .. } => EventType::Received,
            Self::DeliveryAttempt { .. } => EventType::DeliveryAttempt,
            Self::Rejected { .. } => EventType::Rejected,
            Self::Panic { .. } => EventType::Panic,
            Self::QueueOp { .. } => EventType::QueueOp,
            Self::Unknown { .. } => EventType::Unknown,
        }
    }
}

/// Running counter of unparseable lines, plus a small bounded sample of the
/// most recent misses per log source for diagnostics (SPEC_FULL.md's
/// "Parser diagnostics sampling" supplement).
pub struct ParseStats {
    miss_count: std::sync::atomic::AtomicU64,
    recent_misses: Mutex<VecDeque<(LogSource, String)>>,
    sample_cap: usize,
}

impl Default for ParseStats {
    fn default() -> Self {
        Self::new(50)
    }
}

impl ParseStats {
    pub fn new(sample_cap: usize) -> Self {
        Self {
            miss_count: std::sync::atomic::AtomicU64::new(0),
            recent_misses: Mutex::new(VecDeque::with_capacity(sample_cap)),
            sample_cap,
        }
    }

    fn record_miss(&self, source: LogSource, line: &str) {
        self.miss_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut misses = self.recent_misses.lock().unwrap_or_else(|e| e.into_inner());
        if misses.len() >= self.sample_cap {
            misses.pop_front();
        }
        misses.push_back((source, line.to_string()));
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn recent_misses(&self) -> Vec<(LogSource, String)> {
        self.recent_misses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

// The MTA emits whitespace-delimited tokens beginning with an ISO-like
// timestamp; the second token is the message id (or absent for non-message
// lines). `YYYY-MM-DD HH:MM:SS` with an optional `.mmm` and an optional
// leading `+`/timezone offset, which this parser normalizes away to UTC.
static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(\.\d+)?\s+(.*)$").unwrap()
});

static MESSAGE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z]+-[0-9A-Za-z]+-[0-9A-Za-z]+$").unwrap());

static KV_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\s)([A-Za-z]+)=(\S+)").unwrap());

static SMTP_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([2-5]\d{2})\b").unwrap());

static IP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([0-9a-fA-F:.]+)\]").unwrap());

/// Parse one raw line. Returns `None` (and increments `stats` if given) when
/// the line does not match any recognized grammar — this is never an error
/// for upstream components (spec.md §4.3).
pub fn parse_line(line: &str, log_source: LogSource, stats: Option<&ParseStats>) -> Option<LogEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }

    match log_source {
        LogSource::Reject => return parse_reject_line(line).or_else(|| miss(stats, log_source, line)),
        LogSource::Panic => return parse_panic_line(line).or_else(|| miss(stats, log_source, line)),
        LogSource::Main => {}
    }

    let caps = match TIMESTAMP_RE.captures(line) {
        Some(c) => c,
        None => return miss(stats, log_source, line),
    };
    let ts = match parse_timestamp(&caps[1]) {
        Some(t) => t,
        None => return miss(stats, log_source, line),
    };
    let rest = caps[3].trim();

    let mut tokens = rest.splitn(2, char::is_whitespace);
    let first_tok = tokens.next().unwrap_or("");
    let remainder = tokens.next().unwrap_or("").trim();

    // Second token is the message id, or this is a non-message system line
    // (e.g. "Completed", "no IP address found").
    if !MESSAGE_ID_RE.is_match(first_tok) {
        return Some(LogEvent::Unknown {
            timestamp: ts,
            message_id: None,
            raw: line.to_string(),
        });
    }
    let message_id = MessageId(first_tok.to_string());

    let event = classify_direction(ts, &message_id, remainder, line);
    event.or_else(|| {
        Some(LogEvent::Unknown {
            timestamp: ts,
            message_id: Some(message_id),
            raw: line.to_string(),
        })
    })
}

fn miss(stats: Option<&ParseStats>, source: LogSource, line: &str) -> Option<LogEvent> {
    if let Some(s) = stats {
        s.record_miss(source, line);
    }
    None
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn kv_pairs(s: &str) -> std::collections::HashMap<String, String> {
    KV_RE
        .captures_iter(s)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Classify by direction sigil: `<=` arrival, `=>`/`->` delivery, `**` bounce,
/// `==` defer, `Completed`/operator-action hints mapped to `QueueOp`.
fn classify_direction(
    ts: DateTime<Utc>,
    message_id: &MessageId,
    remainder: &str,
    raw: &str,
) -> Option<LogEvent> {
    if let Some(rest) = remainder.strip_prefix("<=") {
        return parse_arrival(ts, message_id, rest.trim());
    }
    if let Some(rest) = remainder.strip_prefix("=>") {
        return parse_delivery(ts, message_id, rest.trim(), AttemptStatus::Success);
    }
    if let Some(rest) = remainder.strip_prefix("->") {
        // Additional-address delivery line; treated the same as a primary
        // successful delivery for the named recipient.
        return parse_delivery(ts, message_id, rest.trim(), AttemptStatus::Success);
    }
    if let Some(rest) = remainder.strip_prefix("**") {
        return parse_delivery(ts, message_id, rest.trim(), AttemptStatus::Bounce);
    }
    if let Some(rest) = remainder.strip_prefix("==") {
        return parse_delivery(ts, message_id, rest.trim(), AttemptStatus::Defer);
    }
    if remainder.starts_with("Completed") || remainder.contains("is frozen") || remainder.contains("is no longer frozen") {
        // Operator-action hints: the authoritative source for operator
        // transitions is the AuditEntry stream (spec.md §9), so this is
        // surfaced as Unknown rather than a QueueOp the correlator would act on.
        return None;
    }
    let _ = raw;
    None
}

fn parse_arrival(ts: DateTime<Utc>, message_id: &MessageId, rest: &str) -> Option<LogEvent> {
    let sender = rest.split_whitespace().next()?.to_string();
    let kv = kv_pairs(rest);
    let size_bytes = kv.get("S").and_then(|s| s.parse::<i64>().ok());
    let host = kv.get("H").cloned();
    Some(LogEvent::Received {
        timestamp: ts,
        message_id: message_id.clone(),
        sender,
        size_bytes,
        host,
    })
}

fn parse_delivery(
    ts: DateTime<Utc>,
    message_id: &MessageId,
    rest: &str,
    mut status: AttemptStatus,
) -> Option<LogEvent> {
    let recipient = rest.split_whitespace().next()?.to_string();
    let kv = kv_pairs(rest);
    let host = kv.get("H").cloned();
    let ip = IP_RE.captures(rest).map(|c| c[1].to_string());
    let smtp_code = SMTP_CODE_RE.captures(rest).map(|c| c[1].to_string());
    if let Some(code) = &smtp_code {
        if let Some(from_code) = AttemptStatus::from_smtp_code(code) {
            // The sigil already told us success/defer/bounce; an explicit
            // SMTP code refines a generic "==" defer into the right class
            // when present, but never overrides an explicit bounce sigil.
            if status != AttemptStatus::Bounce {
                status = from_code;
            }
        }
    }
    let error = extract_error_text(rest);
    Some(LogEvent::DeliveryAttempt {
        timestamp: ts,
        message_id: message_id.clone(),
        recipient,
        host,
        ip,
        smtp_code,
        status,
        error,
    })
}

fn extract_error_text(rest: &str) -> Option<String> {
    // Error text typically follows a ": " after the SMTP code, e.g.
    // "[192.0.2.1]: 451 Temp failure".
    rest.split_once(": ").map(|(_, tail)| tail.trim().to_string())
}

fn parse_reject_line(line: &str) -> Option<LogEvent> {
    let caps = TIMESTAMP_RE.captures(line)?;
    let ts = parse_timestamp(&caps[1])?;
    let rest = caps[3].trim();
    let kv = kv_pairs(rest);
    let sender = kv.get("F").or_else(|| kv.get("sender")).cloned();
    let recipient = kv.get("R").or_else(|| kv.get("rcpt")).cloned();
    let smtp_code = SMTP_CODE_RE.captures(rest).map(|c| c[1].to_string());
    Some(LogEvent::Rejected {
        timestamp: ts,
        sender,
        recipient,
        smtp_code,
        reason: rest.to_string(),
    })
}

fn parse_panic_line(line: &str) -> Option<LogEvent> {
    let caps = TIMESTAMP_RE.captures(line)?;
    let ts = parse_timestamp(&caps[1])?;
    Some(LogEvent::Panic {
        timestamp: ts,
        text: caps[3].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_delivery_scenario() {
        let arrival = parse_line(
            "2024-01-01 08:15:00 1hKj4x-0008Oi-3r <= user@example.com H=mail.example.com",
            LogSource::Main,
            None,
        )
        .unwrap();
        match arrival {
            LogEvent::Received { sender, host, message_id, .. } => {
                assert_eq!(sender, "user@example.com");
                assert_eq!(host.as_deref(), Some("mail.example.com"));
                assert_eq!(message_id.as_str(), "1hKj4x-0008Oi-3r");
            }
            other => panic!("expected Received, got {other:?}"),
        }

        let delivery = parse_line(
            "2024-01-01 08:16:00 1hKj4x-0008Oi-3r => recipient@domain.com R=dnslookup T=remote_smtp [192.0.2.1]",
            LogSource::Main,
            None,
        )
        .unwrap();
        match delivery {
            LogEvent::DeliveryAttempt { recipient, status, ip, .. } => {
                assert_eq!(recipient, "recipient@domain.com");
                assert_eq!(status, AttemptStatus::Success);
                assert_eq!(ip.as_deref(), Some("192.0.2.1"));
            }
            other => panic!("expected DeliveryAttempt, got {other:?}"),
        }
    }

    #[test]
    fn defer_then_bounce_scenario() {
        let defer = parse_line(
            "2024-01-01 09:00:00 1AAA-000001-AB == r@x R=dnslookup H=mx.x [1.2.3.4]: 451 Temp",
            LogSource::Main,
            None,
        )
        .unwrap();
        match defer {
            LogEvent::DeliveryAttempt { status, smtp_code, .. } => {
                assert_eq!(status, AttemptStatus::Defer);
                assert_eq!(smtp_code.as_deref(), Some("451"));
            }
            other => panic!("expected DeliveryAttempt, got {other:?}"),
        }

        let bounce = parse_line(
            "2024-01-01 09:10:00 1AAA-000001-AB ** r@x H=mx.x [1.2.3.4]: 550 Mailbox unavailable",
            LogSource::Main,
            None,
        )
        .unwrap();
        match bounce {
            LogEvent::DeliveryAttempt { status, smtp_code, error, .. } => {
                assert_eq!(status, AttemptStatus::Bounce);
                assert_eq!(smtp_code.as_deref(), Some("550"));
                assert_eq!(error.as_deref(), Some("550 Mailbox unavailable"));
            }
            other => panic!("expected DeliveryAttempt, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_line_increments_counter_not_error() {
        let stats = ParseStats::default();
        let result = parse_line("complete garbage, not a log line", LogSource::Main, Some(&stats));
        assert!(result.is_none());
        assert_eq!(stats.miss_count(), 1);
    }

    #[test]
    fn unknown_direction_is_parsed_but_not_correlated() {
        let event = parse_line(
            "2024-01-01 08:15:00 1hKj4x-0008Oi-3r ?? something we do not recognize",
            LogSource::Main,
            None,
        )
        .unwrap();
        assert!(matches!(event, LogEvent::Unknown { .. }));
        assert_eq!(event.event_type(), EventType::Unknown);
    }

    #[test]
    fn reject_log_classified_by_source() {
        let event = parse_line(
            "2024-01-01 08:15:00 F=<sender@example.com> R=<bad@example.com> rejected RCPT: relay not permitted",
            LogSource::Reject,
            None,
        )
        .unwrap();
        match event {
            LogEvent::Rejected { sender, recipient, .. } => {
                assert_eq!(sender.as_deref(), Some("<sender@example.com>"));
                assert_eq!(recipient.as_deref(), Some("<bad@example.com>"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn panic_log_classified_by_source() {
        let event = parse_line(
            "2024-01-01 08:15:00 panic: failed to bind socket",
            LogSource::Panic,
            None,
        )
        .unwrap();
        assert!(matches!(event, LogEvent::Panic { .. }));
    }

    #[test]
    fn unknown_keys_do_not_fail_parsing() {
        let event = parse_line(
            "2024-01-01 08:15:00 1hKj4x-0008Oi-3r <= user@example.com H=mail.example.com X=unexpected_key Z=another",
            LogSource::Main,
            None,
        );
        assert!(event.is_some());
    }

    use proptest::prelude::*;

    proptest::proptest! {
        /// No arbitrary byte sequence the tailer hands us should ever panic
        /// the parser — an unrecognized line increments the miss counter and
        /// parses to `None`, it never propagates an error (spec.md §8
        /// "Unparseable line increments counter, not error").
        #[test]
        fn arbitrary_lines_never_panic(line in ".*") {
            let stats = ParseStats::default();
            let _ = parse_line(&line, LogSource::Main, Some(&stats));
        }

        /// Parsing the same line twice is a pure function of its bytes and
        /// log source — running it again never changes the verdict (a
        /// prerequisite for the historical-import idempotency scenario,
        /// spec.md §8).
        #[test]
        fn parsing_is_idempotent(line in ".*") {
            let stats_a = ParseStats::default();
            let stats_b = ParseStats::default();
            let first = parse_line(&line, LogSource::Main, Some(&stats_a));
            let second = parse_line(&line, LogSource::Main, Some(&stats_b));
            prop_assert_eq!(first, second);
        }
    }
}
