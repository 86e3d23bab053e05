// SPDX-License-Identifier: MIT
//! The `Operate` surface (spec.md §6.2): the single entry point external
//! callers (and this crate's own CLI) use to drive a queue manipulation.
//!
//! This is deliberately the *only* place that ties the Queue Controller, the
//! Store's audit trail, the Correlator's state machine, and the Event Bus
//! together. Driving the MTA binary from three different call sites (as the
//! CLI used to) meant only the CLI path wrote audit entries and none of them
//! fed the result back into the Correlator, so a freeze/thaw/delete never
//! actually changed a message's stored `current_status`. spec.md §9
//! "Operator-action log events" says the AuditEntry stream is authoritative
//! for operator-initiated transitions — this module is where that happens.

use chrono::Utc;
use tracing::warn;

use crate::error::QueueError;
use crate::events::BusEvent;
use crate::model::{AuditEntry, EventType, MessageId, QueueAction, UNKNOWN_ACTOR, UNKNOWN_SOURCE};
use crate::parser::LogEvent;
use crate::AppContext;

/// Outcome of a single message-id operation, mirroring spec.md §6.2's
/// `OperationResult`. `message_id` is the raw id as requested — it may not
/// be a well-formed [`MessageId`] when `success` is `false` with a
/// validation error, so this is the string the caller passed in, not a
/// parsed/validated type.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub message_id: String,
    pub action: QueueAction,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of a bulk request over many ids (spec.md §4.6 "Bulk operation
/// contract" / §6.2 `BulkOperationResult`).
#[derive(Debug, Clone)]
pub struct BulkOperationResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<OperationResult>,
}

/// Either shape `Operate` can return, matching spec.md §6.2's
/// "OperationResult or BulkOperationResult".
#[derive(Debug, Clone)]
pub enum OperateOutcome {
    Single(OperationResult),
    Bulk(BulkOperationResult),
}

/// Drive `action` against every raw id in `ids`. A single id produces
/// [`OperateOutcome::Single`]; more than one always produces
/// [`OperateOutcome::Bulk`], even if some entries turn out invalid, so bulk
/// callers get a uniform response shape regardless of how many ids succeed.
///
/// Ids are validated here, not by the caller — spec.md §8 scenario 4 ("Bulk
/// freeze with one bad id") requires a malformed id to still produce a
/// failed [`OperationResult`] and exactly one AuditEntry, with no subprocess
/// spawned for it, rather than being silently dropped from the request
/// before it ever reaches this function.
///
/// `actor`/`source_address` are attributed to the audit entry verbatim; per
/// spec.md §4.6 "Auditing", an absent actor/source still produces exactly one
/// AuditEntry per id, using the sentinel values.
///
/// A bulk request (more than one id) over `config.bulk_max_size` is rejected
/// with [`QueueError::BulkTooLarge`] before anything is audited or any
/// subprocess is spawned (spec.md §8 "bulk op size cap configurable").
pub async fn execute(
    ctx: &AppContext,
    action: QueueAction,
    ids: &[String],
    actor: Option<&str>,
    source_address: Option<&str>,
    reason: Option<&str>,
) -> Result<OperateOutcome, QueueError> {
    let actor = actor.unwrap_or(UNKNOWN_ACTOR).to_string();
    let source_address = source_address.unwrap_or(UNKNOWN_SOURCE).to_string();

    if ids.len() == 1 {
        let result = execute_one(ctx, action, &ids[0], &actor, &source_address, reason).await;
        return Ok(OperateOutcome::Single(result));
    }

    if ids.len() > ctx.config.bulk_max_size {
        return Err(QueueError::BulkTooLarge { actual: ids.len(), limit: ctx.config.bulk_max_size });
    }

    let concurrency = ctx.config.bulk_concurrency_limit.max(1);
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(concurrency));
    let mut futures = futures_util::stream::FuturesUnordered::new();
    for raw_id in ids.iter().cloned() {
        let semaphore = semaphore.clone();
        let actor = actor.clone();
        let source_address = source_address.clone();
        futures.push(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            execute_one(ctx, action, &raw_id, &actor, &source_address, reason).await
        });
    }

    use futures_util::StreamExt;
    let mut results = Vec::with_capacity(ids.len());
    while let Some(result) = futures.next().await {
        results.push(result);
    }

    let successful = results.iter().filter(|r| r.success).count();
    let failed = results.len() - successful;
    Ok(OperateOutcome::Bulk(BulkOperationResult { total: results.len(), successful, failed, results }))
}

async fn execute_one(
    ctx: &AppContext,
    action: QueueAction,
    raw_id: &str,
    actor: &str,
    source_address: &str,
    reason: Option<&str>,
) -> OperationResult {
    let now = Utc::now();
    let message_id = MessageId::parse(raw_id);

    let outcome: Result<(), QueueError> = match &message_id {
        Some(mid) => ctx.queue.apply_action(mid, action).await,
        None => Err(QueueError::InvalidMessageId(raw_id.to_string())),
    };

    let details = serde_json::json!({
        "action": action.as_str(),
        "requested_id": raw_id,
        "ok": outcome.is_ok(),
        "error": outcome.as_ref().err().map(|e| e.to_string()),
        "reason": reason,
    });
    let audit = AuditEntry {
        timestamp: now,
        action: action.as_str().to_string(),
        message_id: message_id.clone(),
        actor: actor.to_string(),
        source_address: source_address.to_string(),
        details_json: details.to_string(),
    };
    if let Err(e) = ctx.store.record_audit_entry(&audit).await {
        warn!(error = %e, message_id = raw_id, "failed to record audit entry for operation");
    }

    if let (Ok(()), Some(mid)) = (&outcome, &message_id) {
        // The AuditEntry above is the authoritative source for this
        // transition (spec.md §9); feed it through the same correlator path
        // log-derived events use so Message.current_status stays correct.
        let event = LogEvent::QueueOp { timestamp: now, message_id: mid.clone(), action };
        if let Err(e) = ctx.correlator.apply(&event).await {
            warn!(error = %e, message_id = %mid, "failed to correlate operator action");
        }
        ctx.events.publish(BusEvent {
            event_type: EventType::QueueOp,
            message_id: Some(mid.clone()),
            summary: format!("message {mid} {}ed by {actor}", verb(action)),
        });
    }

    OperationResult {
        message_id: raw_id.to_string(),
        action,
        success: outcome.is_ok(),
        error: outcome.err().map(|e| e.to_string()),
    }
}

fn verb(action: QueueAction) -> &'static str {
    match action {
        QueueAction::Deliver => "deliver",
        QueueAction::Freeze => "freeze",
        QueueAction::Thaw => "thaw",
        QueueAction::Delete => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;

    async fn test_ctx() -> (AppContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let overrides = crate::config::ConfigOverrides {
            db_path: Some(dir.path().join("q.db")),
            binary_path: Some(PathBuf::from("/nonexistent/exim-binary-xyz")),
            ..Default::default()
        };
        let config = Config::load(None, overrides);
        let ctx = AppContext::build(config).await.unwrap();
        (ctx, dir)
    }

    #[tokio::test]
    async fn single_failed_op_still_writes_audit_entry() {
        let (ctx, _dir) = test_ctx().await;
        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        let outcome = execute(&ctx, QueueAction::Freeze, &[mid.as_str().to_string()], Some("alice"), None, None)
            .await
            .unwrap();
        match outcome {
            OperateOutcome::Single(result) => {
                assert!(!result.success);
                assert_eq!(result.message_id, mid.as_str());
            }
            other => panic!("expected Single, got {other:?}"),
        }
        let page = ctx.store.list_audit_entries(Some(&mid), 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].actor, "alice");
    }

    #[tokio::test]
    async fn bulk_with_multiple_ids_always_audits_each() {
        let (ctx, _dir) = test_ctx().await;
        let ids = vec!["1AAA-000001-AB".to_string(), "1BBB-000002-CD".to_string()];
        let outcome = execute(&ctx, QueueAction::Freeze, &ids, None, None, None).await.unwrap();
        match outcome {
            OperateOutcome::Bulk(result) => {
                assert_eq!(result.total, 2);
                assert_eq!(result.failed, 2);
            }
            other => panic!("expected Bulk, got {other:?}"),
        }
        for id in &ids {
            let mid = MessageId::parse(id).unwrap();
            let page = ctx.store.list_audit_entries(Some(&mid), 10, 0).await.unwrap();
            assert_eq!(page.total, 1);
            assert_eq!(page.items[0].actor, UNKNOWN_ACTOR);
        }
    }

    #[tokio::test]
    async fn bulk_freeze_with_one_bad_id_audits_all_three_and_skips_the_subprocess() {
        // spec.md §8 scenario 4: a malformed id among otherwise-valid ones
        // must still produce a failed OperationResult and exactly one
        // AuditEntry, without ever reaching the queue controller.
        let (ctx, _dir) = test_ctx().await;
        let ids = vec!["1AAA-000001-AB".to_string(), "bad-id".to_string(), "1AAA-000002-CD".to_string()];
        let outcome = execute(&ctx, QueueAction::Freeze, &ids, None, None, None).await.unwrap();
        let result = match outcome {
            OperateOutcome::Bulk(result) => result,
            other => panic!("expected Bulk, got {other:?}"),
        };
        assert_eq!(result.total, 3);
        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 3);

        let bad = result.results.iter().find(|r| r.message_id == "bad-id").expect("bad-id result present");
        assert!(!bad.success);
        assert!(bad.error.as_deref().unwrap_or_default().contains("invalid message id"));

        // Three ids in, three audit rows out — including the invalid one.
        let all_audits = ctx.store.list_audit_entries(None, 200, 0).await.unwrap();
        assert_eq!(all_audits.total, 3, "expected exactly one audit row per requested id, including bad-id");
    }

    #[tokio::test]
    async fn bulk_over_configured_cap_is_rejected_before_any_audit() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = crate::config::ConfigOverrides {
            db_path: Some(dir.path().join("q.db")),
            binary_path: Some(PathBuf::from("/nonexistent/exim-binary-xyz")),
            ..Default::default()
        };
        let mut config = Config::load(None, overrides);
        config.bulk_max_size = 1;
        let ctx = AppContext::build(config).await.unwrap();

        let ids = vec!["1AAA-000001-AB".to_string(), "1BBB-000002-CD".to_string()];
        let err = execute(&ctx, QueueAction::Freeze, &ids, None, None, None).await.unwrap_err();
        assert!(matches!(err, crate::error::QueueError::BulkTooLarge { actual: 2, limit: 1 }));

        for raw in &ids {
            let mid = MessageId::parse(raw).unwrap();
            let page = ctx.store.list_audit_entries(Some(&mid), 10, 0).await.unwrap();
            assert_eq!(page.total, 0, "no audit entry should be written for a rejected bulk request");
        }
    }
}
