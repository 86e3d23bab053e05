// SPDX-License-Identifier: MIT
//! `InspectMessage` (spec.md §6.2): stitches the Queue Controller's live
//! envelope/header/body/log views together with the Correlator's stored
//! history into the single combined structure the operator UI renders for
//! one message.

use crate::correlator::DeliveryTrace;
use crate::model::{Message, MessageId};
use crate::AppContext;

/// Truncate a message body preview to this many bytes (spec.md §6.2
/// "content preview" — the full body is available separately via the Queue
/// Controller's `-Mvb`, this is just what the detail view shows inline).
const BODY_PREVIEW_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct MessageDetails {
    /// `None` when the message has been fully purged by retention or was
    /// never seen in the logs — the live queue views can still succeed.
    pub message: Option<Message>,
    pub trace: DeliveryTrace,
    /// `None` when the live binary call failed (message no longer queued,
    /// binary unreachable, timed out) rather than the queue simply being
    /// empty of headers.
    pub headers: Option<String>,
    pub body_preview: Option<String>,
    pub body_truncated: bool,
    pub mta_log: Option<String>,
}

/// Build the combined view for one message. Store/Correlator failures
/// propagate; failures from the live Queue Controller calls (the message may
/// have already left the queue) are downgraded to `None` fields rather than
/// failing the whole inspection — a delivered message's history is still
/// worth showing.
pub async fn inspect_message(ctx: &AppContext, message_id: &MessageId) -> Result<MessageDetails, crate::error::StoreError> {
    let trace = ctx.correlator.delivery_trace(message_id).await?;
    let message = trace.timeline.message.clone();

    let headers = ctx.queue.inspect_headers(message_id).await.ok();
    let mta_log = ctx.queue.inspect_log(message_id).await.ok();
    let (body_preview, body_truncated) = match ctx.queue.inspect_body(message_id).await {
        Ok(body) if body.len() > BODY_PREVIEW_BYTES => {
            let mut boundary = BODY_PREVIEW_BYTES;
            while !body.is_char_boundary(boundary) {
                boundary -= 1;
            }
            (Some(body[..boundary].to_string()), true)
        }
        Ok(body) => (Some(body), false),
        Err(_) => (None, false),
    };

    Ok(MessageDetails { message, trace, headers, body_preview, body_truncated, mta_log })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigOverrides};

    #[tokio::test]
    async fn unknown_message_still_returns_empty_trace() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = ConfigOverrides {
            db_path: Some(dir.path().join("q.db")),
            binary_path: Some(std::path::PathBuf::from("/nonexistent/exim-binary-xyz")),
            ..Default::default()
        };
        let config = Config::load(None, overrides);
        let ctx = AppContext::build(config).await.unwrap();

        let mid = MessageId::parse("1hKj4x-0008Oi-3r").unwrap();
        let details = inspect_message(&ctx, &mid).await.unwrap();
        assert!(details.message.is_none());
        assert!(details.headers.is_none());
        assert!(details.body_preview.is_none());
    }
}
