//! HTTP surface: health, the mailbox push webhook, and read endpoints for
//! the triage UI.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use shared_types::{DealResponse, LabelDelta, MessageListQuery, MessageResponse, SyncReport};

use crate::context::AppContext;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::workers;

pub fn api_routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health))
        .route("/push", post(receive_push))
        .route("/messages", get(list_messages))
        .route("/deals", get(list_deals))
        .route("/deals/:id/opt-out", post(opt_out_deal))
        .route("/label-deltas/:account", get(drain_label_deltas))
        .route("/accounts/:id/sync", post(trigger_sync))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Pub/Sub push envelope; the payload rides base64-encoded in `message.data`.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: String,
    #[serde(default, rename = "messageId")]
    pub message_id: String,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct PushPayload {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "historyId")]
    pub history_id: u64,
}

/// Decode the base64 payload of a push envelope.
pub fn decode_push_payload(data: &str) -> Result<PushPayload, String> {
    let bytes = BASE64.decode(data.trim()).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Mailbox change webhook. The pushed history id is only a hint; the sync
/// always runs from the cursor we stored, so a dropped push costs nothing.
/// Always acks so the broker stops redelivering.
async fn receive_push(
    State(ctx): State<AppContext>,
    Json(envelope): Json<PushEnvelope>,
) -> ApiResult<StatusCode> {
    let payload = match decode_push_payload(&envelope.message.data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "undecodable push envelope, acking anyway");
            return Ok(StatusCode::NO_CONTENT);
        }
    };

    let mut conn = ctx.pool.get().await?;
    let Some(account) = db::accounts::get_by_email(&mut conn, &payload.email_address).await? else {
        warn!(email = %payload.email_address, "push for unknown account");
        return Ok(StatusCode::NO_CONTENT);
    };
    drop(conn);

    // Same limiter as the scheduler; a burst of pushes collapses into one
    // sync and the next scheduled cycle covers anything skipped here.
    if !ctx.sync_limiter.try_acquire(account.id) {
        info!(account = %account.email_address, "sync ran recently, acking push without one");
        return Ok(StatusCode::NO_CONTENT);
    }

    info!(
        account = %account.email_address,
        pushed_history_id = payload.history_id,
        "push received, syncing from stored cursor"
    );
    tokio::spawn(async move {
        if let Err(e) = workers::sync_one(&ctx, &account, false).await {
            warn!(account = %account.email_address, error = %e, "push-triggered sync failed");
        }
    });

    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(ctx): State<AppContext>,
    Query(query): Query<MessageListQuery>,
) -> ApiResult<Json<Vec<MessageResponse>>> {
    let mut conn = ctx.pool.get().await?;
    let rows = db::messages::list(
        &mut conn,
        query.account_id,
        query.category.as_deref(),
        query.processed,
        query.limit.unwrap_or(50).clamp(1, 200),
        query.offset.unwrap_or(0).max(0),
    )
    .await?;

    Ok(Json(rows.into_iter().map(MessageResponse::from).collect()))
}

#[derive(Debug, Deserialize, Default)]
struct DealListQuery {
    account_id: Option<Uuid>,
    limit: Option<i64>,
}

async fn list_deals(
    State(ctx): State<AppContext>,
    Query(query): Query<DealListQuery>,
) -> ApiResult<Json<Vec<DealResponse>>> {
    let mut conn = ctx.pool.get().await?;
    let rows = db::deals::list(
        &mut conn,
        query.account_id,
        query.limit.unwrap_or(50).clamp(1, 200),
    )
    .await?;

    Ok(Json(rows.into_iter().map(DealResponse::from).collect()))
}

async fn opt_out_deal(
    State(ctx): State<AppContext>,
    Path(deal_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut conn = ctx.pool.get().await?;
    if db::deals::find_by_id(&mut conn, deal_id).await?.is_none() {
        return Err(ApiError::not_found("deal"));
    }
    db::deals::set_opted_out(&mut conn, deal_id, true).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Drain the account's ephemeral label-delta buffer; each delta is
/// delivered at most once.
async fn drain_label_deltas(
    State(ctx): State<AppContext>,
    Path(account_id): Path<Uuid>,
) -> Json<Vec<LabelDelta>> {
    Json(ctx.label_deltas.drain(account_id))
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    #[serde(default)]
    full: bool,
}

async fn trigger_sync(
    State(ctx): State<AppContext>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<SyncReport>> {
    let account = {
        let mut conn = ctx.pool.get().await?;
        db::accounts::find_by_id(&mut conn, account_id)
            .await?
            .ok_or_else(|| ApiError::not_found("account"))?
    };

    let report = workers::sync_one(&ctx, &account, query.full)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("sync failed: {e}")))?;

    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_payload_decodes_from_base64() {
        let raw = r#"{"emailAddress":"partner@fund.com","historyId":987654}"#;
        let encoded = BASE64.encode(raw);
        let payload = decode_push_payload(&encoded).unwrap();
        assert_eq!(payload.email_address, "partner@fund.com");
        assert_eq!(payload.history_id, 987654);
    }

    #[test]
    fn bad_base64_and_bad_json_are_rejected() {
        assert!(decode_push_payload("not base64!!!").is_err());
        let encoded = BASE64.encode("not json");
        assert!(decode_push_payload(&encoded).is_err());
    }

    #[test]
    fn message_query_carries_the_processed_filter() {
        let query: MessageListQuery =
            serde_json::from_value(json!({ "processed": false })).unwrap();
        assert_eq!(query.processed, Some(false));
        assert!(query.account_id.is_none());
        assert!(query.category.is_none());
    }

    #[test]
    fn envelope_shape_matches_pubsub() {
        let body = json!({
            "message": {
                "data": BASE64.encode(r#"{"emailAddress":"a@b.co","historyId":1}"#),
                "messageId": "m-1"
            },
            "subscription": "projects/x/subscriptions/y"
        });
        let envelope: PushEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.message.message_id, "m-1");
        let payload = decode_push_payload(&envelope.message.data).unwrap();
        assert_eq!(payload.email_address, "a@b.co");
    }
}
