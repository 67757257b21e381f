//! Webhook receiver and health check
//!
//! The receiver does no processing inline: it validates the body, enqueues a
//! `ProcessWebhook` job and answers 202 so the aggregator never waits on a sync.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{validate_secret, AppError, AppState, MAX_WEBHOOK_BODY, WEBHOOK_SECRET_HEADER};
use banksync_core::{Job, WebhookPayload};

/// GET /health - Liveness probe
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /webhooks/aggregator - Accept an aggregator event
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if let Some(secret) = &state.config.webhook_secret {
        let provided = request
            .headers()
            .get(WEBHOOK_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !validate_secret(provided, std::slice::from_ref(secret)) {
            warn!("Rejected webhook with missing or invalid secret");
            return Err(AppError::unauthorized("Invalid webhook secret"));
        }
    }

    let bytes = axum::body::to_bytes(request.into_body(), MAX_WEBHOOK_BODY)
        .await
        .map_err(|_| AppError::bad_request("Invalid request body"))?;
    let payload: WebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| AppError::bad_request("Invalid JSON"))?;

    if payload.event_type.trim().is_empty() {
        return Err(AppError::bad_request("Missing event type"));
    }

    debug!(event = %payload.event_type, item = ?payload.content.item_id, "Webhook received");

    state
        .queue
        .submit(Job::ProcessWebhook { payload }, &state.sync.config().jobs)
        .map_err(|_| AppError::unavailable("Job queue unavailable"))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "received": true }))))
}
