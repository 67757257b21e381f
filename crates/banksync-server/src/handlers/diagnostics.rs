//! Backlog diagnostics and batch job handlers

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{get_actor, AppError, AppState, MAX_PAGE_LIMIT};
use banksync_core::{BacklogReport, Job};

fn default_issue_limit() -> usize {
    20
}

fn default_batch_limit() -> usize {
    500
}

/// Query parameters for the backlog report
#[derive(Debug, Deserialize)]
pub struct DiagnosticsQuery {
    pub user_id: Option<i64>,
    #[serde(default = "default_issue_limit")]
    pub limit: usize,
}

/// Request body for a conversion batch
#[derive(Debug, Default, Deserialize)]
pub struct ConversionRequest {
    pub user_id: Option<i64>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Request body for a categorization batch
#[derive(Debug, Deserialize)]
pub struct CategorizationRequest {
    pub user_id: Option<i64>,
    #[serde(default = "default_batch_limit")]
    pub limit: usize,
}

/// GET /api/diagnostics - Import and conversion backlog
pub async fn get_diagnostics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DiagnosticsQuery>,
) -> Result<Json<BacklogReport>, AppError> {
    let limit = params.limit.min(MAX_PAGE_LIMIT);
    let report = state.db().backlog_report(params.user_id, limit)?;
    Ok(Json(report))
}

/// Parse an optional JSON body, treating an empty body as defaults
async fn parse_body<T>(request: Request) -> Result<Option<T>, AppError>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = axum::body::to_bytes(request.into_body(), 1024 * 10)
        .await
        .map_err(|_| AppError::bad_request("Invalid request body"))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| AppError::bad_request("Invalid JSON"))
}

/// POST /api/conversions - Queue a conversion batch
pub async fn start_conversion(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = get_actor(request.headers());
    let req: ConversionRequest = parse_body(request).await?.unwrap_or_default();

    if req.limit == Some(0) {
        return Err(AppError::bad_request("limit must be positive"));
    }

    let job = Job::ConvertBatch {
        user_id: req.user_id,
        limit: req.limit,
        dry_run: req.dry_run,
    };
    state
        .queue
        .submit(job, &state.sync.config().jobs)
        .map_err(|_| AppError::unavailable("Job queue unavailable"))?;

    state.db().log_audit(
        &actor,
        "convert",
        Some("bank_transaction"),
        req.user_id,
        Some(&format!("limit={:?}, dry_run={}", req.limit, req.dry_run)),
    )?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}

/// POST /api/categorizations - Queue a categorization batch
pub async fn start_categorization(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = get_actor(request.headers());
    let req = parse_body::<CategorizationRequest>(request)
        .await?
        .unwrap_or(CategorizationRequest {
            user_id: None,
            limit: default_batch_limit(),
        });

    let limit = req.limit.clamp(1, MAX_PAGE_LIMIT);
    state
        .queue
        .submit(
            Job::CategorizeBatch {
                user_id: req.user_id,
                limit,
            },
            &state.sync.config().jobs,
        )
        .map_err(|_| AppError::unavailable("Job queue unavailable"))?;

    state.db().log_audit(
        &actor,
        "categorize",
        Some("bank_transaction"),
        req.user_id,
        Some(&format!("limit={}", limit)),
    )?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}
