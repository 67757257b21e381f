//! Connection handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{get_actor, AppError, AppState, SuccessResponse};
use banksync_core::models::Connection;
use banksync_core::Job;

/// Query parameters for listing connections
#[derive(Debug, Deserialize)]
pub struct ConnectionsQuery {
    pub user_id: Option<i64>,
    #[serde(default)]
    pub include_deleted: bool,
}

/// GET /api/connections - List connections, optionally for one user
pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectionsQuery>,
    request: Request,
) -> Result<Json<Vec<Connection>>, AppError> {
    let actor = get_actor(request.headers());

    let connections = state
        .db()
        .list_connections(params.user_id, params.include_deleted)?;

    // Audit log - read access
    state.db().log_audit(
        &actor,
        "list",
        Some("connection"),
        None,
        Some(&format!("count={}", connections.len())),
    )?;

    Ok(Json(connections))
}

/// GET /api/connections/:id - Get one connection
pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Connection>, AppError> {
    let connection = state
        .db()
        .get_connection(id)?
        .ok_or_else(|| AppError::not_found("Connection not found"))?;

    Ok(Json(connection))
}

/// POST /api/connections/:id/sync - Queue a sync for one connection
pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = get_actor(request.headers());

    let connection = state
        .db()
        .get_connection(id)?
        .ok_or_else(|| AppError::not_found("Connection not found"))?;
    if connection.is_deleted() {
        return Err(AppError::conflict("Connection has been disconnected"));
    }

    state
        .queue
        .submit(
            Job::SyncConnection { connection_id: id },
            &state.sync.config().jobs,
        )
        .map_err(|_| AppError::unavailable("Job queue unavailable"))?;

    state
        .db()
        .log_audit(&actor, "sync", Some("connection"), Some(id), None)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "queued": true, "connection_id": id })),
    ))
}

/// DELETE /api/connections/:id - Soft-delete a connection
pub async fn disconnect_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    request: Request,
) -> Result<Json<SuccessResponse>, AppError> {
    let actor = get_actor(request.headers());

    if state.db().get_connection(id)?.is_none() {
        return Err(AppError::not_found("Connection not found"));
    }

    state
        .db()
        .disconnect_connection(id, &state.sync.config().lifecycle)?;

    // Audit log
    state
        .db()
        .log_audit(&actor, "disconnect", Some("connection"), Some(id), None)?;

    Ok(Json(SuccessResponse { success: true }))
}
