//! Banksync Web Server
//!
//! Axum-based HTTP surface for banksync:
//! - Aggregator webhook receiver (parse, enqueue, reply 202)
//! - Small operator API under `/api` (connections, diagnostics, batch jobs)
//! - Worker pool and auto-sync scheduler bootstrap
//!
//! Security features:
//! - Bearer API keys on `/api` (secure by default, use --no-auth for local dev)
//! - Optional shared secret on the webhook endpoint
//! - Constant-time comparison for both
//! - Sanitized error responses

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use banksync_core::jobs::{JobQueue, WorkerPool};
use banksync_core::SyncService;

mod handlers;
mod scheduler;

pub use scheduler::{enqueue_due_syncs, start_auto_sync_scheduler, AutoSyncScheduleConfig};

/// Maximum accepted webhook body (64 KB)
pub const MAX_WEBHOOK_BODY: usize = 64 * 1024;

/// Maximum page size for list endpoints
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Authorization header for API key auth
const AUTHORIZATION_HEADER: &str = "authorization";

/// Header carrying the webhook shared secret
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Whether `/api` requires an API key (secure by default)
    pub require_auth: bool,
    /// Allowed CORS origins (empty = same-origin only)
    pub allowed_origins: Vec<String>,
    /// API keys accepted as "Bearer <key>"
    pub api_keys: Vec<String>,
    /// Shared secret the aggregator sends with each webhook
    pub webhook_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            allowed_origins: vec![],
            api_keys: vec![],
            webhook_secret: None,
        }
    }
}

impl ServerConfig {
    /// Read `BANKSYNC_API_KEYS`, `BANKSYNC_WEBHOOK_SECRET` and `BANKSYNC_ALLOWED_ORIGINS`
    pub fn from_env(require_auth: bool) -> Self {
        Self {
            require_auth,
            allowed_origins: std::env::var("BANKSYNC_ALLOWED_ORIGINS")
                .map(|s| parse_list(&s))
                .unwrap_or_default(),
            api_keys: std::env::var("BANKSYNC_API_KEYS")
                .map(|s| parse_list(&s))
                .unwrap_or_default(),
            webhook_secret: std::env::var("BANKSYNC_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Split a comma-separated list, dropping blanks
pub fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Shared application state
pub struct AppState {
    pub sync: SyncService,
    /// Where handlers and the scheduler put background work
    pub queue: Arc<dyn JobQueue>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn db(&self) -> &banksync_core::Database {
        self.sync.db()
    }
}

/// Authentication middleware for `/api` - Bearer API keys only
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.require_auth {
        return next.run(request).await;
    }

    let api_key_valid = request
        .headers()
        .get(AUTHORIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|key| validate_secret(key, &state.config.api_keys))
        .unwrap_or(false);

    if api_key_valid {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Unauthorized request - no valid API key");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "Authentication required"
        })),
    )
        .into_response()
}

/// Check a provided secret against the accepted values in constant time
pub(crate) fn validate_secret(provided: &str, valid: &[String]) -> bool {
    use subtle::ConstantTimeEq;

    let provided_bytes = provided.as_bytes();
    valid.iter().any(|key| {
        let key_bytes = key.as_bytes();
        provided_bytes.len() == key_bytes.len() && bool::from(provided_bytes.ct_eq(key_bytes))
    })
}

/// Actor name recorded in the audit log
pub fn get_actor(headers: &axum::http::HeaderMap) -> String {
    if headers
        .get(AUTHORIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .is_some()
    {
        return "api-key".to_string();
    }
    "local-dev".to_string()
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Build the router over an existing job queue
pub fn create_router(sync: SyncService, queue: Arc<dyn JobQueue>, config: ServerConfig) -> Router {
    let state = Arc::new(AppState {
        sync,
        queue,
        config: config.clone(),
    });

    let api_routes = Router::new()
        .route("/connections", get(handlers::list_connections))
        .route(
            "/connections/:id",
            get(handlers::get_connection).delete(handlers::disconnect_connection),
        )
        .route("/connections/:id/sync", post(handlers::trigger_sync))
        .route("/diagnostics", get(handlers::get_diagnostics))
        .route("/conversions", post(handlers::start_conversion))
        .route("/categorizations", post(handlers::start_categorization))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let cors = {
        let base = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
        if config.allowed_origins.is_empty() {
            base
        } else {
            let origins: Vec<HeaderValue> = config
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            base.allow_origin(origins)
        }
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/aggregator", post(handlers::receive_webhook))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Security headers
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
}

/// Start the worker pool, the scheduler and the HTTP server
///
/// Returns after a Ctrl-C, once in-flight jobs have finished.
pub async fn serve_with_config(
    sync: SyncService,
    host: &str,
    port: u16,
    config: ServerConfig,
) -> anyhow::Result<()> {
    if !config.require_auth {
        warn!("⚠️  Authentication disabled - do not expose to network!");
    } else if config.api_keys.is_empty() {
        warn!("⚠️  No API keys configured (BANKSYNC_API_KEYS) - /api will reject every request");
    }
    if config.webhook_secret.is_none() {
        warn!("⚠️  BANKSYNC_WEBHOOK_SECRET not set - webhook endpoint accepts unsigned calls");
    }

    let mut jobs = sync.config().jobs.clone();
    if let Some(workers) = std::env::var("BANKSYNC_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        jobs.workers = workers;
    }

    let pool = WorkerPool::start(sync.clone(), &jobs);
    let queue: Arc<dyn JobQueue> = Arc::new(pool.queue());

    if let Some(schedule) = AutoSyncScheduleConfig::from_env() {
        start_auto_sync_scheduler(sync.db().clone(), queue.clone(), jobs.clone(), schedule);
    }

    let app = create_router(sync, queue, config);
    let addr = format!("{}:{}", host, port);
    info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    pool.shutdown().await;
    Ok(())
}

// ============================================================================
// Error Handling
// ============================================================================

/// Error returned by handlers: a status, a client-safe message and the cause
pub struct AppError {
    status: StatusCode,
    message: String,
    internal: Option<anyhow::Error>,
}

impl AppError {
    fn new(status: StatusCode, msg: &str) -> Self {
        Self {
            status,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn bad_request(msg: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn not_found(msg: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn conflict(msg: &str) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }

    pub fn unavailable(msg: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, msg)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(err) = &self.internal {
            error!(status = %self.status, error = %err, "Request failed");
        }

        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<banksync_core::Error> for AppError {
    fn from(err: banksync_core::Error) -> Self {
        use banksync_core::Error;

        match err {
            Error::NotFound(what) => Self::not_found(&format!("Not found: {}", what)),
            Error::PersistenceConflict(_) => Self::conflict("Conflicting update, retry later"),
            Error::InvalidData(msg) => Self::bad_request(&msg),
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                // Never leak storage or aggregator details to the client
                message: "An internal error occurred".to_string(),
                internal: Some(other.into()),
            },
        }
    }
}
