//! Test utilities for banksync-core
//!
//! Provides a mock aggregator HTTP server that speaks the same endpoints as
//! the real API, for exercising `HttpAggregator` end to end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// Client secret the mock server accepts
pub const MOCK_CLIENT_SECRET: &str = "secret";

/// Item the mock server knows about; everything else is a 404
pub const MOCK_ITEM_ID: &str = "item-1";

#[derive(Default)]
struct ServerState {
    hits: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl ServerState {
    /// Count the request and answer 503 while failures are scheduled
    fn gate(&self) -> Option<Response> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let scheduled = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        scheduled.then(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": "temporarily unavailable" })),
            )
                .into_response()
        })
    }
}

/// Mock aggregator server for tests
pub struct MockAggregatorServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockAggregatorServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());

        let app = Router::new()
            .route("/v3/aggregation/authorization/token", post(handle_token))
            .route("/v3/aggregation/accounts", get(handle_accounts))
            .route("/v3/aggregation/transactions", get(handle_transactions))
            .route("/v3/aggregation/items/:id", get(handle_item))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next `n` requests with 503
    pub fn fail_next(&self, n: usize) {
        self.state.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Total requests received
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockAggregatorServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("{} not found", what) })),
    )
        .into_response()
}

async fn handle_token(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(resp) = state.gate() {
        return resp;
    }

    let secret = headers
        .get("Client-Secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if secret != MOCK_CLIENT_SECRET {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "invalid client credentials" })),
        )
            .into_response();
    }

    let user = body
        .get("external_user_id")
        .and_then(Value::as_str)
        .unwrap_or("anonymous");
    Json(json!({
        "access_token": format!("token-{}", user),
        "expires_in": 7200,
    }))
    .into_response()
}

async fn handle_accounts(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(resp) = state.gate() {
        return resp;
    }
    if params.get("item_id").map(String::as_str) != Some(MOCK_ITEM_ID) {
        return not_found("item");
    }

    Json(json!({
        "resources": [{
            "id": "acc-1",
            "name": "Compte courant",
            "balance": 1520.40,
            "currency_code": "EUR",
            "type": "checking",
            "iban": "FR7630006000011234567890189",
        }]
    }))
    .into_response()
}

async fn handle_transactions(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(resp) = state.gate() {
        return resp;
    }
    if params.get("account_id").map(String::as_str) != Some("acc-1") {
        return Json(json!({ "resources": [] })).into_response();
    }

    let since = params
        .get("since")
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .unwrap_or(NaiveDate::MIN);
    let limit = params
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(usize::MAX);

    let today = Utc::now().date_naive();
    let day = |n: i64| (today - chrono::Duration::days(n)).format("%Y-%m-%d").to_string();
    let all = vec![
        (1, json!({ "id": 9001, "amount": -12.30, "clean_description": "CARREFOUR CITY PARIS", "date": day(1), "category": "food" })),
        (2, json!({ "id": 9002, "amount": -5.00, "clean_description": "SNCF INTERNET", "date": day(2) })),
        (3, json!({ "id": 9003, "amount": 1000.00, "provider_description": "VIR SEPA ACME CORP", "date": day(3) })),
    ];

    let resources: Vec<Value> = all
        .into_iter()
        .filter(|(age, _)| today - chrono::Duration::days(*age) >= since)
        .map(|(_, tx)| tx)
        .take(limit)
        .collect();

    Json(json!({ "resources": resources })).into_response()
}

async fn handle_item(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    if let Some(resp) = state.gate() {
        return resp;
    }
    if id != MOCK_ITEM_ID {
        return not_found("item");
    }

    Json(json!({
        "id": id,
        "status": 0,
        "status_code_info": "OK",
        "provider_name": "Demo Bank",
        "bank_name": "Demo Bank",
    }))
    .into_response()
}
