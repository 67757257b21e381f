//! Error types for banksync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Token acquisition failed; fatal for the current sync attempt
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The aggregator no longer knows the item behind a connection
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Timeout, connection reset or 5xx after inline retries were exhausted
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// Uniqueness violation that the caller could not resolve as an update
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// The item exists but its last refresh failed (e.g. credentials to renew)
    #[error("Item unhealthy: {0}")]
    ItemUnhealthy(String),

    #[error("Categorization failure: {0}")]
    Categorization(String),

    #[error("Aggregator error ({status}): {message}")]
    Aggregator { status: u16, message: String },

    #[error("Timed out after {0} seconds")]
    Timeout(u64),
}

impl Error {
    /// Whether a queue-level retry has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientNetwork(_)
            | Error::Timeout(_)
            | Error::AuthenticationFailure(_)
            | Error::Pool(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Aggregator { status, .. } => *status >= 500 || *status == 429,
            Error::Database(e) => is_busy(e),
            _ => false,
        }
    }

    /// The aggregator refused the bearer token of an item-scoped call
    pub fn is_token_rejected(&self) -> bool {
        matches!(self, Error::Aggregator { status: 401 | 403, .. })
    }

    /// True for SQLite UNIQUE/PRIMARY KEY violations
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Database(e) if is_unique_violation(e))
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ),
        _ => false,
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

pub type Result<T> = std::result::Result<T, Error>;
