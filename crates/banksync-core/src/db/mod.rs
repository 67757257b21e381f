//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `users` - Local users and their aggregator identity
//! - `connections` - Bank connections and lifecycle persistence
//! - `accounts` - Bank accounts synchronized from the aggregator
//! - `bank_transactions` - Raw import records and the idempotent insert primitive
//! - `transactions` - Canonical ledger transactions
//! - `categories` - Categories and learned categorization patterns
//! - `diagnostics` - Backlog and connection health reporting
//! - `audit` - Audit trail for administrative and webhook-driven changes

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{Error, Result};

mod accounts;
mod audit;
mod bank_transactions;
mod categories;
mod connections;
mod diagnostics;
mod transactions;
mod users;

pub use bank_transactions::{BankTransactionInsert, PendingFilter};
pub use categories::{normalize_pattern, DEFAULT_CATEGORIES, PATTERN_CONFIDENCE_CAP};
pub use diagnostics::{BacklogReport, ConnectionIssue};

pub(crate) use bank_transactions::{
    get_bank_transaction_with, insert_or_fetch_bank_transaction_with, mark_bank_transaction_with,
};
pub(crate) use categories::{find_category_by_name_with, find_learned_pattern_with};
pub(crate) use transactions::{find_transaction_by_external_id_with, insert_transaction_with};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "BANKSYNC_DB_KEY";

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Changing this would invalidate all existing encrypted databases
    const APP_SALT: &[u8; 16] = b"banksync-salt-v1";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let hash = Argon2::default()
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let hash_str = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(hash_str.as_bytes()))
}

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Format a timestamp the way SQLite's CURRENT_TIMESTAMP does
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error
///
/// IMMEDIATE takes the write lock up front so read-check-write sequences
/// cannot interleave with another writer.
pub(crate) fn with_immediate_transaction<T>(
    conn: &rusqlite::Connection,
    f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Create a new database connection pool with encryption
    ///
    /// Requires `BANKSYNC_DB_KEY` to be set. Use `new_unencrypted()` for
    /// development/testing without encryption.
    pub fn new(path: &str) -> Result<Self> {
        match std::env::var(DB_KEY_ENV).ok() {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Create a new unencrypted database connection pool
    pub fn new_unencrypted(path: &str) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Create a new database with an explicit encryption key
    pub fn new_with_key(path: &str, passphrase: Option<&str>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);

        let key_pragma = passphrase
            .map(|pass| derive_key(pass).map(|key| format!("PRAGMA key = 'x\"{}\"';", key)))
            .transpose()?;

        // Every pooled connection needs the key, foreign keys and a busy timeout
        let manager = manager.with_init(move |conn| {
            if let Some(pragma) = &key_pragma {
                conn.execute_batch(pragma)?;
            }
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.busy_timeout(std::time::Duration::from_secs(10))?;
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` because every pooled
    /// connection must see the same data.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "banksync_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        let _ = std::fs::remove_file(&path);

        Self::new_unencrypted(&path)
    }

    /// Check if the database is encrypted
    pub fn is_encrypted(&self) -> Result<bool> {
        let conn = self.conn()?;
        // SQLCipher sets cipher_version if encryption is active
        let result: rusqlite::Result<String> =
            conn.query_row("PRAGMA cipher_version;", [], |row| row.get(0));
        Ok(result.is_ok() && std::env::var(DB_KEY_ENV).is_ok())
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the single writer
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                external_user_id TEXT NOT NULL UNIQUE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- One row per (user, aggregator item); soft-deleted on disconnect
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                item_id TEXT NOT NULL,
                provider_name TEXT,
                bank_name TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                is_active INTEGER NOT NULL DEFAULT 1,
                last_sync_at DATETIME,
                last_successful_sync_at DATETIME,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_error_at DATETIME,
                auto_sync INTEGER NOT NULL DEFAULT 1,
                sync_frequency_hours INTEGER NOT NULL DEFAULT 24,
                deleted_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_user_item
                ON connections(user_id, item_id);
            CREATE INDEX IF NOT EXISTS idx_connections_item ON connections(item_id);
            CREATE INDEX IF NOT EXISTS idx_connections_status ON connections(status);

            CREATE TABLE IF NOT EXISTS bank_accounts (
                id INTEGER PRIMARY KEY,
                connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
                external_account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                account_type TEXT NOT NULL DEFAULT 'checking',
                balance REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'EUR',
                iban_masked TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_balance_update DATETIME,
                metadata TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_bank_accounts_connection_external
                ON bank_accounts(connection_id, external_account_id);

            -- Categories: user_id NULL marks a global category
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'expense',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_owner_name
                ON categories(COALESCE(user_id, 0), name);

            -- Canonical ledger
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                bank_account_id INTEGER REFERENCES bank_accounts(id) ON DELETE SET NULL,
                transaction_type TEXT NOT NULL,
                amount REAL NOT NULL,
                description TEXT NOT NULL,
                date DATE NOT NULL,
                status TEXT NOT NULL DEFAULT 'completed',
                is_imported INTEGER NOT NULL DEFAULT 0,
                auto_categorized INTEGER NOT NULL DEFAULT 0,
                from_aggregator INTEGER NOT NULL DEFAULT 0,
                external_id TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- At most one ledger entry per (user, external id); NULLs never collide
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_user_external
                ON transactions(user_id, external_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions(user_id, date);

            -- Raw import records
            CREATE TABLE IF NOT EXISTS bank_transactions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
                bank_account_id INTEGER NOT NULL REFERENCES bank_accounts(id) ON DELETE CASCADE,
                external_transaction_id TEXT NOT NULL,
                amount REAL NOT NULL,
                description TEXT NOT NULL,
                merchant_name TEXT,
                merchant_category TEXT,
                transaction_date DATE NOT NULL,
                value_date DATE,
                balance_after REAL,
                raw_data TEXT,
                processing_status TEXT NOT NULL DEFAULT 'imported',
                suggested_category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                confidence_score REAL NOT NULL DEFAULT 0.5,
                transaction_id INTEGER REFERENCES transactions(id) ON DELETE SET NULL,
                converted_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Dedup is scoped to the user, not the connection
            CREATE UNIQUE INDEX IF NOT EXISTS idx_bank_transactions_user_external
                ON bank_transactions(user_id, external_transaction_id);
            CREATE INDEX IF NOT EXISTS idx_bank_transactions_status
                ON bank_transactions(processing_status);
            CREATE INDEX IF NOT EXISTS idx_bank_transactions_connection
                ON bank_transactions(connection_id);

            CREATE TABLE IF NOT EXISTS categorization_patterns (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                pattern TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                match_count INTEGER NOT NULL DEFAULT 1,
                confidence REAL NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_patterns_user_pattern_category
                ON categorization_patterns(user_id, pattern, category_id);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT,
                entity_id INTEGER,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp);
            "#,
        )?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
