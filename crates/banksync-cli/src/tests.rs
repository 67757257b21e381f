//! CLI command tests
//!
//! This module contains all tests for the CLI commands.

use banksync_core::aggregator::{AggregatorClient, MockAggregator, RemoteAccount, RemoteTransaction};
use banksync_core::models::{ConnectionStatus, ProcessingStatus};
use banksync_core::LifecycleEvent;
use banksync_core::{Database, SyncConfig, SyncService};
use chrono::{Duration, Utc};

use crate::commands::{self, truncate};

const ITEM_ID: &str = "item-7";

fn setup_test_db() -> Database {
    let db = Database::in_memory().unwrap();
    db.seed_default_categories().unwrap();
    db
}

/// Create a user and one pending connection, returning (user_id, connection_id)
fn create_test_connection(db: &Database) -> (i64, i64) {
    let user_id = db.upsert_user("lea@example.com", "ext-lea").unwrap();
    let (connection_id, _) = db.upsert_connection(user_id, ITEM_ID, None, 24).unwrap();
    (user_id, connection_id)
}

fn mock_sync(db: &Database) -> SyncService {
    let today = Utc::now().date_naive();
    let mock = MockAggregator::new()
        .with_account(ITEM_ID, RemoteAccount::new("acc-7", "Compte joint", 420.0))
        .with_transactions(
            "acc-7",
            vec![
                RemoteTransaction::new("t-1", -9.90, "SNCF INTERNET", today - Duration::days(2)),
                RemoteTransaction::new("t-2", -54.20, "MONOPRIX PARIS 11", today - Duration::days(1)),
            ],
        );
    SyncService::new(db.clone(), AggregatorClient::mock(mock), SyncConfig::default())
}

// ========== Helper Tests ==========

#[test]
fn test_truncate() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("a much longer description", 10), "a much ...");
    // Multi-byte characters are not split
    assert_eq!(truncate("prélèvement sepa", 8), "préle...");
}

#[test]
fn test_format_when() {
    assert_eq!(commands::format_when(None), "never");
}

// ========== Init / Users Tests ==========

#[test]
fn test_cmd_init_seeds_categories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("banksync.db");

    commands::cmd_init(&path, true).unwrap();
    // Running init again is harmless
    commands::cmd_init(&path, true).unwrap();

    let conn = rusqlite::Connection::open(&path).unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM categories WHERE user_id IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(
        count as usize,
        banksync_core::db::DEFAULT_CATEGORIES.len()
    );
}

#[test]
fn test_cmd_users_add_and_list() {
    let db = setup_test_db();

    commands::cmd_users_add(&db, "lea@example.com", "ext-lea").unwrap();
    commands::cmd_users_add(&db, "lea@example.com", "ext-lea").unwrap();

    let users = db.list_users().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].external_user_id, "ext-lea");
    assert!(commands::cmd_users_list(&db).is_ok());
}

#[test]
fn test_cmd_users_add_requires_fields() {
    let db = setup_test_db();
    assert!(commands::cmd_users_add(&db, " ", "ext-lea").is_err());
    assert!(db.list_users().unwrap().is_empty());
}

// ========== Connection Tests ==========

#[test]
fn test_cmd_connections_list() {
    let db = setup_test_db();
    assert!(commands::cmd_connections_list(&db, None, false).is_ok());

    let (user_id, _) = create_test_connection(&db);
    assert!(commands::cmd_connections_list(&db, Some(user_id), true).is_ok());
}

#[test]
fn test_cmd_connections_disconnect() {
    let db = setup_test_db();
    let config = SyncConfig::default();
    let (_, connection_id) = create_test_connection(&db);

    commands::cmd_connections_disconnect(&db, &config, connection_id).unwrap();
    let connection = db.get_connection(connection_id).unwrap().unwrap();
    assert!(connection.is_deleted());

    // Second disconnect is a no-op
    assert!(commands::cmd_connections_disconnect(&db, &config, connection_id).is_ok());
    assert!(commands::cmd_connections_disconnect(&db, &config, 999).is_err());

    let audit = db.list_audit_log(10).unwrap();
    assert_eq!(
        audit.iter().filter(|e| e.action == "disconnect").count(),
        1
    );
}

// ========== Sync / Reimport Tests ==========

#[tokio::test]
async fn test_cmd_sync_connection() {
    let db = setup_test_db();
    let (_, connection_id) = create_test_connection(&db);
    let sync = mock_sync(&db);

    commands::cmd_sync(&sync, Some(connection_id), false)
        .await
        .unwrap();

    let records = db.list_bank_transactions(connection_id, 10).unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_cmd_sync_all_skips_disconnected() {
    let db = setup_test_db();
    let (_, connection_id) = create_test_connection(&db);
    db.disconnect_connection(connection_id, &SyncConfig::default().lifecycle)
        .unwrap();
    let sync = mock_sync(&db);

    commands::cmd_sync(&sync, None, true).await.unwrap();
    assert!(db.list_bank_transactions(connection_id, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_cmd_sync_named_connection_re_enables_disabled() {
    let db = setup_test_db();
    let (_, connection_id) = create_test_connection(&db);
    let lifecycle = SyncConfig::default().lifecycle;
    for _ in 0..10 {
        db.apply_lifecycle_event(connection_id, &lifecycle, &LifecycleEvent::sync_failed("timeout"))
            .unwrap();
    }
    let sync = mock_sync(&db);

    commands::cmd_sync(&sync, None, true).await.unwrap();
    assert!(db.list_bank_transactions(connection_id, 10).unwrap().is_empty());

    commands::cmd_sync(&sync, Some(connection_id), false)
        .await
        .unwrap();
    let connection = db.get_connection(connection_id).unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.auto_sync);
    assert_eq!(db.list_bank_transactions(connection_id, 10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_cmd_sync_requires_target() {
    let db = setup_test_db();
    let sync = mock_sync(&db);
    assert!(commands::cmd_sync(&sync, None, false).await.is_err());
}

#[tokio::test]
async fn test_cmd_reimport_requires_confirmation() {
    let db = setup_test_db();
    let (_, connection_id) = create_test_connection(&db);
    let sync = mock_sync(&db);
    commands::cmd_sync(&sync, Some(connection_id), false)
        .await
        .unwrap();
    let first = db.list_bank_transactions(connection_id, 10).unwrap()[0].id;
    db.mark_bank_transaction(first, ProcessingStatus::Ignored).unwrap();

    let ignored = |db: &Database| {
        db.list_bank_transactions(connection_id, 10)
            .unwrap()
            .iter()
            .filter(|r| r.processing_status == ProcessingStatus::Ignored)
            .count()
    };

    // Without --yes nothing changes
    commands::cmd_reimport(&sync, connection_id, false).await.unwrap();
    assert_eq!(ignored(&db), 1);

    commands::cmd_reimport(&sync, connection_id, true).await.unwrap();
    assert_eq!(db.list_bank_transactions(connection_id, 10).unwrap().len(), 2);
    assert_eq!(ignored(&db), 0);
}

#[tokio::test]
async fn test_cmd_reimport_unknown_connection() {
    let db = setup_test_db();
    let sync = mock_sync(&db);
    assert!(commands::cmd_reimport(&sync, 404, true).await.is_err());
}

// ========== Categorize / Convert / Learn Tests ==========

#[tokio::test]
async fn test_cmd_convert_dry_run_then_real() {
    let db = setup_test_db();
    let (user_id, connection_id) = create_test_connection(&db);
    let sync = mock_sync(&db);
    commands::cmd_sync(&sync, Some(connection_id), false)
        .await
        .unwrap();

    commands::cmd_convert(&db, Some(user_id), None, 50, true).unwrap();
    assert_eq!(db.count_transactions(Some(user_id)).unwrap(), 0);

    commands::cmd_convert(&db, Some(user_id), None, 50, false).unwrap();
    assert_eq!(db.count_transactions(Some(user_id)).unwrap(), 2);
    assert!(db
        .list_bank_transactions(connection_id, 10)
        .unwrap()
        .iter()
        .all(|r| r.processing_status == ProcessingStatus::Converted));
}

#[test]
fn test_cmd_convert_rejects_zero_limits() {
    let db = setup_test_db();
    assert!(commands::cmd_convert(&db, None, Some(0), 50, false).is_err());
    assert!(commands::cmd_convert(&db, None, None, 0, false).is_err());
}

#[tokio::test]
async fn test_cmd_categorize() {
    let db = setup_test_db();
    let (user_id, connection_id) = create_test_connection(&db);
    let sync = mock_sync(&db);
    commands::cmd_sync(&sync, Some(connection_id), false)
        .await
        .unwrap();

    assert!(commands::cmd_categorize(&db, Some(user_id), 100).is_ok());
    assert!(commands::cmd_categorize(&db, None, 0).is_err());
}

#[tokio::test]
async fn test_cmd_learn() {
    let db = setup_test_db();
    let (user_id, connection_id) = create_test_connection(&db);
    let sync = mock_sync(&db);
    commands::cmd_sync(&sync, Some(connection_id), false)
        .await
        .unwrap();
    commands::cmd_convert(&db, Some(user_id), None, 50, false).unwrap();

    let transaction = db
        .list_transactions(user_id, 10)
        .unwrap()
        .into_iter()
        .find(|t| t.description.contains("MONOPRIX"))
        .unwrap();

    commands::cmd_learn(&db, transaction.id, "Shopping").unwrap();

    let shopping = db.find_category_by_name(user_id, "Shopping").unwrap().unwrap();
    let updated = db.get_transaction(transaction.id).unwrap().unwrap();
    assert_eq!(updated.category_id, Some(shopping.id));
    assert_eq!(db.list_patterns(user_id).unwrap().len(), 1);

    assert!(commands::cmd_learn(&db, transaction.id, "No Such Category").is_err());
    assert!(commands::cmd_learn(&db, 9999, "Shopping").is_err());
}

#[test]
fn test_cmd_diagnose() {
    let db = setup_test_db();
    create_test_connection(&db);
    assert!(commands::cmd_diagnose(&db, None, 10).is_ok());
}
