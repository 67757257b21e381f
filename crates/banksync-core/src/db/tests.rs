//! Database tests

use super::*;
use crate::models::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleEvent, LifecyclePolicy};
    use chrono::{Duration, NaiveDate, Utc};

    fn setup() -> (Database, i64, i64, i64) {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories().unwrap();
        let user_id = db.upsert_user("ada@example.com", "ext-ada").unwrap();
        let (connection_id, _) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();
        let account_id = db
            .upsert_bank_account(connection_id, &account("acc-1"))
            .unwrap();
        (db, user_id, connection_id, account_id)
    }

    fn account(external_id: &str) -> NewBankAccount {
        NewBankAccount {
            external_account_id: external_id.to_string(),
            name: "Compte courant".to_string(),
            account_type: AccountType::Checking,
            balance: 120.0,
            currency: "EUR".to_string(),
            iban_masked: Some("FR76 **** 1234".to_string()),
            metadata: None,
        }
    }

    fn record(
        user_id: i64,
        connection_id: i64,
        account_id: i64,
        external_id: &str,
        amount: f64,
    ) -> NewBankTransaction {
        NewBankTransaction {
            user_id,
            connection_id,
            bank_account_id: account_id,
            external_transaction_id: external_id.to_string(),
            amount,
            description: format!("CB MERCHANT {}", external_id),
            merchant_name: None,
            merchant_category: None,
            transaction_date: NaiveDate::from_ymd_opt(2024, 3, 12).unwrap(),
            value_date: None,
            balance_after: None,
            raw_data: None,
            suggested_category_id: None,
            confidence_score: 0.5,
        }
    }

    #[test]
    fn test_in_memory_db() {
        let db = Database::in_memory().unwrap();
        assert!(db.list_users().unwrap().is_empty());
        assert!(db.list_connections(None, true).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_user_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let id = db.upsert_user("ada@example.com", "ext-ada").unwrap();
        let again = db.upsert_user("ada@example.com", "ext-other").unwrap();
        assert_eq!(id, again);

        let user = db.find_user_by_external_id("ext-ada").unwrap().unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert!(db.find_user_by_external_id("ext-other").unwrap().is_none());
    }

    #[test]
    fn test_new_connection_is_pending() {
        let (db, user_id, connection_id, _) = setup();
        let connection = db.get_connection(connection_id).unwrap().unwrap();

        assert_eq!(connection.user_id, user_id);
        assert_eq!(connection.status, ConnectionStatus::Pending);
        assert_eq!(connection.error_count, 0);
        assert!(connection.auto_sync);
        assert!(connection.last_sync_at.is_none());

        let found = db.find_connection_by_item("item-1").unwrap().unwrap();
        assert_eq!(found.id, connection_id);
    }

    #[test]
    fn test_upsert_connection_revives_soft_deleted() {
        let (db, user_id, connection_id, _) = setup();
        let policy = LifecyclePolicy::default();

        db.disconnect_connection(connection_id, &policy).unwrap();
        let gone = db.get_connection(connection_id).unwrap().unwrap();
        assert!(gone.is_deleted());
        assert_eq!(gone.status, ConnectionStatus::Disconnected);
        assert!(db.find_connection_by_item("item-1").unwrap().is_none());

        let (revived_id, created) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();
        assert_eq!(revived_id, connection_id);
        assert!(!created);

        let revived = db.get_connection(connection_id).unwrap().unwrap();
        assert!(!revived.is_deleted());
        assert_eq!(revived.status, ConnectionStatus::Pending);
        assert_eq!(revived.error_count, 0);
    }

    #[test]
    fn test_upsert_connection_keeps_live_status() {
        let (db, user_id, connection_id, _) = setup();
        let policy = LifecyclePolicy::default();
        db.apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::activated())
            .unwrap();

        let (_, created) = db
            .upsert_connection(user_id, "item-1", Some("Boursorama"), 24)
            .unwrap();
        assert!(!created);

        let connection = db.get_connection(connection_id).unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.provider_name.as_deref(), Some("Boursorama"));
    }

    #[test]
    fn test_apply_lifecycle_event_persists_escalation() {
        let (db, _, connection_id, _) = setup();
        let policy = LifecyclePolicy::default();
        db.apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::sync_succeeded())
            .unwrap();

        for i in 1..=4 {
            let c = db
                .apply_lifecycle_event(
                    connection_id,
                    &policy,
                    &LifecycleEvent::sync_failed(format!("boom {}", i)),
                )
                .unwrap();
            assert_eq!(c.status, ConnectionStatus::Active);
            assert_eq!(c.error_count, i);
        }

        let c = db
            .apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::sync_failed("boom 5"))
            .unwrap();
        assert_eq!(c.status, ConnectionStatus::Error);
        assert_eq!(c.last_error.as_deref(), Some("boom 5"));

        let c = db
            .apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::sync_succeeded())
            .unwrap();
        assert_eq!(c.status, ConnectionStatus::Active);
        assert_eq!(c.error_count, 0);
        assert!(c.last_error.is_none());
    }

    #[test]
    fn test_apply_lifecycle_event_unknown_connection() {
        let db = Database::in_memory().unwrap();
        let result = db.apply_lifecycle_event(
            42,
            &LifecyclePolicy::default(),
            &LifecycleEvent::activated(),
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_bank_account_upsert() {
        let (db, _, connection_id, account_id) = setup();

        let mut updated = account("acc-1");
        updated.balance = 80.5;
        updated.iban_masked = None;
        let again = db.upsert_bank_account(connection_id, &updated).unwrap();
        assert_eq!(again, account_id);

        let accounts = db.list_bank_accounts(connection_id).unwrap();
        assert_eq!(accounts.len(), 1);
        assert!((accounts[0].balance - 80.5).abs() < 1e-9);
        // Missing IBAN in a later response keeps the stored one
        assert_eq!(accounts[0].iban_masked.as_deref(), Some("FR76 **** 1234"));
    }

    #[test]
    fn test_insert_or_fetch_is_idempotent() {
        let (db, user_id, connection_id, account_id) = setup();
        let new = record(user_id, connection_id, account_id, "tx-1", -12.3);

        let first = db.insert_or_fetch_bank_transaction(&new).unwrap();
        let second = db.insert_or_fetch_bank_transaction(&new).unwrap();

        assert!(matches!(first, BankTransactionInsert::Inserted(_)));
        assert_eq!(second, BankTransactionInsert::Existing(first.id()));

        let stored = db.get_bank_transaction(first.id()).unwrap().unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Imported);
        assert_eq!(db.list_bank_transactions(connection_id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_or_fetch_relinks_across_connections() {
        let (db, user_id, connection_id, account_id) = setup();
        let first = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-1", -4.0))
            .unwrap();

        let (new_connection, created) = db.upsert_connection(user_id, "item-2", None, 24).unwrap();
        assert!(created);
        let new_account = db.upsert_bank_account(new_connection, &account("acc-1")).unwrap();

        let relinked = db
            .insert_or_fetch_bank_transaction(&record(user_id, new_connection, new_account, "tx-1", -4.0))
            .unwrap();
        assert_eq!(relinked, BankTransactionInsert::Relinked(first.id()));

        let stored = db.get_bank_transaction(first.id()).unwrap().unwrap();
        assert_eq!(stored.connection_id, new_connection);
        assert_eq!(stored.bank_account_id, new_account);
    }

    #[test]
    fn test_dedup_is_scoped_to_user() {
        let (db, user_id, connection_id, account_id) = setup();
        let other_user = db.upsert_user("bob@example.com", "ext-bob").unwrap();
        let (other_connection, _) = db.upsert_connection(other_user, "item-9", None, 24).unwrap();
        let other_account = db.upsert_bank_account(other_connection, &account("acc-9")).unwrap();

        let a = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-1", -1.0))
            .unwrap();
        let b = db
            .insert_or_fetch_bank_transaction(&record(
                other_user,
                other_connection,
                other_account,
                "tx-1",
                -1.0,
            ))
            .unwrap();

        assert!(matches!(a, BankTransactionInsert::Inserted(_)));
        assert!(matches!(b, BankTransactionInsert::Inserted(_)));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_mark_refuses_backwards_transition() {
        let (db, user_id, connection_id, account_id) = setup();
        let id = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-1", -1.0))
            .unwrap()
            .id();

        db.mark_bank_transaction(id, ProcessingStatus::Ignored).unwrap();
        let result = db.mark_bank_transaction(id, ProcessingStatus::Categorized);
        assert!(matches!(result, Err(Error::InvalidData(_))));

        let stored = db.get_bank_transaction(id).unwrap().unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Ignored);
    }

    #[test]
    fn test_suggestion_only_applies_to_imported() {
        let (db, user_id, connection_id, account_id) = setup();
        let category = db.find_category_by_name(user_id, "Transport").unwrap().unwrap();
        let id = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-1", -1.0))
            .unwrap()
            .id();

        assert!(db
            .update_bank_transaction_suggestion(id, Some(category.id), 0.8)
            .unwrap());
        // Second call finds the record already categorized
        assert!(!db.update_bank_transaction_suggestion(id, None, 0.1).unwrap());

        let stored = db.get_bank_transaction(id).unwrap().unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Categorized);
        assert_eq!(stored.suggested_category_id, Some(category.id));
        assert!((stored.confidence_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_pending_keyset_paging() {
        let (db, user_id, connection_id, account_id) = setup();
        let ids: Vec<i64> = (0..5)
            .map(|i| {
                db.insert_or_fetch_bank_transaction(&record(
                    user_id,
                    connection_id,
                    account_id,
                    &format!("tx-{}", i),
                    -1.0,
                ))
                .unwrap()
                .id()
            })
            .collect();
        db.mark_bank_transaction(ids[1], ProcessingStatus::Ignored).unwrap();

        let mut filter = PendingFilter::convertible(Some(user_id), 2);
        let page1 = db.list_pending_bank_transactions(&filter).unwrap();
        assert_eq!(page1.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[0], ids[2]]);

        filter.after_id = page1.last().unwrap().id;
        let page2 = db.list_pending_bank_transactions(&filter).unwrap();
        assert_eq!(page2.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[3], ids[4]]);

        filter.after_id = page2.last().unwrap().id;
        assert!(db.list_pending_bank_transactions(&filter).unwrap().is_empty());

        let other = PendingFilter::convertible(Some(user_id + 100), 10);
        assert!(db.list_pending_bank_transactions(&other).unwrap().is_empty());
    }

    #[test]
    fn test_delete_unconverted_keeps_converted() {
        let (db, user_id, connection_id, account_id) = setup();
        let kept = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-1", -1.0))
            .unwrap()
            .id();
        db.insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-2", -2.0))
            .unwrap();
        db.mark_bank_transaction(kept, ProcessingStatus::Converted).unwrap();

        let deleted = db.delete_unconverted_bank_transactions(connection_id).unwrap();
        assert_eq!(deleted, 1);

        let remaining = db.list_bank_transactions(connection_id, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept);
        assert!(remaining[0].converted_at.is_some());
    }

    #[test]
    fn test_ledger_external_id_conflict() {
        let (db, user_id, _, account_id) = setup();
        let tx = NewTransaction {
            user_id,
            category_id: None,
            bank_account_id: Some(account_id),
            transaction_type: TransactionType::Expense,
            amount: 12.3,
            description: "CARREFOUR".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 12).unwrap(),
            status: TransactionStatus::Completed,
            is_imported: true,
            auto_categorized: false,
            from_aggregator: true,
            external_id: Some("tx-1".to_string()),
        };

        let id = db.insert_transaction(&tx).unwrap();
        let result = db.insert_transaction(&tx);
        assert!(matches!(result, Err(Error::PersistenceConflict(_))));

        let found = db.find_transaction_by_external_id(user_id, "tx-1").unwrap().unwrap();
        assert_eq!(found.id, id);

        // Manual entries without an external id never collide
        let manual = NewTransaction {
            external_id: None,
            ..tx
        };
        db.insert_transaction(&manual).unwrap();
        db.insert_transaction(&manual).unwrap();
        assert_eq!(db.count_transactions(Some(user_id)).unwrap(), 3);
    }

    #[test]
    fn test_seed_categories_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let first = db.seed_default_categories().unwrap();
        let second = db.seed_default_categories().unwrap();
        assert_eq!(first, DEFAULT_CATEGORIES.len());
        assert_eq!(second, 0);
    }

    #[test]
    fn test_user_categories_include_globals() {
        let (db, user_id, _, _) = setup();
        let own = db
            .create_category(Some(user_id), "Vacances", CategoryKind::Expense)
            .unwrap();
        let again = db
            .create_category(Some(user_id), "Vacances", CategoryKind::Expense)
            .unwrap();
        assert_eq!(own, again);

        let names: Vec<String> = db
            .list_categories(user_id)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(names.contains(&"Vacances".to_string()));
        assert!(names.contains(&"Alimentation".to_string()));
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("CB CARREFOUR CITY 12/03 PARIS"), "carrefour city paris");
        assert_eq!(normalize_pattern("PRLV SEPA Free Mobile"), "free mobile");
        assert_eq!(normalize_pattern("  1234 / 56 "), "");
    }

    #[test]
    fn test_learn_pattern_reinforces_up_to_cap() {
        let (db, user_id, _, _) = setup();
        let category = db.find_category_by_name(user_id, "Alimentation").unwrap().unwrap();

        let first = db.learn_pattern(user_id, "CB CARREFOUR CITY", category.id).unwrap();
        assert_eq!(first.match_count, 1);
        assert!((first.confidence - 0.6).abs() < 1e-9);

        let mut last = first;
        for _ in 0..20 {
            last = db.learn_pattern(user_id, "CB CARREFOUR CITY", category.id).unwrap();
        }
        assert_eq!(last.match_count, 21);
        assert!((last.confidence - PATTERN_CONFIDENCE_CAP).abs() < 1e-9);

        let found = db
            .find_learned_pattern(user_id, "CB CARREFOUR CITY 12/03 PARIS")
            .unwrap()
            .unwrap();
        assert_eq!(found.category_id, category.id);
        assert_eq!(db.list_patterns(user_id).unwrap().len(), 1);
    }

    #[test]
    fn test_learned_pattern_matches_whole_words_only() {
        let (db, user_id, _, _) = setup();
        let category = db.find_category_by_name(user_id, "Loisirs").unwrap().unwrap();
        db.learn_pattern(user_id, "CB ORANGE", category.id).unwrap();

        let found = db
            .find_learned_pattern(user_id, "PRLV SEPA ORANGE SA 0612")
            .unwrap()
            .unwrap();
        assert_eq!(found.pattern, "orange");
        assert!(db.find_learned_pattern(user_id, "CB ORANGE").unwrap().is_some());

        assert!(db
            .find_learned_pattern(user_id, "VIR SEPA ORANGERIE DU PARC")
            .unwrap()
            .is_none());
        assert!(db
            .find_learned_pattern(user_id, "PRLV SEPA BORANGE SAS")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_learn_pattern_rejects_empty_text() {
        let (db, user_id, _, _) = setup();
        let category = db.find_category_by_name(user_id, "Banque").unwrap().unwrap();
        let result = db.learn_pattern(user_id, "12/03", category.id);
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_needs_sync_listing() {
        let (db, _, connection_id, _) = setup();
        let policy = LifecyclePolicy::default();
        let now = Utc::now();

        // Pending connections are left to the webhook flow
        assert!(db.list_connections_needing_sync(now).unwrap().is_empty());

        db.apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::activated())
            .unwrap();
        let due = db.list_connections_needing_sync(now).unwrap();
        assert_eq!(due.len(), 1);

        db.apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::sync_succeeded())
            .unwrap();
        assert!(db.list_connections_needing_sync(Utc::now()).unwrap().is_empty());
        assert_eq!(
            db.list_connections_needing_sync(Utc::now() + Duration::hours(25))
                .unwrap()
                .len(),
            1
        );

        db.set_auto_sync(connection_id, false, None).unwrap();
        assert!(db
            .list_connections_needing_sync(Utc::now() + Duration::hours(25))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_backlog_report() {
        let (db, user_id, connection_id, account_id) = setup();
        let policy = LifecyclePolicy::default();
        let category = db.find_category_by_name(user_id, "Transport").unwrap().unwrap();

        let a = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-1", -1.0))
            .unwrap()
            .id();
        let b = db
            .insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-2", -2.0))
            .unwrap()
            .id();
        db.insert_or_fetch_bank_transaction(&record(user_id, connection_id, account_id, "tx-3", -3.0))
            .unwrap();
        db.update_bank_transaction_suggestion(a, Some(category.id), 0.7).unwrap();
        db.mark_bank_transaction(b, ProcessingStatus::Converted).unwrap();

        db.apply_lifecycle_event(connection_id, &policy, &LifecycleEvent::sync_failed("timeout"))
            .unwrap();

        let report = db.backlog_report(None, 10).unwrap();
        assert_eq!(report.unconverted, 2);
        assert_eq!(report.uncategorized, 1);
        assert_eq!(report.records_in(ProcessingStatus::Converted), 1);
        assert_eq!(report.connections_in(ConnectionStatus::Pending), 1);
        assert_eq!(
            report.oldest_unconverted,
            Some(NaiveDate::from_ymd_opt(2024, 3, 12).unwrap())
        );
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].last_error.as_deref(), Some("timeout"));

        let other = db.backlog_report(Some(user_id + 1), 10).unwrap();
        assert_eq!(other.unconverted, 0);
        assert!(other.issues.is_empty());
    }

    #[test]
    fn test_audit_log() {
        let db = Database::in_memory().unwrap();
        db.log_audit("webhook", "connection_created", Some("connection"), Some(1), Some("item-1"))
            .unwrap();
        db.log_audit("cli", "force_reimport", Some("connection"), Some(1), None)
            .unwrap();

        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "force_reimport");
        assert_eq!(entries[1].details.as_deref(), Some("item-1"));
    }
}
