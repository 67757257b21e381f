//! Sync orchestration: token -> item check -> accounts -> transactions
//!
//! Every write on this path is an upsert or a guarded insert, so concurrent
//! syncs of the same connection (webhook trigger racing the scheduler)
//! converge without locks.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregator::{AccessToken, Aggregator, AggregatorClient, RemoteAccount, RemoteTransaction};
use crate::categorize::{CategorizationInput, Categorizer};
use crate::config::SyncConfig;
use crate::convert::ConversionPipeline;
use crate::db::{BankTransactionInsert, Database};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleEvent;
use crate::models::{
    AccountType, BankAccount, Connection, ConnectionStatus, NewBankAccount, NewBankTransaction,
};
use crate::token::TokenProvider;

/// Counters for one connection's transaction import
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub accounts_seen: usize,
    pub accounts_failed: usize,
    pub imported: usize,
    pub relinked: usize,
    pub existing: usize,
    pub failed: usize,
    /// Ids of the records created by this run
    #[serde(skip)]
    pub new_record_ids: Vec<i64>,
    /// Whether every failed account fetch looked transient
    #[serde(skip)]
    all_failures_retryable: bool,
    /// Whether a fetch failed because the token was refused
    #[serde(skip)]
    token_rejected: bool,
}

impl ImportSummary {
    /// True when there were accounts and none of them could be fetched
    pub fn all_accounts_failed(&self) -> bool {
        self.accounts_seen > 0 && self.accounts_failed == self.accounts_seen
    }
}

/// Outcome of `sync_connection`
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub connection_id: i64,
    /// Set when the connection was not eligible for sync
    pub skipped: Option<String>,
    pub status: ConnectionStatus,
    pub accounts_synced: usize,
    pub import: ImportSummary,
    pub converted: usize,
}

impl SyncReport {
    fn skipped(connection: &Connection, reason: &str) -> Self {
        Self {
            connection_id: connection.id,
            skipped: Some(reason.to_string()),
            status: connection.status,
            accounts_synced: 0,
            import: ImportSummary::default(),
            converted: 0,
        }
    }
}

/// Runs syncs for connections against the aggregator
#[derive(Clone)]
pub struct SyncService {
    db: Database,
    aggregator: AggregatorClient,
    tokens: Arc<TokenProvider>,
    config: Arc<SyncConfig>,
    categorizer: Arc<Categorizer>,
}

impl SyncService {
    pub fn new(db: Database, aggregator: AggregatorClient, config: SyncConfig) -> Self {
        Self {
            tokens: Arc::new(TokenProvider::new(config.token_refresh_margin)),
            categorizer: Arc::new(Categorizer::raw_import()),
            config: Arc::new(config),
            aggregator,
            db,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Drop the cached token when the aggregator refused it
    ///
    /// Cached tokens live for hours; without this every sync in that window
    /// would fail with the same revoked token.
    fn forget_rejected_token(&self, external_user_id: &str, e: &Error) {
        if e.is_token_rejected() {
            warn!(external_user_id, error = %e, "Aggregator refused cached token, dropping it");
            self.tokens.invalidate(external_user_id);
        }
    }

    fn fail(&self, connection_id: i64, event: LifecycleEvent) -> Result<Connection> {
        self.db
            .apply_lifecycle_event(connection_id, &self.config.lifecycle, &event)
    }

    /// Full sync of one connection with lifecycle bookkeeping
    ///
    /// Ineligible connections (soft-deleted, expired, disconnected) are
    /// skipped, not failed. Disabled connections still run here; the
    /// scheduler never picks them, so reaching this means someone asked. Errors that count against the connection are
    /// recorded before being returned, so the job queue can retry.
    pub async fn sync_connection(&self, connection_id: i64) -> Result<SyncReport> {
        let connection = self
            .db
            .get_connection(connection_id)?
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;

        if connection.is_deleted() {
            return Ok(SyncReport::skipped(&connection, "connection is deleted"));
        }
        if !connection.status.accepts_requested_sync() {
            debug!(connection_id, status = %connection.status, "Skipping sync");
            return Ok(SyncReport::skipped(
                &connection,
                &format!("status is {}", connection.status),
            ));
        }

        let user = self
            .db
            .get_user(connection.user_id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", connection.user_id)))?;

        info!(
            connection_id,
            item_id = %connection.item_id,
            backend = self.aggregator.name(),
            "Starting sync"
        );

        let token = match self
            .tokens
            .token_for(&self.aggregator, &user.external_user_id)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                self.fail(connection_id, LifecycleEvent::sync_failed(e.to_string()))?;
                return Err(e);
            }
        };

        match self.aggregator.get_item(&token, &connection.item_id).await {
            Ok(item) if item.is_healthy() => {
                if item.bank_name.is_some() || item.provider_name.is_some() {
                    self.db.set_bank_metadata(
                        connection_id,
                        item.bank_name.as_deref(),
                        item.provider_name.as_deref(),
                    )?;
                }
            }
            Ok(item) => {
                let e = Error::ItemUnhealthy(item.describe());
                self.fail(connection_id, LifecycleEvent::sync_failed(e.to_string()))?;
                return Err(e);
            }
            Err(e) => {
                self.forget_rejected_token(&user.external_user_id, &e);
                return Err(self.record_failure(connection_id, e)?);
            }
        }

        let accounts_synced = match self.sync_accounts(&connection, &token).await {
            Ok(n) => n,
            Err(e @ Error::ItemNotFound(_)) => return Err(self.record_failure(connection_id, e)?),
            Err(e) => {
                self.forget_rejected_token(&user.external_user_id, &e);
                // Best-effort: import still runs against the stored accounts
                warn!(connection_id, error = %e, "Account sync failed, continuing with stored accounts");
                0
            }
        };

        let import = self.import_transactions(&connection, &token).await?;
        if import.token_rejected {
            self.tokens.invalidate(&user.external_user_id);
        }

        if import.all_accounts_failed() && import.all_failures_retryable {
            let e = Error::TransientNetwork(format!(
                "transaction fetch failed for all {} accounts",
                import.accounts_seen
            ));
            self.fail(connection_id, LifecycleEvent::sync_failed(e.to_string()))?;
            return Err(e);
        }

        let updated = self.fail(connection_id, LifecycleEvent::sync_succeeded())?;

        let converted = if self.config.import.convert_on_import && !import.new_record_ids.is_empty() {
            ConversionPipeline::new(self.db.clone())
                .convert_records(&import.new_record_ids)?
                .converted
        } else {
            0
        };

        info!(
            connection_id,
            accounts = accounts_synced,
            imported = import.imported,
            relinked = import.relinked,
            existing = import.existing,
            failed = import.failed,
            converted,
            "Sync complete"
        );

        Ok(SyncReport {
            connection_id,
            skipped: None,
            status: updated.status,
            accounts_synced,
            import,
            converted,
        })
    }

    /// Record a failed step: 404 expires the connection, anything else counts
    fn record_failure(&self, connection_id: i64, e: Error) -> Result<Error> {
        let event = match &e {
            Error::ItemNotFound(_) => LifecycleEvent::item_not_found(),
            other => LifecycleEvent::sync_failed(other.to_string()),
        };
        self.fail(connection_id, event)?;
        Ok(e)
    }

    /// Upsert every account of the connection's item
    ///
    /// Accounts absent from the response are kept as they are.
    pub async fn sync_accounts(&self, connection: &Connection, token: &AccessToken) -> Result<usize> {
        let remote = self
            .aggregator
            .list_accounts(token, &connection.item_id)
            .await?;

        let mut synced = 0;
        for account in &remote {
            match self.db.upsert_bank_account(connection.id, &to_new_account(account)) {
                Ok(_) => synced += 1,
                Err(e) => warn!(
                    connection_id = connection.id,
                    account_id = %account.id,
                    error = %e,
                    "Failed to store account"
                ),
            }
        }

        debug!(connection_id = connection.id, synced, "Accounts synced");
        Ok(synced)
    }

    /// Import the trailing window of transactions for every stored account
    ///
    /// One failing account or record never stops the others.
    pub async fn import_transactions(
        &self,
        connection: &Connection,
        token: &AccessToken,
    ) -> Result<ImportSummary> {
        let accounts: Vec<BankAccount> = self
            .db
            .list_bank_accounts(connection.id)?
            .into_iter()
            .filter(|a| a.is_active)
            .collect();

        let since = Utc::now().date_naive() - chrono::Duration::days(self.config.import.window_days);
        let mut summary = ImportSummary {
            all_failures_retryable: true,
            ..Default::default()
        };

        for account in &accounts {
            summary.accounts_seen += 1;

            let remote = match self
                .aggregator
                .list_transactions(
                    token,
                    &account.external_account_id,
                    since,
                    self.config.import.page_size,
                )
                .await
            {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(
                        connection_id = connection.id,
                        account_id = account.id,
                        error = %e,
                        "Failed to fetch transactions"
                    );
                    summary.accounts_failed += 1;
                    summary.all_failures_retryable &= e.is_retryable();
                    summary.token_rejected |= e.is_token_rejected();
                    continue;
                }
            };

            for tx in remote.iter().filter(|tx| !tx.deleted) {
                match self.import_one(connection, account, tx) {
                    Ok(BankTransactionInsert::Inserted(id)) => {
                        summary.imported += 1;
                        summary.new_record_ids.push(id);
                    }
                    Ok(BankTransactionInsert::Relinked(_)) => summary.relinked += 1,
                    Ok(BankTransactionInsert::Existing(_)) => summary.existing += 1,
                    Err(e) => {
                        warn!(
                            connection_id = connection.id,
                            external_id = %tx.id,
                            error = %e,
                            "Failed to import transaction"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    fn import_one(
        &self,
        connection: &Connection,
        account: &BankAccount,
        tx: &RemoteTransaction,
    ) -> Result<BankTransactionInsert> {
        let description = tx.description();
        let conn = self.db.conn()?;

        let raw_data = match serde_json::to_string(tx) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(
                    connection_id = connection.id,
                    external_id = %tx.id,
                    error = %e,
                    "Failed to serialize raw transaction, storing without payload"
                );
                None
            }
        };

        let suggestion = self.categorizer.categorize(
            &conn,
            &CategorizationInput {
                user_id: connection.user_id,
                description: &description,
                merchant_name: tx.merchant_name.as_deref(),
                merchant_category: tx.merchant_category.as_deref(),
            },
        );

        let record = NewBankTransaction {
            user_id: connection.user_id,
            connection_id: connection.id,
            bank_account_id: account.id,
            external_transaction_id: tx.id.clone(),
            amount: tx.amount,
            description,
            merchant_name: tx.merchant_name.clone(),
            merchant_category: tx.merchant_category.clone(),
            transaction_date: tx.effective_date(),
            value_date: tx.value_date,
            balance_after: tx.balance_after,
            raw_data,
            suggested_category_id: suggestion.category_id,
            confidence_score: suggestion.confidence,
        };

        crate::db::insert_or_fetch_bank_transaction_with(&conn, &record)
    }

    /// Fetch and store the bank display metadata of a freshly refreshed item
    pub async fn finalize_connection(&self, connection: &Connection) -> Result<()> {
        let user = self
            .db
            .get_user(connection.user_id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", connection.user_id)))?;
        let token = self
            .tokens
            .token_for(&self.aggregator, &user.external_user_id)
            .await?;
        let item = match self.aggregator.get_item(&token, &connection.item_id).await {
            Ok(item) => item,
            Err(e) => {
                self.forget_rejected_token(&user.external_user_id, &e);
                return Err(e);
            }
        };

        self.db.set_bank_metadata(
            connection.id,
            item.bank_name.as_deref(),
            item.provider_name.as_deref(),
        )?;
        debug!(connection_id = connection.id, bank = ?item.bank_name, "Connection finalized");
        Ok(())
    }

    /// Drop a connection's unconverted records and sync again
    pub async fn force_reimport(&self, connection_id: i64) -> Result<(usize, SyncReport)> {
        let deleted = self.db.delete_unconverted_bank_transactions(connection_id)?;
        self.db.log_audit(
            "system",
            "force_reimport",
            Some("connection"),
            Some(connection_id),
            Some(&format!("deleted {} unconverted records", deleted)),
        )?;
        info!(connection_id, deleted, "Forcing reimport");

        let report = self.sync_connection(connection_id).await?;
        Ok((deleted, report))
    }
}

fn to_new_account(account: &RemoteAccount) -> NewBankAccount {
    let metadata = (!account.extra.is_empty())
        .then(|| serde_json::to_string(&account.extra).ok())
        .flatten();

    NewBankAccount {
        external_account_id: account.id.clone(),
        name: account.name.clone(),
        account_type: account
            .account_type
            .as_deref()
            .map(AccountType::from_aggregator)
            .unwrap_or_default(),
        balance: account.balance,
        currency: account
            .currency_code
            .clone()
            .unwrap_or_else(|| "EUR".to_string()),
        iban_masked: account.masked_iban(),
        metadata,
    }
}
