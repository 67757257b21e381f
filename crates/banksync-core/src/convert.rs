//! Conversion pipeline: raw import records -> canonical ledger transactions
//!
//! Each record is promoted inside its own `BEGIN IMMEDIATE` unit:
//! re-check status, create the ledger entry, categorize it, mark the record
//! `converted`. A failure rolls back that record only and the batch goes on.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::categorize::{CategorizationInput, Categorizer};
use crate::db::{
    find_transaction_by_external_id_with, get_bank_transaction_with, insert_transaction_with,
    mark_bank_transaction_with, with_immediate_transaction, Database, PendingFilter,
};
use crate::error::{Error, Result};
use crate::models::{
    NewTransaction, ProcessingStatus, TransactionStatus, TransactionType,
};

/// Batch conversion settings
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub user_id: Option<i64>,
    /// Maximum number of records to process; `None` drains the backlog
    pub limit: Option<usize>,
    pub chunk_size: usize,
    /// Run every unit, then roll it back
    pub dry_run: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            user_id: None,
            limit: None,
            chunk_size: 100,
            dry_run: false,
        }
    }
}

/// What happened to one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Converted { transaction_id: i64, categorized: bool },
    /// Someone else converted it first
    AlreadyConverted,
    /// A ledger entry with the same external id already existed; linked to it
    Duplicate { transaction_id: i64 },
    /// Record is `ignored` or `duplicate` already
    NotConvertible { status: ProcessingStatus },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionFailure {
    pub record_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionSummary {
    pub processed: usize,
    pub converted: usize,
    pub categorized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub dry_run: bool,
    pub failures: Vec<ConversionFailure>,
}

impl ConversionSummary {
    fn record(&mut self, record_id: i64, result: std::result::Result<ConversionOutcome, ConversionFailure>) {
        self.processed += 1;
        match result {
            Ok(ConversionOutcome::Converted { categorized, .. }) => {
                self.converted += 1;
                if categorized {
                    self.categorized += 1;
                }
            }
            Ok(ConversionOutcome::Duplicate { .. }) => self.duplicates += 1,
            Ok(ConversionOutcome::AlreadyConverted)
            | Ok(ConversionOutcome::NotConvertible { .. }) => self.skipped += 1,
            Err(failure) => {
                warn!(record_id, reason = %failure.reason, "Conversion failed");
                self.failed += 1;
                self.failures.push(failure);
            }
        }
    }
}

/// Run `f` in an immediate transaction that is committed, or always rolled back
fn run_unit<T>(
    conn: &rusqlite::Connection,
    commit: bool,
    f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
) -> Result<T> {
    if commit {
        return with_immediate_transaction(conn, f);
    }
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = f(conn);
    conn.execute_batch("ROLLBACK")?;
    result
}

pub struct ConversionPipeline {
    db: Database,
    categorizer: Categorizer,
}

impl ConversionPipeline {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            categorizer: Categorizer::canonical(),
        }
    }

    /// Convert a single record and commit
    pub fn convert_one(&self, record_id: i64) -> Result<ConversionOutcome> {
        let conn = self.db.conn()?;
        run_unit(&conn, true, |conn| self.convert_unit(conn, record_id))
    }

    /// Convert specific records (inline conversion after import)
    pub fn convert_records(&self, record_ids: &[i64]) -> Result<ConversionSummary> {
        let conn = self.db.conn()?;
        let mut summary = ConversionSummary::default();
        for &record_id in record_ids {
            let result = run_unit(&conn, true, |conn| self.convert_unit(conn, record_id))
                .map_err(|e| ConversionFailure {
                    record_id,
                    reason: e.to_string(),
                });
            summary.record(record_id, result);
        }
        Ok(summary)
    }

    /// Drain convertible records in keyset-paged chunks
    pub fn run(&self, options: &ConversionOptions) -> Result<ConversionSummary> {
        let chunk_size = options.chunk_size.max(1);
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut summary = ConversionSummary {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let mut filter = PendingFilter::convertible(options.user_id, chunk_size);

        while summary.processed < limit {
            filter.limit = chunk_size.min(limit - summary.processed);
            let records = self.db.list_pending_bank_transactions(&filter)?;
            if records.is_empty() {
                break;
            }

            let conn = self.db.conn()?;
            for record in &records {
                filter.after_id = record.id;
                let result = run_unit(&conn, !options.dry_run, |conn| {
                    self.convert_unit(conn, record.id)
                })
                .map_err(|e| ConversionFailure {
                    record_id: record.id,
                    reason: e.to_string(),
                });
                summary.record(record.id, result);
            }

            debug!(
                processed = summary.processed,
                converted = summary.converted,
                failed = summary.failed,
                "Conversion chunk done"
            );
        }

        info!(
            processed = summary.processed,
            converted = summary.converted,
            categorized = summary.categorized,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            failed = summary.failed,
            dry_run = options.dry_run,
            "Conversion finished"
        );
        Ok(summary)
    }

    /// The unit of work for one record; runs inside a transaction
    fn convert_unit(&self, conn: &rusqlite::Connection, record_id: i64) -> Result<ConversionOutcome> {
        let record = get_bank_transaction_with(conn, record_id)?
            .ok_or_else(|| Error::NotFound(format!("bank transaction {}", record_id)))?;

        match record.processing_status {
            ProcessingStatus::Converted => return Ok(ConversionOutcome::AlreadyConverted),
            status if !status.is_convertible() => {
                return Ok(ConversionOutcome::NotConvertible { status })
            }
            _ => {}
        }

        if let Some(existing) =
            find_transaction_by_external_id_with(conn, record.user_id, &record.external_transaction_id)?
        {
            mark_bank_transaction_with(conn, record.id, ProcessingStatus::Duplicate, Some(existing.id))?;
            return Ok(ConversionOutcome::Duplicate {
                transaction_id: existing.id,
            });
        }

        let suggestion = self.categorizer.categorize(
            conn,
            &CategorizationInput {
                user_id: record.user_id,
                description: &record.description,
                merchant_name: record.merchant_name.as_deref(),
                merchant_category: record.merchant_category.as_deref(),
            },
        );
        let category_id = suggestion.category_id.or(record.suggested_category_id);

        let transaction_id = insert_transaction_with(
            conn,
            &NewTransaction {
                user_id: record.user_id,
                category_id,
                bank_account_id: Some(record.bank_account_id),
                transaction_type: TransactionType::from_amount(record.amount),
                amount: record.amount.abs(),
                description: record.description.clone(),
                date: record.transaction_date,
                status: TransactionStatus::Completed,
                is_imported: true,
                auto_categorized: category_id.is_some(),
                from_aggregator: true,
                external_id: Some(record.external_transaction_id.clone()),
            },
        )?;

        mark_bank_transaction_with(conn, record.id, ProcessingStatus::Converted, Some(transaction_id))?;

        Ok(ConversionOutcome::Converted {
            transaction_id,
            categorized: category_id.is_some(),
        })
    }
}
