//! Raw import record operations
//!
//! `insert_or_fetch_bank_transaction` is the dedup primitive used by the
//! importer. The unique index on (user_id, external_transaction_id) decides
//! whether a record is new; no check-then-insert window exists.

use rusqlite::{params, OptionalExtension};

use super::{format_datetime, parse_date, parse_datetime, parse_optional_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{BankTransaction, NewBankTransaction, ProcessingStatus};

/// Result of the idempotent insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankTransactionInsert {
    /// New record created with status `imported`
    Inserted(i64),
    /// Already imported under another connection of the same user; re-pointed here
    Relinked(i64),
    /// Already imported under this connection
    Existing(i64),
}

impl BankTransactionInsert {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Relinked(id) | Self::Existing(id) => *id,
        }
    }
}

/// Selection of records still waiting for categorization or conversion
#[derive(Debug, Clone)]
pub struct PendingFilter {
    pub user_id: Option<i64>,
    /// Keyset cursor: only records with a larger id
    pub after_id: i64,
    pub limit: usize,
    pub statuses: Vec<ProcessingStatus>,
}

impl PendingFilter {
    /// Records that can still be converted (`imported` or `categorized`)
    pub fn convertible(user_id: Option<i64>, limit: usize) -> Self {
        Self {
            user_id,
            after_id: 0,
            limit,
            statuses: vec![ProcessingStatus::Imported, ProcessingStatus::Categorized],
        }
    }

    /// Records not yet categorized
    pub fn uncategorized(user_id: Option<i64>, limit: usize) -> Self {
        Self {
            user_id,
            after_id: 0,
            limit,
            statuses: vec![ProcessingStatus::Imported],
        }
    }
}

const BANK_TRANSACTION_COLUMNS: &str = "id, user_id, connection_id, bank_account_id,
    external_transaction_id, amount, description, merchant_name, merchant_category,
    transaction_date, value_date, balance_after, raw_data, processing_status,
    suggested_category_id, confidence_score, transaction_id, converted_at, created_at";

fn row_to_bank_transaction(row: &rusqlite::Row) -> rusqlite::Result<BankTransaction> {
    let transaction_date: String = row.get(9)?;
    let value_date: Option<String> = row.get(10)?;
    let status: String = row.get(13)?;
    let created_at: String = row.get(18)?;
    Ok(BankTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        connection_id: row.get(2)?,
        bank_account_id: row.get(3)?,
        external_transaction_id: row.get(4)?,
        amount: row.get(5)?,
        description: row.get(6)?,
        merchant_name: row.get(7)?,
        merchant_category: row.get(8)?,
        transaction_date: parse_date(&transaction_date),
        value_date: value_date.as_deref().map(parse_date),
        balance_after: row.get(11)?,
        raw_data: row.get(12)?,
        processing_status: status.parse().unwrap_or_default(),
        suggested_category_id: row.get(14)?,
        confidence_score: row.get(15)?,
        transaction_id: row.get(16)?,
        converted_at: parse_optional_datetime(row.get(17)?),
        created_at: parse_datetime(&created_at),
    })
}

pub(crate) fn get_bank_transaction_with(
    conn: &rusqlite::Connection,
    id: i64,
) -> Result<Option<BankTransaction>> {
    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM bank_transactions WHERE id = ?",
                BANK_TRANSACTION_COLUMNS
            ),
            params![id],
            row_to_bank_transaction,
        )
        .optional()?;
    Ok(record)
}

pub(crate) fn insert_or_fetch_bank_transaction_with(
    conn: &rusqlite::Connection,
    record: &NewBankTransaction,
) -> Result<BankTransactionInsert> {
    let inserted = conn.execute(
        r#"
        INSERT INTO bank_transactions (
            user_id, connection_id, bank_account_id, external_transaction_id, amount,
            description, merchant_name, merchant_category, transaction_date, value_date,
            balance_after, raw_data, processing_status, suggested_category_id, confidence_score
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'imported', ?, ?)
        ON CONFLICT(user_id, external_transaction_id) DO NOTHING
        "#,
        params![
            record.user_id,
            record.connection_id,
            record.bank_account_id,
            record.external_transaction_id,
            record.amount,
            record.description,
            record.merchant_name,
            record.merchant_category,
            record.transaction_date.format("%Y-%m-%d").to_string(),
            record.value_date.map(|d| d.format("%Y-%m-%d").to_string()),
            record.balance_after,
            record.raw_data,
            record.suggested_category_id,
            record.confidence_score,
        ],
    )?;

    if inserted == 1 {
        return Ok(BankTransactionInsert::Inserted(conn.last_insert_rowid()));
    }

    // Same external id under another connection: reconnect after expiry
    let relinked = conn.execute(
        r#"
        UPDATE bank_transactions
        SET connection_id = ?, bank_account_id = ?, updated_at = CURRENT_TIMESTAMP
        WHERE user_id = ? AND external_transaction_id = ? AND connection_id != ?
        "#,
        params![
            record.connection_id,
            record.bank_account_id,
            record.user_id,
            record.external_transaction_id,
            record.connection_id,
        ],
    )?;

    let id: i64 = conn.query_row(
        "SELECT id FROM bank_transactions WHERE user_id = ? AND external_transaction_id = ?",
        params![record.user_id, record.external_transaction_id],
        |row| row.get(0),
    )?;

    if relinked > 0 {
        Ok(BankTransactionInsert::Relinked(id))
    } else {
        Ok(BankTransactionInsert::Existing(id))
    }
}

/// Move a record to `status`, refusing backwards transitions
pub(crate) fn mark_bank_transaction_with(
    conn: &rusqlite::Connection,
    id: i64,
    status: ProcessingStatus,
    transaction_id: Option<i64>,
) -> Result<()> {
    let current: String = conn
        .query_row(
            "SELECT processing_status FROM bank_transactions WHERE id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("bank transaction {}", id)))?;

    let current: ProcessingStatus = current.parse().map_err(Error::InvalidData)?;
    if !current.can_advance_to(status) {
        return Err(Error::InvalidData(format!(
            "bank transaction {} cannot move from {} to {}",
            id, current, status
        )));
    }

    let converted_at = matches!(status, ProcessingStatus::Converted)
        .then(|| format_datetime(&chrono::Utc::now()));

    conn.execute(
        r#"
        UPDATE bank_transactions SET
            processing_status = ?,
            transaction_id = COALESCE(?, transaction_id),
            converted_at = COALESCE(?, converted_at),
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
        params![status.as_str(), transaction_id, converted_at, id],
    )?;
    Ok(())
}

impl Database {
    /// Insert a raw import record unless the user already has it
    pub fn insert_or_fetch_bank_transaction(
        &self,
        record: &NewBankTransaction,
    ) -> Result<BankTransactionInsert> {
        let conn = self.conn()?;
        insert_or_fetch_bank_transaction_with(&conn, record)
    }

    pub fn get_bank_transaction(&self, id: i64) -> Result<Option<BankTransaction>> {
        let conn = self.conn()?;
        get_bank_transaction_with(&conn, id)
    }

    pub fn find_bank_transaction_by_external_id(
        &self,
        user_id: i64,
        external_transaction_id: &str,
    ) -> Result<Option<BankTransaction>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM bank_transactions
                     WHERE user_id = ? AND external_transaction_id = ?",
                    BANK_TRANSACTION_COLUMNS
                ),
                params![user_id, external_transaction_id],
                row_to_bank_transaction,
            )
            .optional()?;
        Ok(record)
    }

    /// List the raw records of a connection, newest first
    pub fn list_bank_transactions(
        &self,
        connection_id: i64,
        limit: usize,
    ) -> Result<Vec<BankTransaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bank_transactions WHERE connection_id = ?
             ORDER BY transaction_date DESC, id DESC LIMIT ?",
            BANK_TRANSACTION_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![connection_id, limit as i64], row_to_bank_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Page through records in the given statuses by ascending id
    pub fn list_pending_bank_transactions(
        &self,
        filter: &PendingFilter,
    ) -> Result<Vec<BankTransaction>> {
        if filter.statuses.is_empty() || filter.limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; filter.statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM bank_transactions
             WHERE processing_status IN ({}) AND id > ? AND (? IS NULL OR user_id = ?)
             ORDER BY id LIMIT ?",
            BANK_TRANSACTION_COLUMNS, placeholders
        );

        let mut values: Vec<Box<dyn rusqlite::ToSql>> = filter
            .statuses
            .iter()
            .map(|s| Box::new(s.as_str()) as Box<dyn rusqlite::ToSql>)
            .collect();
        values.push(Box::new(filter.after_id));
        values.push(Box::new(filter.user_id));
        values.push(Box::new(filter.user_id));
        values.push(Box::new(filter.limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let records = stmt
            .query_map(refs.as_slice(), row_to_bank_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record a categorization result and advance `imported` -> `categorized`
    ///
    /// Returns false when the record had already moved past `imported`.
    pub fn update_bank_transaction_suggestion(
        &self,
        id: i64,
        category_id: Option<i64>,
        confidence: f64,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE bank_transactions SET
                suggested_category_id = COALESCE(?, suggested_category_id),
                confidence_score = ?,
                processing_status = 'categorized',
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND processing_status = 'imported'
            "#,
            params![category_id, confidence, id],
        )?;
        Ok(updated > 0)
    }

    /// Move a record forward (e.g. to `ignored`)
    pub fn mark_bank_transaction(&self, id: i64, status: ProcessingStatus) -> Result<()> {
        let conn = self.conn()?;
        mark_bank_transaction_with(&conn, id, status, None)
    }

    /// Delete a connection's records that have not reached the ledger
    ///
    /// Used by force reimport; converted records keep their ledger linkage.
    pub fn delete_unconverted_bank_transactions(&self, connection_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM bank_transactions
             WHERE connection_id = ? AND processing_status IN ('imported', 'categorized', 'ignored')",
            params![connection_id],
        )?;
        Ok(deleted)
    }
}
