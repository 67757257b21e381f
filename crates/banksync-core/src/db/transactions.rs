//! Canonical ledger transaction operations

use rusqlite::{params, OptionalExtension};

use super::{parse_date, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{NewTransaction, Transaction};

const TRANSACTION_COLUMNS: &str = "id, user_id, category_id, bank_account_id, transaction_type,
    amount, description, date, status, is_imported, auto_categorized, from_aggregator,
    external_id, created_at";

/// Column order matches `TRANSACTION_COLUMNS`
fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    let transaction_type: String = row.get(4)?;
    let date: String = row.get(7)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(13)?;
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category_id: row.get(2)?,
        bank_account_id: row.get(3)?,
        transaction_type: transaction_type
            .parse()
            .unwrap_or(crate::models::TransactionType::Expense),
        amount: row.get(5)?,
        description: row.get(6)?,
        date: parse_date(&date),
        status: status.parse().unwrap_or_default(),
        is_imported: row.get::<_, i64>(9)? != 0,
        auto_categorized: row.get::<_, i64>(10)? != 0,
        from_aggregator: row.get::<_, i64>(11)? != 0,
        external_id: row.get(12)?,
        created_at: parse_datetime(&created_at),
    })
}

/// Insert a ledger entry; a (user, external_id) collision surfaces as `PersistenceConflict`
pub(crate) fn insert_transaction_with(
    conn: &rusqlite::Connection,
    tx: &NewTransaction,
) -> Result<i64> {
    let result = conn.execute(
        r#"
        INSERT INTO transactions (
            user_id, category_id, bank_account_id, transaction_type, amount, description,
            date, status, is_imported, auto_categorized, from_aggregator, external_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            tx.user_id,
            tx.category_id,
            tx.bank_account_id,
            tx.transaction_type.as_str(),
            tx.amount,
            tx.description,
            tx.date.format("%Y-%m-%d").to_string(),
            tx.status.as_str(),
            tx.is_imported as i64,
            tx.auto_categorized as i64,
            tx.from_aggregator as i64,
            tx.external_id,
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(e) if crate::error::is_unique_violation(&e) => Err(Error::PersistenceConflict(
            format!(
                "transaction with external id {:?} already exists for user {}",
                tx.external_id, tx.user_id
            ),
        )),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn find_transaction_by_external_id_with(
    conn: &rusqlite::Connection,
    user_id: i64,
    external_id: &str,
) -> Result<Option<Transaction>> {
    let tx = conn
        .query_row(
            &format!(
                "SELECT {} FROM transactions WHERE user_id = ? AND external_id = ?",
                TRANSACTION_COLUMNS
            ),
            params![user_id, external_id],
            row_to_transaction,
        )
        .optional()?;
    Ok(tx)
}

impl Database {
    /// Create a ledger entry directly (manual entry)
    pub fn insert_transaction(&self, tx: &NewTransaction) -> Result<i64> {
        let conn = self.conn()?;
        insert_transaction_with(&conn, tx)
    }

    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let tx = conn
            .query_row(
                &format!("SELECT {} FROM transactions WHERE id = ?", TRANSACTION_COLUMNS),
                params![id],
                row_to_transaction,
            )
            .optional()?;
        Ok(tx)
    }

    pub fn find_transaction_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        find_transaction_by_external_id_with(&conn, user_id, external_id)
    }

    /// List a user's ledger, newest first
    pub fn list_transactions(&self, user_id: i64, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE user_id = ? ORDER BY date DESC, id DESC LIMIT ?",
            TRANSACTION_COLUMNS
        ))?;

        let txs = stmt
            .query_map(params![user_id, limit as i64], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(txs)
    }

    /// Set a transaction's category by hand, clearing the auto-categorized flag
    pub fn set_transaction_category(&self, id: i64, category_id: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE transactions SET
                category_id = ?, auto_categorized = 0, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![category_id, id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("transaction {}", id)));
        }
        Ok(())
    }

    pub fn count_transactions(&self, user_id: Option<i64>) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE (?1 IS NULL OR user_id = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
