//! Bank account operations

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, parse_optional_datetime, Database};
use crate::error::Result;
use crate::models::{BankAccount, NewBankAccount};

const ACCOUNT_COLUMNS: &str = "id, connection_id, external_account_id, name, account_type, balance,
    currency, iban_masked, is_active, last_balance_update, metadata, created_at, updated_at";

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<BankAccount> {
    let account_type: String = row.get(4)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok(BankAccount {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        external_account_id: row.get(2)?,
        name: row.get(3)?,
        account_type: account_type.parse().unwrap_or_default(),
        balance: row.get(5)?,
        currency: row.get(6)?,
        iban_masked: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        last_balance_update: parse_optional_datetime(row.get(9)?),
        metadata: row.get(10)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

impl Database {
    /// Insert or refresh an account keyed by (connection, external account id)
    ///
    /// Accounts missing from later responses are left untouched.
    pub fn upsert_bank_account(&self, connection_id: i64, account: &NewBankAccount) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO bank_accounts (
                connection_id, external_account_id, name, account_type, balance, currency,
                iban_masked, metadata, last_balance_update
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(connection_id, external_account_id) DO UPDATE SET
                name = excluded.name,
                account_type = excluded.account_type,
                balance = excluded.balance,
                currency = excluded.currency,
                iban_masked = COALESCE(excluded.iban_masked, bank_accounts.iban_masked),
                metadata = COALESCE(excluded.metadata, bank_accounts.metadata),
                is_active = 1,
                last_balance_update = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                connection_id,
                account.external_account_id,
                account.name,
                account.account_type.as_str(),
                account.balance,
                account.currency,
                account.iban_masked,
                account.metadata,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM bank_accounts WHERE connection_id = ? AND external_account_id = ?",
            params![connection_id, account.external_account_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// List the accounts of a connection
    pub fn list_bank_accounts(&self, connection_id: i64) -> Result<Vec<BankAccount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bank_accounts WHERE connection_id = ? ORDER BY id",
            ACCOUNT_COLUMNS
        ))?;

        let accounts = stmt
            .query_map(params![connection_id], row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    pub fn get_bank_account(&self, id: i64) -> Result<Option<BankAccount>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                &format!("SELECT {} FROM bank_accounts WHERE id = ?", ACCOUNT_COLUMNS),
                params![id],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }
}
