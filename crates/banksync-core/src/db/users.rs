//! User operations

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::User;

const USER_COLUMNS: &str = "id, email, external_user_id, created_at";

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let created_at: String = row.get(3)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        external_user_id: row.get(2)?,
        created_at: parse_datetime(&created_at),
    })
}

impl Database {
    /// Create a user, or return the existing one with the same email
    pub fn upsert_user(&self, email: &str, external_user_id: &str) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO users (email, external_user_id) VALUES (?, ?)
            ON CONFLICT(email) DO NOTHING
            "#,
            params![email, external_user_id],
        )?;

        let id = conn.query_row(
            "SELECT id FROM users WHERE email = ?",
            params![email],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
                params![id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Resolve a user by the identity the aggregator knows them by
    pub fn find_user_by_external_id(&self, external_user_id: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!(
                    "SELECT {} FROM users WHERE external_user_id = ?",
                    USER_COLUMNS
                ),
                params![external_user_id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
                params![email],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS))?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }
}
