//! Connection operations and lifecycle persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{
    format_datetime, parse_datetime, parse_optional_datetime, with_immediate_transaction,
    Database,
};
use crate::error::{Error, Result};
use crate::lifecycle::{self, ConnectionState, LifecycleEvent, LifecyclePolicy};
use crate::models::Connection;

const CONNECTION_COLUMNS: &str = "id, user_id, item_id, provider_name, bank_name, status, is_active,
    last_sync_at, last_successful_sync_at, error_count, last_error, last_error_at,
    auto_sync, sync_frequency_hours, deleted_at, created_at, updated_at";

fn row_to_connection(row: &rusqlite::Row) -> rusqlite::Result<Connection> {
    let status: String = row.get(5)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    Ok(Connection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        item_id: row.get(2)?,
        provider_name: row.get(3)?,
        bank_name: row.get(4)?,
        status: status.parse().unwrap_or_default(),
        is_active: row.get::<_, i64>(6)? != 0,
        last_sync_at: parse_optional_datetime(row.get(7)?),
        last_successful_sync_at: parse_optional_datetime(row.get(8)?),
        error_count: row.get::<_, i64>(9)?.max(0) as u32,
        last_error: row.get(10)?,
        last_error_at: parse_optional_datetime(row.get(11)?),
        auto_sync: row.get::<_, i64>(12)? != 0,
        sync_frequency_hours: row.get::<_, i64>(13)?.max(1) as u32,
        deleted_at: parse_optional_datetime(row.get(14)?),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn load_connection(conn: &rusqlite::Connection, id: i64) -> Result<Option<Connection>> {
    let connection = conn
        .query_row(
            &format!("SELECT {} FROM connections WHERE id = ?", CONNECTION_COLUMNS),
            params![id],
            row_to_connection,
        )
        .optional()?;
    Ok(connection)
}

fn write_state(conn: &rusqlite::Connection, id: i64, state: &ConnectionState) -> Result<()> {
    conn.execute(
        r#"
        UPDATE connections SET
            status = ?, is_active = ?, auto_sync = ?, error_count = ?,
            last_error = ?, last_error_at = ?, last_sync_at = ?, last_successful_sync_at = ?,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
        params![
            state.status.as_str(),
            state.is_active as i64,
            state.auto_sync as i64,
            state.error_count as i64,
            state.last_error,
            state.last_error_at.as_ref().map(format_datetime),
            state.last_sync_at.as_ref().map(format_datetime),
            state.last_successful_sync_at.as_ref().map(format_datetime),
            id,
        ],
    )?;
    Ok(())
}

impl Database {
    /// Create the connection for an aggregator item, or revive the existing one
    ///
    /// Returns the connection id and whether a new row was created. A
    /// soft-deleted connection for the same item is restored as `pending`.
    pub fn upsert_connection(
        &self,
        user_id: i64,
        item_id: &str,
        provider_name: Option<&str>,
        sync_frequency_hours: u32,
    ) -> Result<(i64, bool)> {
        let conn = self.conn()?;

        with_immediate_transaction(&conn, |conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM connections WHERE user_id = ? AND item_id = ?",
                    params![user_id, item_id],
                    |row| row.get(0),
                )
                .optional()?;

            conn.execute(
                r#"
                INSERT INTO connections (user_id, item_id, provider_name, sync_frequency_hours)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(user_id, item_id) DO UPDATE SET
                    provider_name = COALESCE(excluded.provider_name, connections.provider_name),
                    status = CASE WHEN connections.deleted_at IS NOT NULL
                                  THEN 'pending' ELSE connections.status END,
                    is_active = CASE WHEN connections.deleted_at IS NOT NULL
                                     THEN 1 ELSE connections.is_active END,
                    auto_sync = CASE WHEN connections.deleted_at IS NOT NULL
                                     THEN 1 ELSE connections.auto_sync END,
                    error_count = CASE WHEN connections.deleted_at IS NOT NULL
                                       THEN 0 ELSE connections.error_count END,
                    deleted_at = NULL,
                    updated_at = CURRENT_TIMESTAMP
                "#,
                params![user_id, item_id, provider_name, sync_frequency_hours as i64],
            )?;

            match existing {
                Some(id) => Ok((id, false)),
                None => Ok((conn.last_insert_rowid(), true)),
            }
        })
    }

    /// Get a connection by ID (including soft-deleted ones)
    pub fn get_connection(&self, id: i64) -> Result<Option<Connection>> {
        let conn = self.conn()?;
        load_connection(&conn, id)
    }

    /// Find the live connection for an aggregator item
    pub fn find_connection_by_item(&self, item_id: &str) -> Result<Option<Connection>> {
        let conn = self.conn()?;
        let connection = conn
            .query_row(
                &format!(
                    "SELECT {} FROM connections WHERE item_id = ? AND deleted_at IS NULL
                     ORDER BY id DESC LIMIT 1",
                    CONNECTION_COLUMNS
                ),
                params![item_id],
                row_to_connection,
            )
            .optional()?;
        Ok(connection)
    }

    /// List connections, optionally for one user
    pub fn list_connections(
        &self,
        user_id: Option<i64>,
        include_deleted: bool,
    ) -> Result<Vec<Connection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM connections
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 = 1 OR deleted_at IS NULL)
             ORDER BY id",
            CONNECTION_COLUMNS
        ))?;

        let connections = stmt
            .query_map(params![user_id, include_deleted as i64], row_to_connection)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(connections)
    }

    /// Load, transition and persist a connection's lifecycle state atomically
    pub fn apply_lifecycle_event(
        &self,
        connection_id: i64,
        policy: &LifecyclePolicy,
        event: &LifecycleEvent,
    ) -> Result<Connection> {
        let conn = self.conn()?;

        with_immediate_transaction(&conn, |conn| {
            let current = load_connection(conn, connection_id)?
                .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;

            let before = ConnectionState::from(&current);
            let after = lifecycle::transition(policy, &before, event);

            if after != before {
                write_state(conn, connection_id, &after)?;
            }
            if after.status != before.status {
                info!(
                    connection_id,
                    from = %before.status,
                    to = %after.status,
                    event = event.name(),
                    "Connection status changed"
                );
            }

            load_connection(conn, connection_id)?
                .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))
        })
    }

    /// Store bank display metadata once the aggregator finalizes an item
    pub fn set_bank_metadata(
        &self,
        connection_id: i64,
        bank_name: Option<&str>,
        provider_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE connections SET
                bank_name = COALESCE(?, bank_name),
                provider_name = COALESCE(?, provider_name),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![bank_name, provider_name, connection_id],
        )?;
        Ok(())
    }

    /// Bump `updated_at` without touching lifecycle fields
    pub fn touch_connection(&self, connection_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE connections SET updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![connection_id],
        )?;
        Ok(())
    }

    /// Soft-delete a connection and mark it disconnected
    pub fn disconnect_connection(&self, connection_id: i64, policy: &LifecyclePolicy) -> Result<()> {
        let now = Utc::now();
        self.apply_lifecycle_event(connection_id, policy, &LifecycleEvent::Disconnected { at: now })?;

        let conn = self.conn()?;
        conn.execute(
            "UPDATE connections SET deleted_at = COALESCE(deleted_at, ?) WHERE id = ?",
            params![format_datetime(&now), connection_id],
        )?;
        Ok(())
    }

    pub fn set_auto_sync(
        &self,
        connection_id: i64,
        enabled: bool,
        frequency_hours: Option<u32>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE connections SET
                auto_sync = ?,
                sync_frequency_hours = COALESCE(?, sync_frequency_hours),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![enabled as i64, frequency_hours.map(|h| h as i64), connection_id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("connection {}", connection_id)));
        }
        Ok(())
    }

    /// Connections due for a scheduled sync
    pub fn list_connections_needing_sync(&self, now: DateTime<Utc>) -> Result<Vec<Connection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM connections
             WHERE deleted_at IS NULL AND auto_sync = 1 AND status = 'active'
             ORDER BY last_sync_at IS NOT NULL, last_sync_at",
            CONNECTION_COLUMNS
        ))?;

        let candidates = stmt
            .query_map([], row_to_connection)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(candidates
            .into_iter()
            .filter(|c| lifecycle::needs_sync(c, now))
            .collect())
    }
}
