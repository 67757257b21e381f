//! Backlog and connection health reporting

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{parse_date, parse_optional_datetime, Database};
use crate::error::Result;
use crate::models::{ConnectionStatus, ProcessingStatus};

/// A connection that needs operator attention
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionIssue {
    pub connection_id: i64,
    pub user_id: i64,
    pub item_id: String,
    pub status: ConnectionStatus,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
}

/// Snapshot of the import/conversion backlog
#[derive(Debug, Clone, Serialize, Default)]
pub struct BacklogReport {
    pub connections_by_status: Vec<(ConnectionStatus, i64)>,
    pub records_by_status: Vec<(ProcessingStatus, i64)>,
    /// Records still waiting for conversion (`imported` + `categorized`)
    pub unconverted: i64,
    /// Unconverted records without a suggested category
    pub uncategorized: i64,
    pub oldest_unconverted: Option<NaiveDate>,
    /// Connections with errors, newest failure first
    pub issues: Vec<ConnectionIssue>,
}

impl BacklogReport {
    pub fn connections_in(&self, status: ConnectionStatus) -> i64 {
        self.connections_by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn records_in(&self, status: ProcessingStatus) -> i64 {
        self.records_by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl Database {
    /// Build a backlog report, optionally for a single user
    ///
    /// `limit` caps the number of connection issues returned.
    pub fn backlog_report(&self, user_id: Option<i64>, limit: usize) -> Result<BacklogReport> {
        let conn = self.conn()?;
        let mut report = BacklogReport::default();

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM connections
             WHERE deleted_at IS NULL AND (?1 IS NULL OR user_id = ?1)
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = status.parse() {
                report.connections_by_status.push((status, count));
            }
        }

        let mut stmt = conn.prepare(
            "SELECT processing_status, COUNT(*) FROM bank_transactions
             WHERE (?1 IS NULL OR user_id = ?1)
             GROUP BY processing_status",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = status.parse() {
                report.records_by_status.push((status, count));
            }
        }

        report.unconverted = report.records_in(ProcessingStatus::Imported)
            + report.records_in(ProcessingStatus::Categorized);

        let (uncategorized, oldest): (i64, Option<String>) = conn.query_row(
            "SELECT
                 COALESCE(SUM(CASE WHEN suggested_category_id IS NULL THEN 1 ELSE 0 END), 0),
                 MIN(transaction_date)
             FROM bank_transactions
             WHERE processing_status IN ('imported', 'categorized')
               AND (?1 IS NULL OR user_id = ?1)",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        report.uncategorized = uncategorized;
        report.oldest_unconverted = oldest.as_deref().map(parse_date);

        let mut stmt = conn.prepare(
            "SELECT id, user_id, item_id, status, error_count, last_error, last_error_at,
                    last_successful_sync_at
             FROM connections
             WHERE deleted_at IS NULL AND (?1 IS NULL OR user_id = ?1)
               AND (status IN ('error', 'expired', 'disabled') OR error_count > 0)
             ORDER BY last_error_at DESC
             LIMIT ?2",
        )?;
        report.issues = stmt
            .query_map(params![user_id, limit as i64], |row| {
                let status: String = row.get(3)?;
                Ok(ConnectionIssue {
                    connection_id: row.get(0)?,
                    user_id: row.get(1)?,
                    item_id: row.get(2)?,
                    status: status.parse().unwrap_or_default(),
                    error_count: row.get::<_, i64>(4)?.max(0) as u32,
                    last_error: row.get(5)?,
                    last_error_at: parse_optional_datetime(row.get(6)?),
                    last_successful_sync_at: parse_optional_datetime(row.get(7)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(report)
    }
}
