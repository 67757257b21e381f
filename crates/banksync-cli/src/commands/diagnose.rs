//! Backlog diagnosis command

use anyhow::Result;
use banksync_core::models::{ConnectionStatus, ProcessingStatus};
use banksync_core::Database;

use super::{format_when, truncate};

pub fn cmd_diagnose(db: &Database, user_id: Option<i64>, limit: usize) -> Result<()> {
    let report = db.backlog_report(user_id, limit)?;

    println!();
    match user_id {
        Some(id) => println!("🩺 Backlog for user {}", id),
        None => println!("🩺 Backlog"),
    }
    println!("   ─────────────────────────────────────────────────────────────");

    println!("   Connections:");
    for status in [
        ConnectionStatus::Active,
        ConnectionStatus::Pending,
        ConnectionStatus::Error,
        ConnectionStatus::Expired,
        ConnectionStatus::Disabled,
    ] {
        let count = report.connections_in(status);
        if count > 0 {
            println!("     {:<10} {}", status.as_str(), count);
        }
    }

    println!("   Records:");
    for status in [
        ProcessingStatus::Imported,
        ProcessingStatus::Categorized,
        ProcessingStatus::Converted,
        ProcessingStatus::Ignored,
        ProcessingStatus::Duplicate,
    ] {
        println!("     {:<12} {}", status.as_str(), report.records_in(status));
    }

    println!();
    println!("   Waiting for conversion: {}", report.unconverted);
    println!("   Without a category:     {}", report.uncategorized);
    if let Some(oldest) = report.oldest_unconverted {
        println!("   Oldest unconverted:     {}", oldest);
    }

    if report.issues.is_empty() {
        println!();
        println!("✅ No connection errors");
    } else {
        println!();
        println!("⚠️  Connections needing attention:");
        for issue in &report.issues {
            println!(
                "   {:>4}  user {:<4} {:<8} errors {:<2} last ok {}",
                issue.connection_id,
                issue.user_id,
                issue.status.as_str(),
                issue.error_count,
                format_when(issue.last_successful_sync_at)
            );
            if let Some(err) = &issue.last_error {
                println!("         {}", truncate(err, 60));
            }
        }
    }
    println!();
    Ok(())
}
