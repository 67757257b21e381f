//! Connection command implementations

use anyhow::{bail, Result};
use banksync_core::models::ConnectionStatus;
use banksync_core::{Database, SyncConfig};

use super::{format_when, truncate};

fn status_icon(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Active => "✅",
        ConnectionStatus::Pending => "⏳",
        ConnectionStatus::Error => "⚠️ ",
        ConnectionStatus::Expired => "⌛",
        ConnectionStatus::Disabled => "⛔",
        ConnectionStatus::Disconnected => "🔌",
    }
}

pub fn cmd_connections_list(db: &Database, user_id: Option<i64>, include_deleted: bool) -> Result<()> {
    let connections = db.list_connections(user_id, include_deleted)?;

    if connections.is_empty() {
        println!("No connections found.");
        return Ok(());
    }

    println!();
    println!("🏦 Connections");
    println!("   ─────────────────────────────────────────────────────────────");
    for c in &connections {
        let bank = c
            .bank_name
            .as_deref()
            .or(c.provider_name.as_deref())
            .unwrap_or("-");
        println!(
            "   {} {:>4}  user {:<4} {:<20} {:<9} errors {:<2} last ok {}",
            status_icon(c.status),
            c.id,
            c.user_id,
            truncate(bank, 20),
            c.status.as_str(),
            c.error_count,
            format_when(c.last_successful_sync_at)
        );
        if let Some(err) = &c.last_error {
            println!("          last error: {}", truncate(err, 60));
        }
        if c.is_deleted() {
            println!("          (disconnected {})", format_when(c.deleted_at));
        }
    }
    println!();
    Ok(())
}

pub fn cmd_connections_disconnect(db: &Database, config: &SyncConfig, id: i64) -> Result<()> {
    let Some(connection) = db.get_connection(id)? else {
        bail!("Connection {} not found", id);
    };
    if connection.is_deleted() {
        println!("Connection {} is already disconnected.", id);
        return Ok(());
    }

    db.disconnect_connection(id, &config.lifecycle)?;
    db.log_audit("cli", "disconnect", Some("connection"), Some(id), None)?;

    println!("✅ Connection {} ({}) disconnected", id, connection.item_id);
    Ok(())
}
