//! Sync and reimport command implementations
//!
//! Both run inline, without the worker pool: the CLI waits for the result and
//! prints the report.

use anyhow::{bail, Context, Result};
use banksync_core::models::ConnectionStatus;
use banksync_core::{SyncReport, SyncService};
use tracing::warn;

fn print_report(report: &SyncReport) {
    if let Some(reason) = &report.skipped {
        println!("   ⏭️  Connection {}: skipped ({})", report.connection_id, reason);
        return;
    }
    let import = &report.import;
    println!(
        "   ✅ Connection {}: {} account(s), {} new, {} relinked, {} existing, {} failed",
        report.connection_id,
        report.accounts_synced,
        import.imported,
        import.relinked,
        import.existing,
        import.failed
    );
    if import.accounts_failed > 0 {
        println!(
            "      ⚠️  {} of {} account fetch(es) failed",
            import.accounts_failed, import.accounts_seen
        );
    }
    if report.converted > 0 {
        println!("      Converted on import: {}", report.converted);
    }
}

pub async fn cmd_sync(sync: &SyncService, connection_id: Option<i64>, all: bool) -> Result<()> {
    let ids: Vec<i64> = match (connection_id, all) {
        (Some(id), _) => vec![id],
        (None, true) => sync
            .db()
            .list_connections(None, false)?
            .into_iter()
            // Disabled connections only run when named explicitly
            .filter(|c| c.status != ConnectionStatus::Disabled)
            .map(|c| c.id)
            .collect(),
        (None, false) => bail!("Specify --connection ID or --all"),
    };

    if ids.is_empty() {
        println!("No connections to sync.");
        return Ok(());
    }

    println!("🔄 Syncing {} connection(s)...", ids.len());

    let mut failures = 0;
    for id in ids {
        match sync.sync_connection(id).await {
            Ok(report) => print_report(&report),
            Err(e) => {
                failures += 1;
                warn!(connection_id = id, error = %e, "Sync failed");
                println!("   ❌ Connection {}: {}", id, e);
            }
        }
    }

    if failures > 0 {
        bail!("{} sync(s) failed", failures);
    }
    Ok(())
}

pub async fn cmd_reimport(sync: &SyncService, connection_id: i64, yes: bool) -> Result<()> {
    let connection = sync
        .db()
        .get_connection(connection_id)?
        .with_context(|| format!("Connection {} not found", connection_id))?;

    if !yes {
        println!(
            "⚠️  This deletes every unconverted record of connection {} ({}) and imports them again.",
            connection_id, connection.item_id
        );
        println!("   Converted records and ledger transactions are kept.");
        println!("   Re-run with --yes to proceed.");
        return Ok(());
    }

    println!("🔁 Reimporting connection {}...", connection_id);
    let (deleted, report) = sync.force_reimport(connection_id).await?;
    sync.db().log_audit(
        "cli",
        "reimport",
        Some("connection"),
        Some(connection_id),
        Some(&format!("deleted={}, imported={}", deleted, report.import.imported)),
    )?;

    println!("   Deleted {} unconverted record(s)", deleted);
    print_report(&report);
    Ok(())
}
