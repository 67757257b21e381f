//! Server command implementation

use std::path::Path;

use anyhow::{Context, Result};
use banksync_core::SyncConfig;

use super::{open_db, sync_service};

pub async fn cmd_serve(
    db_path: &Path,
    config: SyncConfig,
    host: &str,
    port: u16,
    no_auth: bool,
    no_encrypt: bool,
) -> Result<()> {
    println!("🚀 Starting banksync server...");
    println!("   Database: {}", db_path.display());
    println!("   Listening: http://{}:{}", host, port);
    println!("   Webhook endpoint: POST /webhooks/aggregator");

    let server_config = banksync_server::ServerConfig::from_env(!no_auth);

    if no_auth {
        println!();
        println!("   ⚠️  Authentication DISABLED - do not expose to network!");
    } else if server_config.api_keys.is_empty() {
        println!("   ⚠️  No API keys configured (BANKSYNC_API_KEYS); /api is locked");
    } else {
        println!(
            "   🔑 API keys: {} configured (BANKSYNC_API_KEYS)",
            server_config.api_keys.len()
        );
    }
    if server_config.webhook_secret.is_some() {
        println!("   🔒 Webhook secret: configured (BANKSYNC_WEBHOOK_SECRET)");
    }
    if no_encrypt {
        println!("   ⚠️  Encryption DISABLED (--no-encrypt)");
    }
    println!();
    println!("   Press Ctrl+C to stop");

    let db = open_db(db_path, no_encrypt)?;

    // Categories are needed by the import path (idempotent)
    db.seed_default_categories()
        .context("Failed to seed default categories")?;

    let sync = sync_service(db, config)?;
    banksync_server::serve_with_config(sync, host, port, server_config).await?;

    Ok(())
}
