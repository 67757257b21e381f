//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `load_config` - Sync configuration from file and environment
//! - `sync_service` - Sync service over the HTTP aggregator client
//! - `cmd_init` - Initialize the database

use std::path::Path;

use anyhow::{Context, Result};
use banksync_core::{AggregatorClient, Database, SyncConfig, SyncService};

/// Open database with encryption by default, or unencrypted if --no-encrypt
pub fn open_db(db_path: &Path, no_encrypt: bool) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .context("Database path must be valid UTF-8")?;
    if no_encrypt {
        Database::new_unencrypted(path_str).context("Failed to open database (unencrypted)")
    } else {
        Database::new(path_str).context("Failed to open database")
    }
}

pub fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    SyncConfig::load(path).context("Failed to load configuration")
}

/// Build a sync service talking to the configured aggregator
pub fn sync_service(db: Database, config: SyncConfig) -> Result<SyncService> {
    let client = AggregatorClient::from_config(&config.aggregator).context(
        "Aggregator client not configured (set BANKSYNC_CLIENT_ID and BANKSYNC_CLIENT_SECRET)",
    )?;
    Ok(SyncService::new(db, client, config))
}

pub fn cmd_init(db_path: &Path, no_encrypt: bool) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path, no_encrypt)?;

    let seeded = db
        .seed_default_categories()
        .context("Failed to seed default categories")?;
    println!("   Seeded {} default categories", seeded);

    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else {
        println!("   🔒 Encryption: ENABLED");
    }

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Register a user: banksync users add --email you@example.com --external-id <id>");
    println!("  2. Start the webhook receiver: banksync serve");

    Ok(())
}
