//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Banksync - bank aggregation sync administration
#[derive(Parser)]
#[command(name = "banksync")]
#[command(about = "Bank account aggregation sync: import, categorize, convert", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "banksync.db", global = true)]
    pub db: PathBuf,

    /// Config file (defaults to the platform data dir, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable database encryption (not recommended for production)
    ///
    /// By default, the database is encrypted using SQLCipher.
    /// Set BANKSYNC_DB_KEY environment variable with your passphrase.
    /// Use --no-encrypt only for development or testing.
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed default categories
    Init,

    /// Manage users
    Users {
        #[command(subcommand)]
        action: Option<UsersAction>,
    },

    /// Manage bank connections
    Connections {
        #[command(subcommand)]
        action: Option<ConnectionsAction>,
    },

    /// Sync one connection or every live connection now
    Sync {
        /// Connection ID
        #[arg(short, long, conflicts_with = "all")]
        connection: Option<i64>,

        /// Sync every live connection
        #[arg(long)]
        all: bool,
    },

    /// Show connection health and the import/conversion backlog
    Diagnose {
        /// Only report on this user ID
        #[arg(short, long)]
        user: Option<i64>,

        /// Maximum number of connection issues to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete unconverted records for a connection and import them again
    Reimport {
        /// Connection ID
        #[arg(short, long)]
        connection: i64,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Suggest categories for imported records that have none
    Categorize {
        /// Only categorize records of this user ID
        #[arg(short, long)]
        user: Option<i64>,

        /// Maximum number of records to process
        #[arg(short, long, default_value = "500")]
        limit: usize,
    },

    /// Convert imported records into ledger transactions
    Convert {
        /// Only convert records of this user ID
        #[arg(short, long)]
        user: Option<i64>,

        /// Maximum number of records to process (default: whole backlog)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Records per chunk (default: from config)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Run the conversion and roll every change back
        #[arg(long)]
        dry_run: bool,
    },

    /// Correct a ledger transaction's category and learn the merchant pattern
    Learn {
        /// Ledger transaction ID
        #[arg(short, long)]
        transaction: i64,

        /// Category name
        #[arg(short, long)]
        category: String,
    },

    /// Start the webhook receiver, operator API and worker pool
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Disable API key authentication (development only)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
pub enum UsersAction {
    /// Register a user
    Add {
        /// Email address
        #[arg(short, long)]
        email: String,

        /// Identity handle used with the aggregator
        #[arg(short = 'x', long)]
        external_id: String,
    },
    /// List users
    List,
}

#[derive(Subcommand)]
pub enum ConnectionsAction {
    /// List connections
    List {
        /// Only list connections of this user ID
        #[arg(short, long)]
        user: Option<i64>,

        /// Include disconnected connections
        #[arg(short, long)]
        all: bool,
    },
    /// Disconnect (soft-delete) a connection
    Disconnect {
        /// Connection ID
        id: i64,
    },
}
