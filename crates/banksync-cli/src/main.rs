//! Banksync CLI - bank aggregation sync administration
//!
//! Usage:
//!   banksync init                      Initialize database
//!   banksync sync --all                Sync every live connection
//!   banksync diagnose                  Show connection health and backlog
//!   banksync convert --dry-run         Preview a conversion batch
//!   banksync serve --port 3000         Start webhook receiver and workers

mod cli;
mod commands;

#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.no_encrypt),
        Commands::Users { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None | Some(UsersAction::List) => commands::cmd_users_list(&db),
                Some(UsersAction::Add { email, external_id }) => {
                    commands::cmd_users_add(&db, &email, &external_id)
                }
            }
        }
        Commands::Connections { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None => commands::cmd_connections_list(&db, None, false),
                Some(ConnectionsAction::List { user, all }) => {
                    commands::cmd_connections_list(&db, user, all)
                }
                Some(ConnectionsAction::Disconnect { id }) => {
                    commands::cmd_connections_disconnect(&db, &config, id)
                }
            }
        }
        Commands::Sync { connection, all } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let sync = commands::sync_service(db, config)?;
            commands::cmd_sync(&sync, connection, all).await
        }
        Commands::Diagnose { user, limit } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_diagnose(&db, user, limit)
        }
        Commands::Reimport { connection, yes } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let sync = commands::sync_service(db, config)?;
            commands::cmd_reimport(&sync, connection, yes).await
        }
        Commands::Categorize { user, limit } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_categorize(&db, user, limit)
        }
        Commands::Convert {
            user,
            limit,
            chunk_size,
            dry_run,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let chunk_size = chunk_size.unwrap_or(config.conversion_chunk_size);
            commands::cmd_convert(&db, user, limit, chunk_size, dry_run)
        }
        Commands::Learn {
            transaction,
            category,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_learn(&db, transaction, &category)
        }
        Commands::Serve {
            port,
            host,
            no_auth,
        } => commands::cmd_serve(&cli.db, config, &host, port, no_auth, cli.no_encrypt).await,
    }
}
