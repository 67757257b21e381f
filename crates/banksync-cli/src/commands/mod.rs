//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Shared utilities (open_db, load_config, sync_service) and init
//! - `users` - User registration and listing
//! - `connections` - Connection listing and disconnect
//! - `sync` - Run syncs now and force reimport
//! - `diagnose` - Connection health and backlog report
//! - `convert` - Categorization and conversion batches, pattern learning
//! - `serve` - Web server command

pub mod connections;
pub mod convert;
pub mod core;
pub mod diagnose;
pub mod serve;
pub mod sync;
pub mod users;

// Re-export command functions for main.rs
pub use connections::*;
pub use convert::*;
pub use core::*;
pub use diagnose::*;
pub use serve::*;
pub use sync::*;
pub use users::*;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Short relative rendering of an optional timestamp
pub fn format_when(when: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match when {
        Some(ts) => ts.format("%Y-%m-%d %H:%M").to_string(),
        None => "never".to_string(),
    }
}
