//! User command implementations

use anyhow::{bail, Result};
use banksync_core::Database;

pub fn cmd_users_add(db: &Database, email: &str, external_id: &str) -> Result<()> {
    if email.trim().is_empty() || external_id.trim().is_empty() {
        bail!("Email and external ID are required");
    }

    let id = db.upsert_user(email.trim(), external_id.trim())?;
    db.log_audit("cli", "create", Some("user"), Some(id), Some(email))?;

    println!("✅ User {} registered (id {})", email, id);
    Ok(())
}

pub fn cmd_users_list(db: &Database) -> Result<()> {
    let users = db.list_users()?;

    if users.is_empty() {
        println!("No users yet. Add one with 'banksync users add'.");
        return Ok(());
    }

    println!();
    println!("👤 Users");
    println!("   ─────────────────────────────────────────────────────────────");
    for user in &users {
        println!(
            "   {:>4}  {:<32} {}",
            user.id,
            super::truncate(&user.email, 32),
            user.external_user_id
        );
    }
    println!();
    Ok(())
}
