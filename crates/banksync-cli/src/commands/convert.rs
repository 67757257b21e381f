//! Categorization, conversion and pattern learning commands

use anyhow::{bail, Context, Result};
use banksync_core::categorize::{categorize_pending, learn_from_correction};
use banksync_core::{ConversionOptions, ConversionPipeline, Database};

pub fn cmd_categorize(db: &Database, user_id: Option<i64>, limit: usize) -> Result<()> {
    if limit == 0 {
        bail!("--limit must be positive");
    }

    println!("🏷️  Categorizing imported records...");
    let summary = categorize_pending(db, user_id, limit)?;

    println!("   Processed:     {}", summary.processed);
    println!("   Categorized:   {}", summary.categorized);
    println!("   Uncategorized: {}", summary.uncategorized);
    if summary.failed > 0 {
        println!("   ⚠️  Failed:     {}", summary.failed);
    }
    Ok(())
}

pub fn cmd_convert(
    db: &Database,
    user_id: Option<i64>,
    limit: Option<usize>,
    chunk_size: usize,
    dry_run: bool,
) -> Result<()> {
    if limit == Some(0) {
        bail!("--limit must be positive");
    }
    if chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }

    if dry_run {
        println!("🧪 Converting records (dry run, nothing is kept)...");
    } else {
        println!("💱 Converting records...");
    }

    let options = ConversionOptions {
        user_id,
        limit,
        chunk_size,
        dry_run,
    };
    let summary = ConversionPipeline::new(db.clone()).run(&options)?;

    println!("   Processed:   {}", summary.processed);
    println!("   Converted:   {}", summary.converted);
    println!("   Categorized: {}", summary.categorized);
    println!("   Skipped:     {}", summary.skipped);
    println!("   Duplicates:  {}", summary.duplicates);
    if summary.failed > 0 {
        println!("   ❌ Failed:    {}", summary.failed);
        for failure in summary.failures.iter().take(10) {
            println!("      record {}: {}", failure.record_id, failure.reason);
        }
    }

    if !dry_run {
        db.log_audit(
            "cli",
            "convert",
            Some("bank_transaction"),
            user_id,
            Some(&format!(
                "converted={}, failed={}",
                summary.converted, summary.failed
            )),
        )?;
    }
    Ok(())
}

pub fn cmd_learn(db: &Database, transaction_id: i64, category_name: &str) -> Result<()> {
    let transaction = db
        .get_transaction(transaction_id)?
        .with_context(|| format!("Transaction {} not found", transaction_id))?;
    let category = db
        .find_category_by_name(transaction.user_id, category_name)?
        .with_context(|| format!("Category '{}' not found", category_name))?;

    let pattern = learn_from_correction(db, transaction_id, category.id)?;

    println!(
        "✅ Transaction {} → {} (pattern '{}', confidence {:.2}, {} match(es))",
        transaction_id, category.name, pattern.pattern, pattern.confidence, pattern.match_count
    );
    Ok(())
}
