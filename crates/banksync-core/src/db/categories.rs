//! Categories and learned categorization patterns

use std::sync::OnceLock;

use regex::Regex;
use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{Category, CategoryKind, LearnedPattern};

/// Global categories available to every user
pub const DEFAULT_CATEGORIES: &[(&str, CategoryKind)] = &[
    ("Alimentation", CategoryKind::Expense),
    ("Restaurants", CategoryKind::Expense),
    ("Transport", CategoryKind::Expense),
    ("Logement", CategoryKind::Expense),
    ("Santé", CategoryKind::Expense),
    ("Shopping", CategoryKind::Expense),
    ("Loisirs", CategoryKind::Expense),
    ("Abonnements", CategoryKind::Expense),
    ("Banque", CategoryKind::Expense),
    ("Revenus", CategoryKind::Income),
];

/// Confidence of a freshly learned pattern
pub const PATTERN_INITIAL_CONFIDENCE: f64 = 0.6;
/// Confidence gained each time a correction confirms a pattern
pub const PATTERN_CONFIDENCE_STEP: f64 = 0.05;
pub const PATTERN_CONFIDENCE_CAP: f64 = 0.95;

/// Words kept in a normalized merchant pattern
const PATTERN_MAX_WORDS: usize = 3;

fn operation_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:prlv sepa|vir sepa|vir inst|paiement par carte|retrait dab|carte|prlv|vir|cb)\b\s*",
        )
        .expect("valid regex")
    })
}

/// Reduce a bank description or merchant name to a stable merchant pattern
///
/// Lowercases, drops operation prefixes ("CB", "PRLV SEPA", ...), digits and
/// punctuation, then keeps the first few words.
/// `"CB CARREFOUR CITY 12/03 PARIS"` becomes `"carrefour city paris"`.
pub fn normalize_pattern(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let stripped = operation_prefix().replace(&lowered, "");

    let cleaned: String = stripped
        .chars()
        .map(|c| if c.is_alphabetic() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|w| w.chars().count() > 1)
        .take(PATTERN_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_to_category(row: &rusqlite::Row) -> rusqlite::Result<Category> {
    let kind: String = row.get(3)?;
    Ok(Category {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        kind: kind.parse().unwrap_or_default(),
    })
}

fn row_to_pattern(row: &rusqlite::Row) -> rusqlite::Result<LearnedPattern> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(LearnedPattern {
        id: row.get(0)?,
        user_id: row.get(1)?,
        pattern: row.get(2)?,
        category_id: row.get(3)?,
        match_count: row.get(4)?,
        confidence: row.get(5)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const PATTERN_COLUMNS: &str =
    "id, user_id, pattern, category_id, match_count, confidence, created_at, updated_at";

/// Resolve a category name, preferring the user's own over a global one
pub(crate) fn find_category_by_name_with(
    conn: &rusqlite::Connection,
    user_id: i64,
    name: &str,
) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            r#"
            SELECT id, user_id, name, kind FROM categories
            WHERE name = ? COLLATE NOCASE AND (user_id = ? OR user_id IS NULL)
            ORDER BY user_id IS NULL
            LIMIT 1
            "#,
            params![name, user_id],
            row_to_category,
        )
        .optional()?;
    Ok(category)
}

/// Best learned pattern for a text, highest confidence first
///
/// A pattern matches when its words appear as a contiguous run of whole
/// words in the normalized text, so "orange" never matches "orangerie".
pub(crate) fn find_learned_pattern_with(
    conn: &rusqlite::Connection,
    user_id: i64,
    text: &str,
) -> Result<Option<LearnedPattern>> {
    let normalized = normalize_pattern(text);
    if normalized.is_empty() {
        return Ok(None);
    }

    let pattern = conn
        .query_row(
            &format!(
                "SELECT {} FROM categorization_patterns
                 WHERE user_id = ? AND instr(' ' || ? || ' ', ' ' || pattern || ' ') > 0
                 ORDER BY confidence DESC, match_count DESC, length(pattern) DESC
                 LIMIT 1",
                PATTERN_COLUMNS
            ),
            params![user_id, normalized],
            row_to_pattern,
        )
        .optional()?;
    Ok(pattern)
}

impl Database {
    /// Seed the global categories (idempotent)
    pub fn seed_default_categories(&self) -> Result<usize> {
        let conn = self.conn()?;
        let mut inserted = 0;
        for (name, kind) in DEFAULT_CATEGORIES {
            inserted += conn.execute(
                "INSERT OR IGNORE INTO categories (user_id, name, kind) VALUES (NULL, ?, ?)",
                params![name, kind.as_str()],
            )?;
        }
        Ok(inserted)
    }

    /// Create a category (or return the existing one with the same owner and name)
    pub fn create_category(
        &self,
        user_id: Option<i64>,
        name: &str,
        kind: CategoryKind,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO categories (user_id, name, kind) VALUES (?, ?, ?)",
            params![user_id, name, kind.as_str()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM categories WHERE COALESCE(user_id, 0) = COALESCE(?, 0) AND name = ?",
            params![user_id, name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn find_category_by_name(&self, user_id: i64, name: &str) -> Result<Option<Category>> {
        let conn = self.conn()?;
        find_category_by_name_with(&conn, user_id, name)
    }

    pub fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                "SELECT id, user_id, name, kind FROM categories WHERE id = ?",
                params![id],
                row_to_category,
            )
            .optional()?;
        Ok(category)
    }

    /// Categories visible to a user (own + global)
    pub fn list_categories(&self, user_id: i64) -> Result<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, kind FROM categories
             WHERE user_id = ? OR user_id IS NULL ORDER BY name",
        )?;
        let categories = stmt
            .query_map(params![user_id], row_to_category)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    /// Create or reinforce a learned pattern for (user, merchant text, category)
    ///
    /// Reinforcement bumps the match count and raises confidence by a fixed
    /// step up to the cap.
    pub fn learn_pattern(
        &self,
        user_id: i64,
        merchant_text: &str,
        category_id: i64,
    ) -> Result<LearnedPattern> {
        let pattern = normalize_pattern(merchant_text);
        if pattern.is_empty() {
            return Err(Error::InvalidData(format!(
                "No usable merchant pattern in {:?}",
                merchant_text
            )));
        }

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO categorization_patterns (user_id, pattern, category_id, match_count, confidence)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(user_id, pattern, category_id) DO UPDATE SET
                match_count = match_count + 1,
                confidence = MIN(confidence + ?5, ?6),
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                user_id,
                pattern,
                category_id,
                PATTERN_INITIAL_CONFIDENCE,
                PATTERN_CONFIDENCE_STEP,
                PATTERN_CONFIDENCE_CAP
            ],
        )?;

        let learned = conn.query_row(
            &format!(
                "SELECT {} FROM categorization_patterns
                 WHERE user_id = ? AND pattern = ? AND category_id = ?",
                PATTERN_COLUMNS
            ),
            params![user_id, pattern, category_id],
            row_to_pattern,
        )?;
        Ok(learned)
    }

    pub fn find_learned_pattern(&self, user_id: i64, text: &str) -> Result<Option<LearnedPattern>> {
        let conn = self.conn()?;
        find_learned_pattern_with(&conn, user_id, text)
    }

    pub fn list_patterns(&self, user_id: i64) -> Result<Vec<LearnedPattern>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM categorization_patterns WHERE user_id = ?
             ORDER BY confidence DESC, match_count DESC",
            PATTERN_COLUMNS
        ))?;
        let patterns = stmt
            .query_map(params![user_id], row_to_pattern)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(patterns)
    }
}
