//! Categorization engine
//!
//! Suggestions come from an ordered list of strategies, first hit wins:
//! - `LearnedPatternStrategy` - per-user patterns reinforced by corrections
//! - `HintStrategy` - the aggregator's merchant-category hint, via a fixed table
//! - `KeywordStrategy` - substring rules over the lowercased description
//!
//! The raw-import categorizer skips learned patterns so import never pays for
//! per-user lookups; the canonical categorizer used by conversion and the
//! categorization batch consults them first.

use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{
    find_category_by_name_with, find_learned_pattern_with, Database, PendingFilter,
};
use crate::error::{Error, Result};
use crate::models::LearnedPattern;

/// Confidence floor for any heuristic suggestion
pub const BASE_CONFIDENCE: f64 = 0.5;

/// Aggregator hint vocabulary mapped onto seeded category names
const HINT_TABLE: &[(&str, &str)] = &[
    ("food", "Alimentation"),
    ("groceries", "Alimentation"),
    ("supermarket", "Alimentation"),
    ("restaurant", "Restaurants"),
    ("restaurants", "Restaurants"),
    ("dining", "Restaurants"),
    ("transport", "Transport"),
    ("travel", "Transport"),
    ("fuel", "Transport"),
    ("housing", "Logement"),
    ("rent", "Logement"),
    ("utilities", "Logement"),
    ("health", "Santé"),
    ("shopping", "Shopping"),
    ("leisure", "Loisirs"),
    ("entertainment", "Loisirs"),
    ("subscription", "Abonnements"),
    ("subscriptions", "Abonnements"),
    ("income", "Revenus"),
    ("salary", "Revenus"),
    ("bank", "Banque"),
    ("fees", "Banque"),
];

/// Keyword rules in priority order
///
/// "uber eats" must stay ahead of the plain "uber" transport rule.
pub const KEYWORD_RULES: &[(&str, &[&str])] = &[
    (
        "Restaurants",
        &[
            "restaurant", "uber eats", "deliveroo", "just eat", "mcdonald", "burger king", "kfc",
            "brasserie", "pizzeria", "sushi",
        ],
    ),
    (
        "Alimentation",
        &[
            "carrefour", "leclerc", "auchan", "lidl", "monoprix", "intermarche", "franprix",
            "super u", "aldi", "picard", "biocoop", "boulangerie",
        ],
    ),
    (
        "Transport",
        &[
            "sncf", "ratp", "uber", "navigo", "blablacar", "total", "esso", "shell", "peage",
            "parking",
        ],
    ),
    (
        "Abonnements",
        &[
            "netflix", "spotify", "deezer", "disney", "canal+", "free mobile", "orange", "sfr",
            "bouygues",
        ],
    ),
    (
        "Logement",
        &["loyer", "edf", "engie", "veolia", "syndic", "assurance habitation"],
    ),
    (
        "Santé",
        &["pharmacie", "medecin", "docteur", "dentiste", "doctolib", "mutuelle", "hopital"],
    ),
    (
        "Shopping",
        &["amazon", "fnac", "darty", "zara", "decathlon", "ikea", "leroy merlin", "cdiscount"],
    ),
    (
        "Loisirs",
        &["cinema", "ugc", "pathe", "steam", "playstation", "musee", "theatre", "concert"],
    ),
    (
        "Revenus",
        &["salaire", "paie", "pole emploi", "france travail", "allocations familiales"],
    ),
];

/// Map an aggregator merchant-category hint to a category name
pub fn map_merchant_category(hint: &str) -> Option<&'static str> {
    let hint = hint.trim().to_lowercase();
    HINT_TABLE
        .iter()
        .find(|(key, _)| *key == hint)
        .map(|(_, name)| *name)
}

/// First keyword rule matching the description, if any
pub fn match_keywords(description: &str) -> Option<&'static str> {
    let lowered = description.to_lowercase();
    KEYWORD_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(name, _)| *name)
}

/// Heuristic confidence in [0.5, 1.0]
pub fn confidence_score(
    merchant_name: Option<&str>,
    merchant_category: Option<&str>,
    description: &str,
) -> f64 {
    let present = |s: Option<&str>| s.is_some_and(|s| !s.trim().is_empty());

    let mut score = BASE_CONFIDENCE;
    if present(merchant_name) {
        score += 0.2;
    }
    if present(merchant_category) {
        score += 0.2;
    }
    if description.chars().count() > 10 {
        score += 0.1;
    }
    score.min(1.0)
}

/// What a strategy looks at
#[derive(Debug, Clone, Copy)]
pub struct CategorizationInput<'a> {
    pub user_id: i64,
    pub description: &'a str,
    pub merchant_name: Option<&'a str>,
    pub merchant_category: Option<&'a str>,
}

/// A suggested category with its confidence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub category_id: Option<i64>,
    pub confidence: f64,
    /// Strategy that produced the category
    pub source: Option<&'static str>,
}

impl Suggestion {
    pub fn is_categorized(&self) -> bool {
        self.category_id.is_some()
    }
}

/// One tier of the categorization engine
pub trait CategorizationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means "no opinion, ask the next strategy"
    fn suggest(
        &self,
        conn: &rusqlite::Connection,
        input: &CategorizationInput<'_>,
    ) -> Result<Option<Suggestion>>;
}

fn resolve(
    conn: &rusqlite::Connection,
    input: &CategorizationInput<'_>,
    name: &str,
    source: &'static str,
) -> Result<Option<Suggestion>> {
    let category = find_category_by_name_with(conn, input.user_id, name)?;
    Ok(category.map(|c| Suggestion {
        category_id: Some(c.id),
        confidence: confidence_score(input.merchant_name, input.merchant_category, input.description),
        source: Some(source),
    }))
}

pub struct HintStrategy;

impl CategorizationStrategy for HintStrategy {
    fn name(&self) -> &'static str {
        "hint"
    }

    fn suggest(
        &self,
        conn: &rusqlite::Connection,
        input: &CategorizationInput<'_>,
    ) -> Result<Option<Suggestion>> {
        match input.merchant_category.and_then(map_merchant_category) {
            Some(name) => resolve(conn, input, name, self.name()),
            None => Ok(None),
        }
    }
}

pub struct KeywordStrategy;

impl CategorizationStrategy for KeywordStrategy {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn suggest(
        &self,
        conn: &rusqlite::Connection,
        input: &CategorizationInput<'_>,
    ) -> Result<Option<Suggestion>> {
        match match_keywords(input.description) {
            Some(name) => resolve(conn, input, name, self.name()),
            None => Ok(None),
        }
    }
}

pub struct LearnedPatternStrategy;

impl CategorizationStrategy for LearnedPatternStrategy {
    fn name(&self) -> &'static str {
        "learned"
    }

    fn suggest(
        &self,
        conn: &rusqlite::Connection,
        input: &CategorizationInput<'_>,
    ) -> Result<Option<Suggestion>> {
        // Corrections are learned from descriptions; the merchant name is a second chance
        let mut pattern = find_learned_pattern_with(conn, input.user_id, input.description)?;
        if pattern.is_none() {
            if let Some(merchant) = input.merchant_name {
                pattern = find_learned_pattern_with(conn, input.user_id, merchant)?;
            }
        }
        Ok(pattern.map(|p| Suggestion {
            category_id: Some(p.category_id),
            confidence: p.confidence,
            source: Some(self.name()),
        }))
    }
}

/// Ordered strategy chain
pub struct Categorizer {
    strategies: Vec<Box<dyn CategorizationStrategy>>,
}

impl Categorizer {
    pub fn new(strategies: Vec<Box<dyn CategorizationStrategy>>) -> Self {
        Self { strategies }
    }

    /// Hint table then keywords; used while importing
    pub fn raw_import() -> Self {
        Self::new(vec![Box::new(HintStrategy), Box::new(KeywordStrategy)])
    }

    /// Learned patterns first, then the heuristics; used by conversion
    pub fn canonical() -> Self {
        Self::new(vec![
            Box::new(LearnedPatternStrategy),
            Box::new(HintStrategy),
            Box::new(KeywordStrategy),
        ])
    }

    /// Run the chain; a failing strategy is logged and skipped
    ///
    /// Never fails: with no match the suggestion carries no category and the
    /// heuristic confidence.
    pub fn categorize(
        &self,
        conn: &rusqlite::Connection,
        input: &CategorizationInput<'_>,
    ) -> Suggestion {
        for strategy in &self.strategies {
            match strategy.suggest(conn, input) {
                Ok(Some(suggestion)) => {
                    debug!(
                        user_id = input.user_id,
                        strategy = strategy.name(),
                        category_id = ?suggestion.category_id,
                        "Categorized"
                    );
                    return suggestion;
                }
                Ok(None) => {}
                Err(e) => {
                    let e = Error::Categorization(format!("{}: {}", strategy.name(), e));
                    warn!(user_id = input.user_id, error = %e, "Categorization strategy failed");
                }
            }
        }

        Suggestion {
            category_id: None,
            confidence: confidence_score(input.merchant_name, input.merchant_category, input.description),
            source: None,
        }
    }

    /// Convenience wrapper that takes a pooled connection
    pub fn categorize_with(&self, db: &Database, input: &CategorizationInput<'_>) -> Result<Suggestion> {
        let conn = db.conn()?;
        Ok(self.categorize(&conn, input))
    }
}

/// Result of a categorization batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategorizationSummary {
    pub processed: usize,
    pub categorized: usize,
    pub uncategorized: usize,
    pub failed: usize,
}

/// Categorize `imported` records with the canonical categorizer
///
/// Records that get a category advance to `categorized`; the rest stay
/// `imported` so a later pattern or rule can still pick them up.
pub fn categorize_pending(
    db: &Database,
    user_id: Option<i64>,
    limit: usize,
) -> Result<CategorizationSummary> {
    let categorizer = Categorizer::canonical();
    let mut summary = CategorizationSummary::default();
    let mut filter = PendingFilter::uncategorized(user_id, limit.min(200));

    while summary.processed < limit {
        filter.limit = (limit - summary.processed).min(200);
        let records = db.list_pending_bank_transactions(&filter)?;
        if records.is_empty() {
            break;
        }

        for record in &records {
            filter.after_id = record.id;
            summary.processed += 1;

            let input = CategorizationInput {
                user_id: record.user_id,
                description: &record.description,
                merchant_name: record.merchant_name.as_deref(),
                merchant_category: record.merchant_category.as_deref(),
            };
            let suggestion = categorizer.categorize_with(db, &input)?;

            if !suggestion.is_categorized() {
                summary.uncategorized += 1;
                continue;
            }

            match db.update_bank_transaction_suggestion(
                record.id,
                suggestion.category_id,
                suggestion.confidence,
            ) {
                Ok(true) => summary.categorized += 1,
                // Moved on concurrently (converted or ignored); nothing to do
                Ok(false) => {}
                Err(e) => {
                    warn!(record_id = record.id, error = %e, "Failed to store suggestion");
                    summary.failed += 1;
                }
            }
        }
    }

    Ok(summary)
}

/// Apply a manual correction and reinforce the matching learned pattern
pub fn learn_from_correction(
    db: &Database,
    transaction_id: i64,
    category_id: i64,
) -> Result<LearnedPattern> {
    let transaction = db
        .get_transaction(transaction_id)?
        .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))?;
    db.get_category(category_id)?
        .ok_or_else(|| Error::NotFound(format!("category {}", category_id)))?;

    let pattern = db.learn_pattern(transaction.user_id, &transaction.description, category_id)?;
    db.set_transaction_category(transaction_id, Some(category_id))?;

    debug!(
        transaction_id,
        category_id,
        pattern = %pattern.pattern,
        confidence = pattern.confidence,
        "Learned from correction"
    );
    Ok(pattern)
}
