//! Domain models for banksync

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A local user, linked to the aggregator through a stable external identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Identity handle sent to the aggregator token endpoint and echoed in webhooks
    pub external_user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a bank connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Created, waiting for the aggregator to finish the first refresh
    #[default]
    Pending,
    Active,
    /// Too many consecutive sync failures; only a successful sync recovers it
    Error,
    /// The aggregator no longer recognizes the item
    Expired,
    /// Auto-sync switched off after repeated failures
    Disabled,
    /// Explicitly disconnected by the user (terminal)
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
            Self::Expired => "expired",
            Self::Disabled => "disabled",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn all() -> &'static [ConnectionStatus] {
        &[
            Self::Pending,
            Self::Active,
            Self::Error,
            Self::Expired,
            Self::Disabled,
            Self::Disconnected,
        ]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Whether a sync job may run against a connection in this status
    pub fn is_syncable(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Error)
    }

    /// Whether a sync requested for this one connection may run
    ///
    /// Wider than `is_syncable`: a `disabled` connection only comes back
    /// through a successful sync, which has to be asked for explicitly.
    pub fn accepts_requested_sync(&self) -> bool {
        self.is_syncable() || matches!(self, Self::Disabled)
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            "expired" => Ok(Self::Expired),
            "disabled" => Ok(Self::Disabled),
            "disconnected" => Ok(Self::Disconnected),
            _ => Err(format!("Unknown connection status: {}", s)),
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bank connection mirroring one aggregator item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: i64,
    pub user_id: i64,
    /// Aggregator item identifier
    pub item_id: String,
    pub provider_name: Option<String>,
    /// Bank display name, stored once the item is finalized
    pub bank_name: Option<String>,
    pub status: ConnectionStatus,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub auto_sync: bool,
    pub sync_frequency_hours: u32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Bank account types reported by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    #[default]
    Checking,
    Savings,
    Credit,
    Investment,
    Loan,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Savings => "savings",
            Self::Credit => "credit",
            Self::Investment => "investment",
            Self::Loan => "loan",
        }
    }

    /// Map the aggregator's account type vocabulary onto ours
    ///
    /// Unknown types fall back to checking.
    pub fn from_aggregator(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "checking" | "current" => Self::Checking,
            "savings" | "shared_saving_plan" | "life_insurance" => Self::Savings,
            "card" | "credit" | "credit_card" => Self::Credit,
            "investment" | "securities" | "brokerage" => Self::Investment,
            "loan" | "mortgage" | "consumer_loan" => Self::Loan,
            _ => Self::Checking,
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "checking" => Ok(Self::Checking),
            "savings" => Ok(Self::Savings),
            "credit" => Ok(Self::Credit),
            "investment" => Ok(Self::Investment),
            "loan" => Ok(Self::Loan),
            _ => Err(format!("Unknown account type: {}", s)),
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bank account synchronized from the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: i64,
    pub connection_id: i64,
    pub external_account_id: String,
    pub name: String,
    pub account_type: AccountType,
    pub balance: f64,
    pub currency: String,
    pub iban_masked: Option<String>,
    pub is_active: bool,
    pub last_balance_update: Option<DateTime<Utc>>,
    /// Provider metadata as JSON
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account data to upsert during account sync
#[derive(Debug, Clone)]
pub struct NewBankAccount {
    pub external_account_id: String,
    pub name: String,
    pub account_type: AccountType,
    pub balance: f64,
    pub currency: String,
    pub iban_masked: Option<String>,
    pub metadata: Option<String>,
}

/// Processing status of a raw import record
///
/// Moves forward only: imported -> categorized -> converted | ignored.
/// `Duplicate` is terminal and may be reached from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Imported,
    Categorized,
    Converted,
    Ignored,
    Duplicate,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::Categorized => "categorized",
            Self::Converted => "converted",
            Self::Ignored => "ignored",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn all() -> &'static [ProcessingStatus] {
        &[
            Self::Imported,
            Self::Categorized,
            Self::Converted,
            Self::Ignored,
            Self::Duplicate,
        ]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converted | Self::Ignored | Self::Duplicate)
    }

    /// Whether the record may still be promoted into the ledger
    pub fn is_convertible(&self) -> bool {
        matches!(self, Self::Imported | Self::Categorized)
    }

    pub fn can_advance_to(&self, next: ProcessingStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Self::Duplicate) => true,
            (Self::Imported, Self::Categorized | Self::Converted | Self::Ignored) => true,
            (Self::Categorized, Self::Converted | Self::Ignored) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "imported" => Ok(Self::Imported),
            "categorized" => Ok(Self::Categorized),
            "converted" => Ok(Self::Converted),
            "ignored" => Ok(Self::Ignored),
            "duplicate" => Ok(Self::Duplicate),
            _ => Err(format!("Unknown processing status: {}", s)),
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw import record: one bank movement as received from the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: i64,
    pub user_id: i64,
    pub connection_id: i64,
    pub bank_account_id: i64,
    pub external_transaction_id: String,
    /// Signed amount: negative for debits
    pub amount: f64,
    pub description: String,
    pub merchant_name: Option<String>,
    pub merchant_category: Option<String>,
    pub transaction_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub balance_after: Option<f64>,
    /// Full aggregator payload as JSON
    pub raw_data: Option<String>,
    pub processing_status: ProcessingStatus,
    pub suggested_category_id: Option<i64>,
    pub confidence_score: f64,
    /// Canonical transaction this record was converted into
    pub transaction_id: Option<i64>,
    pub converted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A raw import record before insertion
#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub user_id: i64,
    pub connection_id: i64,
    pub bank_account_id: i64,
    pub external_transaction_id: String,
    pub amount: f64,
    pub description: String,
    pub merchant_name: Option<String>,
    pub merchant_category: Option<String>,
    pub transaction_date: NaiveDate,
    pub value_date: Option<NaiveDate>,
    pub balance_after: Option<f64>,
    pub raw_data: Option<String>,
    pub suggested_category_id: Option<i64>,
    pub confidence_score: f64,
}

/// Ledger transaction type, derived from the sign of the bank amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Expense,
    Income,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Income => "income",
        }
    }

    /// Negative amounts are expenses, everything else is income
    pub fn from_amount(amount: f64) -> Self {
        if amount < 0.0 {
            Self::Expense
        } else {
            Self::Income
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "expense" => Ok(Self::Expense),
            "income" => Ok(Self::Income),
            _ => Err(format!("Unknown transaction type: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    #[default]
    Completed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical ledger transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub bank_account_id: Option<i64>,
    pub transaction_type: TransactionType,
    /// Always positive; the direction lives in `transaction_type`
    pub amount: f64,
    pub description: String,
    pub date: NaiveDate,
    pub status: TransactionStatus,
    pub is_imported: bool,
    pub auto_categorized: bool,
    pub from_aggregator: bool,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A canonical transaction before insertion
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub bank_account_id: Option<i64>,
    pub transaction_type: TransactionType,
    pub amount: f64,
    pub description: String,
    pub date: NaiveDate,
    pub status: TransactionStatus,
    pub is_imported: bool,
    pub auto_categorized: bool,
    pub from_aggregator: bool,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    #[default]
    Expense,
    Income,
}

impl CategoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Income => "income",
        }
    }
}

impl std::str::FromStr for CategoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "expense" => Ok(Self::Expense),
            "income" => Ok(Self::Income),
            _ => Err(format!("Unknown category kind: {}", s)),
        }
    }
}

/// A spending/income category; `user_id = None` marks a global category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub kind: CategoryKind,
}

/// A user-specific merchant -> category rule reinforced by corrections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: i64,
    pub user_id: i64,
    /// Normalized merchant pattern
    pub pattern: String,
    pub category_id: i64,
    pub match_count: i64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit log entry for administrative and webhook-driven mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub details: Option<String>,
}
