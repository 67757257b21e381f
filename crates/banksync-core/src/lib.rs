//! Banksync Core Library
//!
//! Bank account aggregation sync for a personal finance backend:
//! - Database access and migrations (SQLite / SQLCipher)
//! - Aggregator client with token caching, timeouts and inline retries
//! - Connection lifecycle state machine and error escalation
//! - Idempotent import of raw bank transactions
//! - Rule-based categorization with learned patterns
//! - Conversion of raw records into ledger transactions
//! - Webhook processing and an in-process job queue

pub mod aggregator;
pub mod categorize;
pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod sync;
pub mod token;
pub mod webhook;

/// Test utilities including a mock aggregator HTTP server
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use aggregator::{
    AccessToken, Aggregator, AggregatorClient, HttpAggregator, ItemStatus, MockAggregator,
    RemoteAccount, RemoteTransaction,
};
pub use categorize::{CategorizationInput, CategorizationSummary, Categorizer, Suggestion};
pub use config::SyncConfig;
pub use convert::{ConversionOptions, ConversionOutcome, ConversionPipeline, ConversionSummary};
pub use db::{BacklogReport, BankTransactionInsert, Database, PendingFilter};
pub use error::{Error, Result};
pub use jobs::{Job, JobOptions, JobOutput, JobQueue, JobRunner, RecordingQueue, WorkerPool, WorkerQueue};
pub use lifecycle::{LifecycleEvent, LifecyclePolicy};
pub use sync::{ImportSummary, SyncReport, SyncService};
pub use token::TokenProvider;
pub use webhook::{WebhookOutcome, WebhookPayload, WebhookProcessor};
