//! Account aggregator client
//!
//! Provides a trait-based abstraction over the external aggregation API:
//! - `HttpAggregator` - the real HTTP API (reqwest, timeouts, inline retries)
//! - `MockAggregator` - scripted in-process responses for tests
//!
//! Use `AggregatorClient` for enum-based dispatch so callers can hold one
//! concrete type regardless of the backend.

mod http;
mod mock;
mod types;

use async_trait::async_trait;
use chrono::NaiveDate;

pub use http::HttpAggregator;
pub use mock::MockAggregator;
pub use types::{
    describe_status, is_success_code, opt_string_or_number, string_or_number, AccessToken,
    ItemStatus, RemoteAccount, RemoteTransaction, ResourceList,
};

use crate::config::AggregatorConfig;
use crate::error::Result;

/// Operations consumed from the aggregation API
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Exchange a user's external identity for a bearer token
    ///
    /// Fails with `AuthenticationFailure` on any non-success outcome.
    async fn request_token(&self, external_user_id: &str) -> Result<AccessToken>;

    /// All accounts of an item; `ItemNotFound` if the item is gone
    async fn list_accounts(&self, token: &AccessToken, item_id: &str)
        -> Result<Vec<RemoteAccount>>;

    /// One page of an account's transactions since `since`
    async fn list_transactions(
        &self,
        token: &AccessToken,
        account_id: &str,
        since: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RemoteTransaction>>;

    /// Item health; `ItemNotFound` if the item is gone
    async fn get_item(&self, token: &AccessToken, item_id: &str) -> Result<ItemStatus>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Unified aggregator client that wraps the available backends
#[derive(Clone)]
pub enum AggregatorClient {
    Http(HttpAggregator),
    Mock(MockAggregator),
}

impl AggregatorClient {
    /// Build the HTTP client from configuration
    pub fn from_config(config: &AggregatorConfig) -> Result<Self> {
        Ok(AggregatorClient::Http(HttpAggregator::new(config.clone())?))
    }

    pub fn mock(mock: MockAggregator) -> Self {
        AggregatorClient::Mock(mock)
    }
}

#[async_trait]
impl Aggregator for AggregatorClient {
    async fn request_token(&self, external_user_id: &str) -> Result<AccessToken> {
        match self {
            AggregatorClient::Http(b) => b.request_token(external_user_id).await,
            AggregatorClient::Mock(b) => b.request_token(external_user_id).await,
        }
    }

    async fn list_accounts(
        &self,
        token: &AccessToken,
        item_id: &str,
    ) -> Result<Vec<RemoteAccount>> {
        match self {
            AggregatorClient::Http(b) => b.list_accounts(token, item_id).await,
            AggregatorClient::Mock(b) => b.list_accounts(token, item_id).await,
        }
    }

    async fn list_transactions(
        &self,
        token: &AccessToken,
        account_id: &str,
        since: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RemoteTransaction>> {
        match self {
            AggregatorClient::Http(b) => b.list_transactions(token, account_id, since, limit).await,
            AggregatorClient::Mock(b) => b.list_transactions(token, account_id, since, limit).await,
        }
    }

    async fn get_item(&self, token: &AccessToken, item_id: &str) -> Result<ItemStatus> {
        match self {
            AggregatorClient::Http(b) => b.get_item(token, item_id).await,
            AggregatorClient::Mock(b) => b.get_item(token, item_id).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            AggregatorClient::Http(b) => b.name(),
            AggregatorClient::Mock(b) => b.name(),
        }
    }
}
