//! HTTP aggregator backend

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{ResourceList, TokenResponse};
use super::{AccessToken, Aggregator, ItemStatus, RemoteAccount, RemoteTransaction};
use crate::config::AggregatorConfig;
use crate::error::{Error, Result};

const CLIENT_ID_HEADER: &str = "Client-Id";
const CLIENT_SECRET_HEADER: &str = "Client-Secret";
const VERSION_HEADER: &str = "Bridge-Version";

/// Aggregator API over HTTP
#[derive(Clone)]
pub struct HttpAggregator {
    client: Client,
    base_url: String,
    config: AggregatorConfig,
}

impl HttpAggregator {
    /// Create a client; requires client credentials
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        if config.client_id.is_none() || config.client_secret.is_none() {
            return Err(Error::Config(
                "Aggregator credentials missing. Set BANKSYNC_CLIENT_ID and BANKSYNC_CLIENT_SECRET."
                    .to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str, token: Option<&AccessToken>) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(VERSION_HEADER, &self.config.api_version)
            .header(
                CLIENT_ID_HEADER,
                self.config.client_id.as_deref().unwrap_or_default(),
            )
            .header(
                CLIENT_SECRET_HEADER,
                self.config.client_secret.as_deref().unwrap_or_default(),
            );
        if let Some(token) = token {
            builder = builder.bearer_auth(&token.token);
        }
        builder
    }

    /// Send a request with a per-attempt timeout and fixed-backoff retries
    ///
    /// Transport errors, 429 and 5xx are retried; any other non-success status
    /// is returned immediately as `Error::Aggregator`. Exhausted retries turn
    /// into `TransientNetwork`.
    async fn send_with_retry<T, F>(&self, operation: &str, timeout: Duration, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.config.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match build().timeout(timeout).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(operation, attempt, "Aggregator call succeeded");
                        return Ok(response.json::<T>().await?);
                    }

                    let body = response.text().await.unwrap_or_default();
                    if !is_retryable_status(status) {
                        return Err(Error::Aggregator {
                            status: status.as_u16(),
                            message: truncate_body(&body),
                        });
                    }
                    last_error = format!("HTTP {}: {}", status.as_u16(), truncate_body(&body));
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < attempts {
                warn!(
                    operation,
                    attempt,
                    backoff_ms = self.config.retry_backoff.as_millis() as u64,
                    error = %last_error,
                    "Aggregator call failed, retrying"
                );
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }

        Err(Error::TransientNetwork(format!(
            "{} failed after {} attempts: {}",
            operation, attempts, last_error
        )))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn truncate_body(body: &str) -> String {
    body.chars().take(200).collect()
}

/// A 404 on an item-scoped call means the item is gone
fn item_scoped(err: Error, item_id: &str) -> Error {
    match err {
        Error::Aggregator { status: 404, .. } => Error::ItemNotFound(item_id.to_string()),
        other => other,
    }
}

#[async_trait]
impl Aggregator for HttpAggregator {
    async fn request_token(&self, external_user_id: &str) -> Result<AccessToken> {
        let body = serde_json::json!({ "external_user_id": external_user_id });

        let response: TokenResponse = self
            .send_with_retry("token", self.config.token_timeout, || {
                self.request(Method::POST, "/v3/aggregation/authorization/token", None)
                    .json(&body)
            })
            .await
            .map_err(|e| Error::AuthenticationFailure(e.to_string()))?;

        Ok(response.into_token())
    }

    async fn list_accounts(
        &self,
        token: &AccessToken,
        item_id: &str,
    ) -> Result<Vec<RemoteAccount>> {
        let list: ResourceList<RemoteAccount> = self
            .send_with_retry("accounts", self.config.accounts_timeout, || {
                self.request(Method::GET, "/v3/aggregation/accounts", Some(token))
                    .query(&[("item_id", item_id)])
            })
            .await
            .map_err(|e| item_scoped(e, item_id))?;

        Ok(list.resources)
    }

    async fn list_transactions(
        &self,
        token: &AccessToken,
        account_id: &str,
        since: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RemoteTransaction>> {
        let since = since.format("%Y-%m-%d").to_string();
        let limit = limit.to_string();

        let list: ResourceList<RemoteTransaction> = self
            .send_with_retry("transactions", self.config.transactions_timeout, || {
                self.request(Method::GET, "/v3/aggregation/transactions", Some(token))
                    .query(&[
                        ("account_id", account_id),
                        ("since", since.as_str()),
                        ("limit", limit.as_str()),
                    ])
            })
            .await?;

        Ok(list.resources)
    }

    async fn get_item(&self, token: &AccessToken, item_id: &str) -> Result<ItemStatus> {
        let path = format!("/v3/aggregation/items/{}", item_id);

        self.send_with_retry("item", self.config.item_timeout, || {
            self.request(Method::GET, &path, Some(token))
        })
        .await
        .map_err(|e| item_scoped(e, item_id))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockAggregatorServer;

    fn config_for(url: &str) -> AggregatorConfig {
        AggregatorConfig {
            base_url: url.to_string(),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            retry_backoff: Duration::from_millis(10),
            ..AggregatorConfig::default()
        }
    }

    #[test]
    fn test_requires_credentials() {
        let result = HttpAggregator::new(AggregatorConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_token_and_listing() {
        let server = MockAggregatorServer::start().await;
        let client = HttpAggregator::new(config_for(&server.url())).unwrap();

        let token = client.request_token("user-ext-1").await.unwrap();
        assert!(!token.token.is_empty());

        let accounts = client.list_accounts(&token, "item-1").await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "acc-1");

        let since = chrono::Utc::now().date_naive() - chrono::Duration::days(90);
        let txs = client
            .list_transactions(&token, "acc-1", since, 50)
            .await
            .unwrap();
        assert_eq!(txs.len(), 3);

        let item = client.get_item(&token, "item-1").await.unwrap();
        assert!(item.is_healthy());
    }

    #[tokio::test]
    async fn test_unknown_item_is_item_not_found() {
        let server = MockAggregatorServer::start().await;
        let client = HttpAggregator::new(config_for(&server.url())).unwrap();
        let token = client.request_token("user-ext-1").await.unwrap();

        let err = client.get_item(&token, "gone").await.unwrap_err();
        assert!(matches!(err, Error::ItemNotFound(_)));

        let err = client.list_accounts(&token, "gone").await.unwrap_err();
        assert!(matches!(err, Error::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_bad_credentials_is_authentication_failure() {
        let server = MockAggregatorServer::start().await;
        let mut config = config_for(&server.url());
        config.client_secret = Some("wrong".to_string());
        let client = HttpAggregator::new(config).unwrap();

        let err = client.request_token("user-ext-1").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockAggregatorServer::start().await;
        server.fail_next(1);
        let client = HttpAggregator::new(config_for(&server.url())).unwrap();

        // One 503, then success within the two allowed attempts
        let token = client.request_token("user-ext-1").await;
        assert!(token.is_ok());
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_transient() {
        let server = MockAggregatorServer::start().await;
        server.fail_next(10);
        let client = HttpAggregator::new(config_for(&server.url())).unwrap();
        let token = AccessToken {
            token: "t".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };

        let err = client.get_item(&token, "item-1").await.unwrap_err();
        assert!(matches!(err, Error::TransientNetwork(_)));
        assert!(err.is_retryable());
        assert_eq!(server.hits(), 2);
    }
}
