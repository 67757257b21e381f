//! Per-user access token cache

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::aggregator::{AccessToken, Aggregator};
use crate::error::Result;

/// Exchanges a user's external identity for a bearer token and caches it
///
/// A cached token is reused until it is within `refresh_margin` of expiry,
/// so one sync run (accounts + every account's transactions) requests a
/// single token.
pub struct TokenProvider {
    refresh_margin: chrono::Duration,
    cache: Mutex<HashMap<String, AccessToken>>,
}

impl TokenProvider {
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A valid token for `external_user_id`, requesting a new one if needed
    ///
    /// Errors from the aggregator surface unchanged (`AuthenticationFailure`).
    pub async fn token_for<A>(&self, aggregator: &A, external_user_id: &str) -> Result<AccessToken>
    where
        A: Aggregator + ?Sized,
    {
        if let Some(token) = self.cached(external_user_id) {
            return Ok(token);
        }

        debug!(external_user_id, "Requesting aggregator token");
        let token = aggregator.request_token(external_user_id).await?;

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(external_user_id.to_string(), token.clone());
        Ok(token)
    }

    fn cached(&self, external_user_id: &str) -> Option<AccessToken> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(external_user_id)
            .filter(|t| t.is_valid_for(self.refresh_margin))
            .cloned()
    }

    /// Drop a user's cached token (e.g. after the aggregator rejected it)
    pub fn invalidate(&self, external_user_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(external_user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MockAggregator;
    use crate::error::Error;

    #[tokio::test]
    async fn test_reuses_cached_token() {
        let mock = MockAggregator::new();
        let provider = TokenProvider::new(Duration::from_secs(300));

        let first = provider.token_for(&mock, "user-1").await.unwrap();
        let second = provider.token_for(&mock, "user-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.token_requests(), 1);

        provider.token_for(&mock, "user-2").await.unwrap();
        assert_eq!(mock.token_requests(), 2);
    }

    #[tokio::test]
    async fn test_refreshes_inside_margin() {
        let mock = MockAggregator::new();
        // Mock tokens live two hours; a three hour margin means never reuse
        let provider = TokenProvider::new(Duration::from_secs(3 * 3600));

        provider.token_for(&mock, "user-1").await.unwrap();
        provider.token_for(&mock, "user-1").await.unwrap();
        assert_eq!(mock.token_requests(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_failure() {
        let mock = MockAggregator::new();
        let provider = TokenProvider::new(Duration::from_secs(300));
        provider.token_for(&mock, "user-1").await.unwrap();
        provider.invalidate("user-1");
        provider.token_for(&mock, "user-1").await.unwrap();
        assert_eq!(mock.token_requests(), 2);

        let failing = MockAggregator::new().fail_token();
        let err = provider.token_for(&failing, "user-9").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)));
    }
}
