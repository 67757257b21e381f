//! Mock aggregator for testing
//!
//! Holds scripted items, accounts and transactions in memory. Clones share
//! state, so a test can keep a handle and inspect call counts after handing a
//! copy to the code under test.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use super::{AccessToken, Aggregator, ItemStatus, RemoteAccount, RemoteTransaction};
use crate::error::{Error, Result};

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, Vec<RemoteAccount>>,
    transactions: HashMap<String, Vec<RemoteTransaction>>,
    items: HashMap<String, ItemStatus>,
    missing_items: HashSet<String>,
    failing_accounts: HashSet<String>,
    fail_account_listing: bool,
    issued_tokens: Vec<String>,
    revoked_tokens: HashSet<String>,
    fail_token: bool,
    token_requests: usize,
    transaction_requests: usize,
}

impl MockState {
    fn check_token(&self, token: &AccessToken) -> Result<()> {
        if self.revoked_tokens.contains(&token.token) {
            return Err(Error::Aggregator {
                status: 401,
                message: "token revoked".to_string(),
            });
        }
        Ok(())
    }
}

/// Mock aggregator backend
#[derive(Clone, Default)]
pub struct MockAggregator {
    state: Arc<Mutex<MockState>>,
}

impl MockAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread poisons the lock; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach an account to an item
    pub fn with_account(self, item_id: &str, account: RemoteAccount) -> Self {
        self.state()
            .accounts
            .entry(item_id.to_string())
            .or_default()
            .push(account);
        self
    }

    pub fn with_transactions(self, account_id: &str, transactions: Vec<RemoteTransaction>) -> Self {
        self.state()
            .transactions
            .entry(account_id.to_string())
            .or_default()
            .extend(transactions);
        self
    }

    pub fn with_item(self, item: ItemStatus) -> Self {
        self.state().items.insert(item.id.clone(), item);
        self
    }

    /// Make every item-scoped call for `item_id` fail with `ItemNotFound`
    pub fn with_missing_item(self, item_id: &str) -> Self {
        self.state().missing_items.insert(item_id.to_string());
        self
    }

    pub fn fail_token(self) -> Self {
        self.state().fail_token = true;
        self
    }

    /// Make transaction listing for one account fail with a transient error
    pub fn fail_transactions_for(self, account_id: &str) -> Self {
        self.state().failing_accounts.insert(account_id.to_string());
        self
    }

    /// Make account listing fail with a transient error
    pub fn fail_accounts(self) -> Self {
        self.state().fail_account_listing = true;
        self
    }

    /// Reject every token handed out so far with a 401
    pub fn revoke_issued_tokens(&self) {
        let mut state = self.state();
        let issued = std::mem::take(&mut state.issued_tokens);
        state.revoked_tokens.extend(issued);
    }

    /// Replace an account's transactions (simulates new bank activity)
    pub fn set_transactions(&self, account_id: &str, transactions: Vec<RemoteTransaction>) {
        self.state()
            .transactions
            .insert(account_id.to_string(), transactions);
    }

    pub fn token_requests(&self) -> usize {
        self.state().token_requests
    }

    pub fn transaction_requests(&self) -> usize {
        self.state().transaction_requests
    }
}

#[async_trait]
impl Aggregator for MockAggregator {
    async fn request_token(&self, external_user_id: &str) -> Result<AccessToken> {
        let mut state = self.state();
        state.token_requests += 1;
        if state.fail_token {
            return Err(Error::AuthenticationFailure(format!(
                "mock token refused for {}",
                external_user_id
            )));
        }
        let token = format!("mock-token-{}-{}", external_user_id, state.token_requests);
        state.issued_tokens.push(token.clone());
        Ok(AccessToken {
            token,
            expires_at: Utc::now() + chrono::Duration::hours(2),
        })
    }

    async fn list_accounts(
        &self,
        token: &AccessToken,
        item_id: &str,
    ) -> Result<Vec<RemoteAccount>> {
        let state = self.state();
        state.check_token(token)?;
        if state.missing_items.contains(item_id) {
            return Err(Error::ItemNotFound(item_id.to_string()));
        }
        if state.fail_account_listing {
            return Err(Error::TransientNetwork(format!(
                "mock timeout listing accounts for {}",
                item_id
            )));
        }
        Ok(state.accounts.get(item_id).cloned().unwrap_or_default())
    }

    async fn list_transactions(
        &self,
        token: &AccessToken,
        account_id: &str,
        since: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RemoteTransaction>> {
        let mut state = self.state();
        state.transaction_requests += 1;
        state.check_token(token)?;
        if state.failing_accounts.contains(account_id) {
            return Err(Error::TransientNetwork(format!(
                "mock timeout listing transactions for {}",
                account_id
            )));
        }
        Ok(state
            .transactions
            .get(account_id)
            .map(|txs| {
                txs.iter()
                    .filter(|tx| tx.date >= since)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_item(&self, token: &AccessToken, item_id: &str) -> Result<ItemStatus> {
        let state = self.state();
        state.check_token(token)?;
        if state.missing_items.contains(item_id) {
            return Err(Error::ItemNotFound(item_id.to_string()));
        }
        Ok(state
            .items
            .get(item_id)
            .cloned()
            .unwrap_or_else(|| ItemStatus::healthy(item_id)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
