//! Connection lifecycle state machine
//!
//! The lifecycle of a bank connection is modelled as a value (`ConnectionState`)
//! and a pure transition function over `LifecycleEvent`s. Storage loads the
//! state, applies `transition`, and writes the result back in one unit of work
//! (see `Database::apply_lifecycle_event`), so everything here is testable
//! without a database.
//!
//! ```text
//! pending -> active <-> error -> disabled
//!     \________\_________\________\____> expired | disconnected
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Connection, ConnectionStatus};

/// Thresholds that drive error escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Consecutive sync errors after which a connection is marked `error`
    pub error_threshold: u32,
    /// Consecutive sync errors after which the connection is `disabled`
    pub disable_threshold: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            disable_threshold: 10,
        }
    }
}

/// The mutable lifecycle fields of a connection
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_active: bool,
    pub auto_sync: bool,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
}

impl From<&Connection> for ConnectionState {
    fn from(c: &Connection) -> Self {
        Self {
            status: c.status,
            is_active: c.is_active,
            auto_sync: c.auto_sync,
            error_count: c.error_count,
            last_error: c.last_error.clone(),
            last_error_at: c.last_error_at,
            last_sync_at: c.last_sync_at,
            last_successful_sync_at: c.last_successful_sync_at,
        }
    }
}

/// Something that happened to a connection
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// The aggregator finished connecting or re-authenticating the item
    Activated { at: DateTime<Utc> },
    /// A polled sync completed
    SyncSucceeded { at: DateTime<Utc> },
    /// A polled sync failed (network, auth or unhealthy item status)
    SyncFailed { message: String, at: DateTime<Utc> },
    /// A webhook reported a failed refresh; recorded but not counted
    RefreshFailed { message: String, at: DateTime<Utc> },
    /// The aggregator answered 404 for the item
    ItemNotFound { at: DateTime<Utc> },
    Disabled { at: DateTime<Utc> },
    Disconnected { at: DateTime<Utc> },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::SyncSucceeded { .. } => "sync_succeeded",
            Self::SyncFailed { .. } => "sync_failed",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::ItemNotFound { .. } => "item_not_found",
            Self::Disabled { .. } => "disabled",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    pub fn sync_succeeded() -> Self {
        Self::SyncSucceeded { at: Utc::now() }
    }

    pub fn sync_failed(message: impl Into<String>) -> Self {
        Self::SyncFailed {
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn refresh_failed(message: impl Into<String>) -> Self {
        Self::RefreshFailed {
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn item_not_found() -> Self {
        Self::ItemNotFound { at: Utc::now() }
    }

    pub fn activated() -> Self {
        Self::Activated { at: Utc::now() }
    }
}

/// Apply an event to a connection state
///
/// Disconnected connections never change. A connection in `error` only goes
/// back to `active` through `SyncSucceeded`.
pub fn transition(
    policy: &LifecyclePolicy,
    state: &ConnectionState,
    event: &LifecycleEvent,
) -> ConnectionState {
    use ConnectionStatus::*;

    let mut next = state.clone();
    if state.status.is_terminal() {
        return next;
    }

    match event {
        LifecycleEvent::Activated { .. } => {
            if matches!(state.status, Pending | Expired) {
                next.status = Active;
                next.is_active = true;
            }
        }
        LifecycleEvent::SyncSucceeded { at } => {
            if state.status == Expired {
                return next;
            }
            if state.status == Disabled {
                next.auto_sync = true;
            }
            next.status = Active;
            next.is_active = true;
            next.error_count = 0;
            next.last_error = None;
            next.last_error_at = None;
            next.last_sync_at = Some(*at);
            next.last_successful_sync_at = Some(*at);
        }
        LifecycleEvent::SyncFailed { message, at } => {
            next.last_error = Some(message.clone());
            next.last_error_at = Some(*at);
            next.last_sync_at = Some(*at);

            if state.status.is_syncable() {
                next.error_count = state.error_count.saturating_add(1);
                if next.error_count >= policy.disable_threshold {
                    next.status = Disabled;
                    next.auto_sync = false;
                } else if next.error_count >= policy.error_threshold {
                    next.status = Error;
                }
            }
        }
        LifecycleEvent::RefreshFailed { message, at } => {
            next.last_error = Some(message.clone());
            next.last_error_at = Some(*at);
        }
        LifecycleEvent::ItemNotFound { at } => {
            next.status = Expired;
            next.last_error = Some("Item not found at aggregator".to_string());
            next.last_error_at = Some(*at);
        }
        LifecycleEvent::Disabled { .. } => {
            next.status = Disabled;
            next.auto_sync = false;
        }
        LifecycleEvent::Disconnected { .. } => {
            next.status = Disconnected;
            next.is_active = false;
            next.auto_sync = false;
        }
    }

    next
}

/// Whether the scheduler should sync this connection now
pub fn needs_sync(connection: &Connection, now: DateTime<Utc>) -> bool {
    if connection.is_deleted() || !connection.auto_sync {
        return false;
    }
    if connection.status != ConnectionStatus::Active {
        return false;
    }

    match connection.last_sync_at {
        None => true,
        Some(last) => now - last >= Duration::hours(connection.sync_frequency_hours as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> ConnectionState {
        ConnectionState {
            status: ConnectionStatus::Active,
            is_active: true,
            auto_sync: true,
            ..Default::default()
        }
    }

    fn apply(state: &ConnectionState, events: &[LifecycleEvent]) -> ConnectionState {
        let policy = LifecyclePolicy::default();
        events
            .iter()
            .fold(state.clone(), |s, e| transition(&policy, &s, e))
    }

    fn connection(status: ConnectionStatus, last_sync: Option<DateTime<Utc>>) -> Connection {
        let now = Utc::now();
        Connection {
            id: 1,
            user_id: 1,
            item_id: "item-1".to_string(),
            provider_name: None,
            bank_name: None,
            status,
            is_active: true,
            last_sync_at: last_sync,
            last_successful_sync_at: last_sync,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            auto_sync: true,
            sync_frequency_hours: 24,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_four_errors_leave_status_unchanged() {
        let failures: Vec<_> = (0..4)
            .map(|i| LifecycleEvent::sync_failed(format!("timeout {}", i)))
            .collect();

        let state = apply(&active(), &failures);
        assert_eq!(state.status, ConnectionStatus::Active);
        assert_eq!(state.error_count, 4);
        assert_eq!(state.last_error.as_deref(), Some("timeout 3"));

        let pending = ConnectionState::default();
        let state = apply(&pending, &failures);
        assert_eq!(state.status, ConnectionStatus::Pending);
    }

    #[test]
    fn test_fifth_error_escalates() {
        let failures: Vec<_> = (0..5).map(|_| LifecycleEvent::sync_failed("boom")).collect();
        let state = apply(&active(), &failures);
        assert_eq!(state.status, ConnectionStatus::Error);
        assert_eq!(state.error_count, 5);
    }

    #[test]
    fn test_error_is_sticky_until_successful_sync() {
        let mut events: Vec<_> = (0..5).map(|_| LifecycleEvent::sync_failed("boom")).collect();
        events.push(LifecycleEvent::activated());
        let state = apply(&active(), &events);
        assert_eq!(state.status, ConnectionStatus::Error);

        let state = apply(&state, &[LifecycleEvent::sync_succeeded()]);
        assert_eq!(state.status, ConnectionStatus::Active);
        assert_eq!(state.error_count, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_sync_at.is_some());
        assert_eq!(state.last_sync_at, state.last_successful_sync_at);
    }

    #[test]
    fn test_escalates_to_disabled() {
        let failures: Vec<_> = (0..10).map(|_| LifecycleEvent::sync_failed("boom")).collect();
        let state = apply(&active(), &failures);
        assert_eq!(state.status, ConnectionStatus::Disabled);
        assert!(!state.auto_sync);
    }

    #[test]
    fn test_sync_success_is_idempotent() {
        let at = Utc::now();
        let event = LifecycleEvent::SyncSucceeded { at };
        let once = apply(&active(), &[event.clone()]);
        let twice = apply(&once, &[event]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_item_not_found_bypasses_threshold() {
        let state = apply(&active(), &[LifecycleEvent::item_not_found()]);
        assert_eq!(state.status, ConnectionStatus::Expired);
        assert_eq!(state.error_count, 0);

        let mut errored = active();
        errored.error_count = 3;
        let state = apply(&errored, &[LifecycleEvent::item_not_found()]);
        assert_eq!(state.status, ConnectionStatus::Expired);
    }

    #[test]
    fn test_refresh_failure_does_not_count() {
        let state = apply(
            &active(),
            &[
                LifecycleEvent::refresh_failed("402 wrong credentials"),
                LifecycleEvent::refresh_failed("402 wrong credentials"),
            ],
        );
        assert_eq!(state.status, ConnectionStatus::Active);
        assert_eq!(state.error_count, 0);
        assert_eq!(state.last_error.as_deref(), Some("402 wrong credentials"));
    }

    #[test]
    fn test_activation_from_pending_and_expired() {
        let state = apply(&ConnectionState::default(), &[LifecycleEvent::activated()]);
        assert_eq!(state.status, ConnectionStatus::Active);

        let expired = apply(&active(), &[LifecycleEvent::item_not_found()]);
        let state = apply(&expired, &[LifecycleEvent::activated()]);
        assert_eq!(state.status, ConnectionStatus::Active);
    }

    #[test]
    fn test_disconnected_is_terminal() {
        let state = apply(
            &active(),
            &[
                LifecycleEvent::Disconnected { at: Utc::now() },
                LifecycleEvent::activated(),
                LifecycleEvent::sync_succeeded(),
                LifecycleEvent::item_not_found(),
            ],
        );
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(!state.is_active);
    }

    #[test]
    fn test_needs_sync() {
        let now = Utc::now();

        assert!(needs_sync(&connection(ConnectionStatus::Active, None), now));
        assert!(!needs_sync(
            &connection(ConnectionStatus::Active, Some(now - Duration::hours(2))),
            now
        ));
        assert!(needs_sync(
            &connection(ConnectionStatus::Active, Some(now - Duration::hours(25))),
            now
        ));
        assert!(!needs_sync(&connection(ConnectionStatus::Error, None), now));
        assert!(!needs_sync(&connection(ConnectionStatus::Pending, None), now));

        let mut manual = connection(ConnectionStatus::Active, None);
        manual.auto_sync = false;
        assert!(!needs_sync(&manual, now));

        let mut deleted = connection(ConnectionStatus::Active, None);
        deleted.deleted_at = Some(now);
        assert!(!needs_sync(&deleted, now));
    }
}
