//! Aggregator webhook processing
//!
//! The HTTP handler only parses and enqueues; the work happens here, inside a
//! `ProcessWebhook` job. Every branch tolerates replays: connections are
//! upserted, lifecycle events are idempotent, and extra sync jobs only cost
//! redundant work because import deduplicates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::{describe_status, is_success_code, opt_string_or_number};
use crate::error::Result;
use crate::jobs::{Job, JobQueue};
use crate::lifecycle::LifecycleEvent;
use crate::sync::SyncService;

/// Inbound webhook body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: WebhookContent,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WebhookContent {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub item_id: Option<String>,
    #[serde(default, alias = "user_uuid")]
    pub user_external_id: Option<String>,
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub status_code_info: Option<String>,
    #[serde(default)]
    pub status_code_description: Option<String>,
}

impl WebhookPayload {
    pub fn event(&self) -> WebhookEvent {
        WebhookEvent::parse(&self.event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    ItemCreated,
    ItemUpdated,
    ItemRefreshed,
    ItemError,
    Unknown(String),
}

impl WebhookEvent {
    pub fn parse(event_type: &str) -> Self {
        match event_type.trim() {
            "item.created" => Self::ItemCreated,
            "item.updated" => Self::ItemUpdated,
            "item.refreshed" => Self::ItemRefreshed,
            "item.error" => Self::ItemError,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// What processing a webhook did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    ConnectionCreated { connection_id: i64, created: bool },
    Touched { connection_id: i64 },
    Refreshed { connection_id: i64 },
    RefreshFailed { connection_id: i64, reason: String },
    Ignored { reason: String },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

/// Dispatches webhook events to lifecycle changes and sync jobs
pub struct WebhookProcessor {
    sync: SyncService,
    queue: Arc<dyn JobQueue>,
}

impl WebhookProcessor {
    pub fn new(sync: SyncService, queue: Arc<dyn JobQueue>) -> Self {
        Self { sync, queue }
    }

    pub async fn process(&self, payload: &WebhookPayload) -> Result<WebhookOutcome> {
        let content = &payload.content;
        debug!(event = %payload.event_type, item_id = ?content.item_id, "Processing webhook");

        match payload.event() {
            WebhookEvent::ItemCreated => self.item_created(content),
            WebhookEvent::ItemUpdated => self.item_updated(content),
            WebhookEvent::ItemRefreshed => self.item_refreshed(content).await,
            WebhookEvent::ItemError => {
                warn!(
                    item_id = ?content.item_id,
                    status = %describe_status(
                        content.status_code,
                        content.status_code_info.as_deref(),
                        content.status_code_description.as_deref()
                    ),
                    "Aggregator reported item error"
                );
                Ok(WebhookOutcome::ignored("item.error is informational"))
            }
            WebhookEvent::Unknown(kind) => {
                warn!(event = %kind, "Unrecognized webhook event");
                Ok(WebhookOutcome::ignored(format!("unrecognized event {}", kind)))
            }
        }
    }

    fn item_created(&self, content: &WebhookContent) -> Result<WebhookOutcome> {
        let db = self.sync.db();
        let config = self.sync.config();

        let (Some(item_id), Some(external_id)) =
            (content.item_id.as_deref(), content.user_external_id.as_deref())
        else {
            warn!("item.created without item_id or user id");
            return Ok(WebhookOutcome::ignored("missing item_id or user id"));
        };

        let Some(user) = db.find_user_by_external_id(external_id)? else {
            warn!(item_id, external_user_id = external_id, "item.created for unknown user");
            return Ok(WebhookOutcome::ignored("unknown user"));
        };

        let (connection_id, created) =
            db.upsert_connection(user.id, item_id, None, config.default_sync_frequency_hours)?;
        db.apply_lifecycle_event(connection_id, &config.lifecycle, &LifecycleEvent::activated())?;

        if created {
            db.log_audit(
                "webhook",
                "connection_created",
                Some("connection"),
                Some(connection_id),
                Some(item_id),
            )?;
            info!(connection_id, user_id = user.id, item_id, "Connection created from webhook");
        }

        self.queue.submit(Job::SyncConnection { connection_id }, &config.jobs)?;

        Ok(WebhookOutcome::ConnectionCreated {
            connection_id,
            created,
        })
    }

    fn item_updated(&self, content: &WebhookContent) -> Result<WebhookOutcome> {
        let db = self.sync.db();
        let Some(connection) = content
            .item_id
            .as_deref()
            .map(|id| db.find_connection_by_item(id))
            .transpose()?
            .flatten()
        else {
            return Ok(WebhookOutcome::ignored("unknown item"));
        };

        db.touch_connection(connection.id)?;
        Ok(WebhookOutcome::Touched {
            connection_id: connection.id,
        })
    }

    async fn item_refreshed(&self, content: &WebhookContent) -> Result<WebhookOutcome> {
        let db = self.sync.db();
        let config = self.sync.config();

        let Some(connection) = content
            .item_id
            .as_deref()
            .map(|id| db.find_connection_by_item(id))
            .transpose()?
            .flatten()
        else {
            return Ok(WebhookOutcome::ignored("unknown item"));
        };

        if !is_success_code(content.status_code, content.status_code_info.as_deref()) {
            let reason = describe_status(
                content.status_code,
                content.status_code_info.as_deref(),
                content.status_code_description.as_deref(),
            );
            db.apply_lifecycle_event(
                connection.id,
                &config.lifecycle,
                &LifecycleEvent::refresh_failed(reason.clone()),
            )?;
            warn!(connection_id = connection.id, reason = %reason, "Item refresh failed");
            return Ok(WebhookOutcome::RefreshFailed {
                connection_id: connection.id,
                reason,
            });
        }

        let connection =
            db.apply_lifecycle_event(connection.id, &config.lifecycle, &LifecycleEvent::activated())?;

        if let Err(e) = self.sync.finalize_connection(&connection).await {
            // The sync job will try the item endpoint again
            warn!(connection_id = connection.id, error = %e, "Failed to finalize connection");
        }

        self.queue.submit(
            Job::SyncConnection {
                connection_id: connection.id,
            },
            &config.jobs,
        )?;

        Ok(WebhookOutcome::Refreshed {
            connection_id: connection.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatorClient, ItemStatus, MockAggregator};
    use crate::config::SyncConfig;
    use crate::db::Database;
    use crate::jobs::RecordingQueue;
    use crate::models::ConnectionStatus;

    fn setup(mock: MockAggregator) -> (WebhookProcessor, Arc<RecordingQueue>, Database, i64) {
        let db = Database::in_memory().unwrap();
        let user_id = db.upsert_user("noa@example.com", "ext-noa").unwrap();
        let queue = Arc::new(RecordingQueue::new());
        let sync = SyncService::new(db.clone(), AggregatorClient::mock(mock), SyncConfig::default());
        (WebhookProcessor::new(sync, queue.clone()), queue, db, user_id)
    }

    fn payload(json: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_payload_accepts_numeric_ids_and_type_alias() {
        let p = payload(serde_json::json!({
            "type": "item.refreshed",
            "content": { "item_id": 4242, "user_uuid": "ext-1", "status_code": 0 }
        }));
        assert_eq!(p.event(), WebhookEvent::ItemRefreshed);
        assert_eq!(p.content.item_id.as_deref(), Some("4242"));
        assert_eq!(p.content.user_external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_item_created_is_idempotent() {
        let (processor, queue, db, user_id) = setup(MockAggregator::new());
        let p = payload(serde_json::json!({
            "event_type": "item.created",
            "content": { "item_id": "item-9", "user_external_id": "ext-noa" }
        }));

        let first = processor.process(&p).await.unwrap();
        let second = processor.process(&p).await.unwrap();

        let WebhookOutcome::ConnectionCreated { connection_id, created: true } = first else {
            panic!("expected creation, got {:?}", first);
        };
        assert_eq!(
            second,
            WebhookOutcome::ConnectionCreated {
                connection_id,
                created: false
            }
        );

        let connections = db.list_connections(Some(user_id), false).unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].status, ConnectionStatus::Active);
        assert_eq!(queue.jobs().len(), 2);
        assert_eq!(db.list_audit_log(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_item_created_for_unknown_user() {
        let (processor, queue, _, _) = setup(MockAggregator::new());
        let outcome = processor
            .process(&payload(serde_json::json!({
                "event_type": "item.created",
                "content": { "item_id": "item-9", "user_external_id": "nobody" }
            })))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_success_activates_and_finalizes() {
        let mut item = ItemStatus::healthy("item-1");
        item.bank_name = Some("Banque Demo".to_string());
        let (processor, queue, db, user_id) = setup(MockAggregator::new().with_item(item));
        let (connection_id, _) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();

        let outcome = processor
            .process(&payload(serde_json::json!({
                "event_type": "item.refreshed",
                "content": { "item_id": "item-1", "status_code": 0 }
            })))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Refreshed { connection_id });

        let connection = db.get_connection(connection_id).unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.bank_name.as_deref(), Some("Banque Demo"));
        assert_eq!(queue.jobs()[0].0, Job::SyncConnection { connection_id });
    }

    #[tokio::test]
    async fn test_refreshed_failure_does_not_count() {
        let (processor, queue, db, user_id) = setup(MockAggregator::new());
        let (connection_id, _) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();

        let p = payload(serde_json::json!({
            "event_type": "item.refreshed",
            "content": { "item_id": "item-1", "status_code": 1010, "status_code_info": "sca_required" }
        }));
        for _ in 0..6 {
            let outcome = processor.process(&p).await.unwrap();
            assert!(matches!(outcome, WebhookOutcome::RefreshFailed { .. }));
        }

        let connection = db.get_connection(connection_id).unwrap().unwrap();
        assert_eq!(connection.error_count, 0);
        assert_eq!(connection.status, ConnectionStatus::Pending);
        assert!(connection.last_error.unwrap().contains("sca_required"));
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_updated_and_unknown_events() {
        let (processor, _, db, user_id) = setup(MockAggregator::new());
        let (connection_id, _) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();

        let outcome = processor
            .process(&payload(serde_json::json!({
                "event_type": "item.updated",
                "content": { "item_id": "item-1" }
            })))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Touched { connection_id });

        for kind in ["item.error", "account.created"] {
            let outcome = processor
                .process(&payload(serde_json::json!({ "event_type": kind, "content": {} })))
                .await
                .unwrap();
            assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        }
        let connection = db.get_connection(connection_id).unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Pending);
    }
}
