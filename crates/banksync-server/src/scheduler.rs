//! Background auto-sync scheduler
//!
//! Optional periodic sweep enabled via environment variables:
//!
//! - `BANKSYNC_AUTOSYNC_INTERVAL_MINUTES`: minutes between sweeps (e.g. "60")
//!
//! Each sweep enqueues a `SyncConnection` job for every active, auto-sync
//! connection whose sync frequency has elapsed. The worker pool does the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};

use banksync_core::config::JobsConfig;
use banksync_core::{Database, Job, JobQueue};

/// Configuration for the auto-sync sweep
#[derive(Debug, Clone)]
pub struct AutoSyncScheduleConfig {
    /// Interval between sweeps in minutes
    pub interval_minutes: u64,
}

impl AutoSyncScheduleConfig {
    /// Parse configuration from environment variables
    ///
    /// Returns None if scheduling is not configured (BANKSYNC_AUTOSYNC_INTERVAL_MINUTES not set)
    pub fn from_env() -> Option<Self> {
        let interval_minutes: u64 = std::env::var("BANKSYNC_AUTOSYNC_INTERVAL_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())?;

        if interval_minutes == 0 {
            warn!("BANKSYNC_AUTOSYNC_INTERVAL_MINUTES is 0, automatic sync disabled");
            return None;
        }

        Some(Self { interval_minutes })
    }
}

/// Start the auto-sync scheduler as a background task
pub fn start_auto_sync_scheduler(
    db: Database,
    queue: Arc<dyn JobQueue>,
    jobs: JobsConfig,
    config: AutoSyncScheduleConfig,
) {
    info!(
        "Starting auto-sync scheduler: every {} minutes",
        config.interval_minutes
    );

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(config.interval_minutes * 60));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match enqueue_due_syncs(&db, queue.as_ref(), &jobs, Utc::now()) {
                Ok(0) => {}
                Ok(count) => info!("Scheduled {} connection sync(s)", count),
                Err(e) => error!("Auto-sync sweep failed: {}", e),
            }
        }
    });
}

/// Enqueue a sync for every connection due at `now`
///
/// Stops at the first enqueue failure, which only happens while the pool is
/// shutting down.
pub fn enqueue_due_syncs(
    db: &Database,
    queue: &dyn JobQueue,
    jobs: &JobsConfig,
    now: DateTime<Utc>,
) -> banksync_core::Result<usize> {
    let due = db.list_connections_needing_sync(now)?;
    for connection in &due {
        queue.submit(
            Job::SyncConnection {
                connection_id: connection.id,
            },
            jobs,
        )?;
    }
    Ok(due.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use banksync_core::{LifecycleEvent, LifecyclePolicy, RecordingQueue};

    #[test]
    fn test_config_from_env() {
        // Not set
        std::env::remove_var("BANKSYNC_AUTOSYNC_INTERVAL_MINUTES");
        assert!(AutoSyncScheduleConfig::from_env().is_none());

        // Zero disables
        std::env::set_var("BANKSYNC_AUTOSYNC_INTERVAL_MINUTES", "0");
        assert!(AutoSyncScheduleConfig::from_env().is_none());

        std::env::set_var("BANKSYNC_AUTOSYNC_INTERVAL_MINUTES", "30");
        let config = AutoSyncScheduleConfig::from_env().unwrap();
        assert_eq!(config.interval_minutes, 30);

        std::env::remove_var("BANKSYNC_AUTOSYNC_INTERVAL_MINUTES");
    }

    #[test]
    fn test_enqueue_due_syncs() {
        let db = Database::in_memory().unwrap();
        let user_id = db.upsert_user("ana@example.com", "ext-ana").unwrap();
        let (pending, _) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();
        let (active, _) = db.upsert_connection(user_id, "item-2", None, 24).unwrap();
        db.apply_lifecycle_event(active, &LifecyclePolicy::default(), &LifecycleEvent::activated())
            .unwrap();

        let queue = RecordingQueue::new();
        let jobs = JobsConfig::default();
        let count = enqueue_due_syncs(&db, &queue, &jobs, Utc::now()).unwrap();

        assert_eq!(count, 1);
        let queued = queue.take();
        assert_eq!(
            queued[0].0,
            Job::SyncConnection {
                connection_id: active
            }
        );
        assert_ne!(active, pending);
    }
}
