//! Background jobs and the in-process worker runtime
//!
//! Each unit of background work (one connection sync, one webhook, one batch)
//! is a `Job`. Producers only see the `JobQueue` trait; `WorkerPool` is the
//! tokio implementation with at-least-once execution, a wall-clock timeout
//! per attempt, and re-enqueue with backoff while attempts remain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::categorize::{categorize_pending, CategorizationSummary};
use crate::config::JobsConfig;
use crate::convert::{ConversionOptions, ConversionPipeline, ConversionSummary};
use crate::error::{Error, Result};
use crate::sync::{SyncReport, SyncService};
use crate::webhook::{WebhookOutcome, WebhookPayload, WebhookProcessor};

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    SyncConnection {
        connection_id: i64,
    },
    ProcessWebhook {
        payload: WebhookPayload,
    },
    CategorizeBatch {
        user_id: Option<i64>,
        limit: usize,
    },
    ConvertBatch {
        user_id: Option<i64>,
        limit: Option<usize>,
        dry_run: bool,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncConnection { .. } => "sync_connection",
            Self::ProcessWebhook { .. } => "process_webhook",
            Self::CategorizeBatch { .. } => "categorize_batch",
            Self::ConvertBatch { .. } => "convert_batch",
        }
    }
}

/// Queue-level retry settings for one enqueued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: u32,
    pub timeout: Duration,
}

impl JobOptions {
    /// Configured defaults for the job's kind
    pub fn for_job(job: &Job, config: &JobsConfig) -> Self {
        let settings = match job {
            Job::SyncConnection { .. } => config.sync,
            Job::ProcessWebhook { .. } => config.webhook,
            Job::CategorizeBatch { .. } => config.categorize,
            Job::ConvertBatch { .. } => config.convert,
        };
        Self {
            attempts: settings.attempts.max(1),
            timeout: settings.timeout,
        }
    }
}

/// Anything that accepts jobs for asynchronous execution
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job, options: JobOptions) -> Result<()>;

    /// Enqueue with the configured defaults for the job's kind
    fn submit(&self, job: Job, config: &JobsConfig) -> Result<()> {
        let options = JobOptions::for_job(&job, config);
        self.enqueue(job, options)
    }
}

/// Queue that only records what was enqueued
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<(Job, JobOptions)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(Job, JobOptions)> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<(Job, JobOptions)> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: Job, options: JobOptions) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job, options));
        Ok(())
    }
}

/// What a finished job produced
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutput {
    Synced(SyncReport),
    Webhook(WebhookOutcome),
    Categorized(CategorizationSummary),
    Converted(ConversionSummary),
    /// Shutdown was requested before the job started
    Cancelled,
}

/// Executes jobs against the shared services
#[derive(Clone)]
pub struct JobRunner {
    sync: SyncService,
    queue: Arc<dyn JobQueue>,
    shutdown: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(sync: SyncService, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            sync,
            queue,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn sync_service(&self) -> &SyncService {
        &self.sync
    }

    /// Run one job inline
    pub async fn execute(&self, job: &Job) -> Result<JobOutput> {
        match job {
            Job::SyncConnection { connection_id } => {
                if self.shutdown.load(Ordering::SeqCst) {
                    info!(connection_id, "Shutdown requested, sync job cancelled");
                    return Ok(JobOutput::Cancelled);
                }
                let report = self.sync.sync_connection(*connection_id).await?;
                Ok(JobOutput::Synced(report))
            }
            Job::ProcessWebhook { payload } => {
                let processor = WebhookProcessor::new(self.sync.clone(), self.queue.clone());
                Ok(JobOutput::Webhook(processor.process(payload).await?))
            }
            Job::CategorizeBatch { user_id, limit } => {
                let summary = categorize_pending(self.sync.db(), *user_id, *limit)?;
                Ok(JobOutput::Categorized(summary))
            }
            Job::ConvertBatch {
                user_id,
                limit,
                dry_run,
            } => {
                let options = ConversionOptions {
                    user_id: *user_id,
                    limit: *limit,
                    chunk_size: self.sync.config().conversion_chunk_size,
                    dry_run: *dry_run,
                };
                let summary = ConversionPipeline::new(self.sync.db().clone()).run(&options)?;
                Ok(JobOutput::Converted(summary))
            }
        }
    }
}

/// Terminal failure hook: logging only, no compensation
fn failed(job: &Job, attempts: u32, err: &Error) {
    error!(
        job = job.kind(),
        attempts,
        error = %err,
        "Job failed permanently"
    );
}

struct Envelope {
    job: Job,
    options: JobOptions,
    attempt: u32,
}

/// Cloneable producer handle onto a `WorkerPool`
#[derive(Clone)]
pub struct WorkerQueue {
    sender: mpsc::UnboundedSender<Envelope>,
    shutdown: Arc<AtomicBool>,
}

impl JobQueue for WorkerQueue {
    fn enqueue(&self, job: Job, options: JobOptions) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::InvalidData(format!(
                "worker pool is shutting down, {} not accepted",
                job.kind()
            )));
        }
        debug!(job = job.kind(), attempts = options.attempts, "Job enqueued");
        self.sender
            .send(Envelope {
                job,
                options,
                attempt: 1,
            })
            .map_err(|_| Error::InvalidData("worker pool is closed".to_string()))
    }
}

/// Fixed-size pool of tokio workers draining one channel
pub struct WorkerPool {
    queue: WorkerQueue,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers; must be called inside a tokio runtime
    pub fn start(sync: SyncService, config: &JobsConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(AtomicBool::new(false));

        let queue = WorkerQueue {
            sender,
            shutdown: shutdown.clone(),
        };
        let runner = JobRunner::new(sync, Arc::new(queue.clone())).with_shutdown(shutdown);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = config.workers.max(1);
        let handles = (0..workers)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    runner.clone(),
                    queue.clone(),
                    receiver.clone(),
                    shutdown_rx.clone(),
                    config.retry_backoff,
                ))
            })
            .collect();

        info!(workers, "Worker pool started");
        Self {
            queue,
            shutdown_tx,
            handles,
        }
    }

    /// Producer handle for this pool
    pub fn queue(&self) -> WorkerQueue {
        self.queue.clone()
    }

    /// Stop accepting work and wait for workers to finish their current job
    pub async fn shutdown(self) {
        self.queue.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    runner: JobRunner,
    queue: WorkerQueue,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    retry_backoff: Duration,
) {
    loop {
        let envelope = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                envelope = rx.recv() => envelope,
                _ = shutdown_rx.changed() => None,
            }
        };
        let Some(envelope) = envelope else {
            break;
        };

        let Envelope {
            job,
            options,
            attempt,
        } = envelope;
        debug!(worker, job = job.kind(), attempt, "Running job");

        let result = match tokio::time::timeout(options.timeout, runner.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(options.timeout.as_secs())),
        };

        match result {
            Ok(_) => debug!(worker, job = job.kind(), attempt, "Job done"),
            Err(e) if e.is_retryable() && attempt < options.attempts => {
                warn!(
                    job = job.kind(),
                    attempt,
                    backoff_secs = retry_backoff.as_secs(),
                    error = %e,
                    "Job failed, retrying"
                );
                let sender = queue.sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(retry_backoff).await;
                    let _ = sender.send(Envelope {
                        job,
                        options,
                        attempt: attempt + 1,
                    });
                });
            }
            Err(e) => failed(&job, attempt, &e),
        }
    }
    debug!(worker, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatorClient, MockAggregator, RemoteAccount, RemoteTransaction};
    use crate::config::{JobSettings, SyncConfig};
    use crate::db::Database;
    use crate::models::ConnectionStatus;

    fn service(mock: MockAggregator) -> (SyncService, i64) {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories().unwrap();
        let user_id = db.upsert_user("eli@example.com", "ext-eli").unwrap();
        let (connection_id, _) = db.upsert_connection(user_id, "item-1", None, 24).unwrap();
        (
            SyncService::new(db, AggregatorClient::mock(mock), SyncConfig::default()),
            connection_id,
        )
    }

    #[test]
    fn test_options_follow_config() {
        let config = JobsConfig::default();
        let sync = JobOptions::for_job(&Job::SyncConnection { connection_id: 1 }, &config);
        assert_eq!(sync.attempts, 3);
        assert_eq!(sync.timeout, Duration::from_secs(300));

        let batch = JobOptions::for_job(
            &Job::ConvertBatch {
                user_id: None,
                limit: None,
                dry_run: false,
            },
            &config,
        );
        assert_eq!(batch.attempts, 2);
        assert_eq!(batch.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_job_serialization_is_tagged() {
        let json = serde_json::to_value(Job::SyncConnection { connection_id: 7 }).unwrap();
        assert_eq!(json["kind"], "sync_connection");
        assert_eq!(json["connection_id"], 7);
    }

    #[tokio::test]
    async fn test_runner_executes_sync() {
        let mock = MockAggregator::new()
            .with_account("item-1", RemoteAccount::new("acc-1", "Compte", 0.0))
            .with_transactions(
                "acc-1",
                vec![RemoteTransaction::new("t1", -3.0, "CB LIDL", chrono::Utc::now().date_naive())],
            );
        let (sync, connection_id) = service(mock);
        let runner = JobRunner::new(sync, Arc::new(RecordingQueue::new()));

        let JobOutput::Synced(report) = runner
            .execute(&Job::SyncConnection { connection_id })
            .await
            .unwrap()
        else {
            panic!("expected sync output");
        };
        assert_eq!(report.import.imported, 1);

        let JobOutput::Converted(summary) = runner
            .execute(&Job::ConvertBatch {
                user_id: None,
                limit: None,
                dry_run: false,
            })
            .await
            .unwrap()
        else {
            panic!("expected conversion output");
        };
        assert_eq!(summary.converted, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sync_at_entry() {
        let (sync, connection_id) = service(MockAggregator::new());
        let runner = JobRunner::new(sync, Arc::new(RecordingQueue::new()))
            .with_shutdown(Arc::new(AtomicBool::new(true)));

        let output = runner
            .execute(&Job::SyncConnection { connection_id })
            .await
            .unwrap();
        assert!(matches!(output, JobOutput::Cancelled));
        let connection = runner.sync_service().db().get_connection(connection_id).unwrap().unwrap();
        assert!(connection.last_sync_at.is_none());
    }

    #[tokio::test]
    async fn test_pool_runs_jobs_and_retries() {
        // Token failures are retryable, so each attempt hits the aggregator
        let mock = MockAggregator::new().fail_token();
        let (sync, connection_id) = service(mock.clone());
        let db = sync.db().clone();

        let config = JobsConfig {
            workers: 2,
            retry_backoff: Duration::from_millis(10),
            sync: JobSettings {
                attempts: 3,
                timeout: Duration::from_secs(5),
            },
            ..JobsConfig::default()
        };
        let pool = WorkerPool::start(sync, &config);
        pool.queue()
            .submit(Job::SyncConnection { connection_id }, &config)
            .unwrap();

        for _ in 0..100 {
            if mock.token_requests() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give the last attempt time to persist its lifecycle update
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await;

        assert_eq!(mock.token_requests(), 3);
        let connection = db.get_connection(connection_id).unwrap().unwrap();
        assert_eq!(connection.error_count, 3);
        assert_eq!(connection.status, ConnectionStatus::Pending);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_jobs() {
        let (sync, connection_id) = service(MockAggregator::new());
        let pool = WorkerPool::start(sync, &JobsConfig::default());
        let queue = pool.queue();
        pool.shutdown().await;

        let result = queue.enqueue(
            Job::SyncConnection { connection_id },
            JobOptions {
                attempts: 1,
                timeout: Duration::from_secs(1),
            },
        );
        assert!(result.is_err());
    }
}
