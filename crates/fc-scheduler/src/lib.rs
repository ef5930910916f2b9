//! Dispatch scheduler.
//!
//! Selects due PENDING dispatch jobs, publishes one pointer per message
//! group onto the queue (FIFO per group, bounded cross-group concurrency),
//! sweeps expired jobs, reclaims stale QUEUED rows, and records delivery
//! completions reported back by the consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info};

use fc_common::WarningSink;
use fc_queue::QueuePublisher;

pub mod dispatcher;
pub mod feedback;
pub mod poller;
pub mod reclaim;
pub mod store;

pub use dispatcher::GroupDispatcher;
pub use feedback::SchedulerFeedback;
pub use poller::PendingJobPoller;
pub use reclaim::{ExpiredJobSweeper, StaleQueuedReclaimer};
pub use store::JobStore;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(String),

    #[error("queue error: {0}")]
    Queue(#[from] fc_queue::QueueError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    InFlight,
    Success,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::InFlight => "IN_FLIGHT",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "QUEUED" => Ok(JobStatus::Queued),
            "IN_FLIGHT" => Ok(JobStatus::InFlight),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "EXPIRED" => Ok(JobStatus::Expired),
            other => Err(SchedulerError::Config(format!("unknown job status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    Immediate,
    BlockOnError,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Immediate => "IMMEDIATE",
            DispatchMode::BlockOnError => "BLOCK_ON_ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "IMMEDIATE" => Ok(DispatchMode::Immediate),
            "BLOCK_ON_ERROR" => Ok(DispatchMode::BlockOnError),
            other => Err(SchedulerError::Config(format!(
                "unknown dispatch mode {other}"
            ))),
        }
    }
}

/// A persisted intended delivery, published onto the queue when due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: String,
    pub status: JobStatus,
    pub mode: DispatchMode,
    pub message_group: String,
    pub sequence: i64,
    pub dispatch_pool_id: String,
    pub target_url: String,
    pub payload: Option<serde_json::Value>,
    pub timeout_seconds: u32,
    pub max_retries: u32,
    pub retry_strategy: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Cap on groups being published concurrently.
    pub max_concurrent_groups: usize,
    pub stale_queued_threshold: Duration,
    pub stale_queued_poll_interval: Duration,
    pub expired_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_concurrent_groups: 16,
            stale_queued_threshold: Duration::from_secs(15 * 60),
            stale_queued_poll_interval: Duration::from_secs(30),
            expired_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Owns the three periodic loops. Construction wires the poller, group
/// dispatcher, sweeper and reclaimer around one shared job store.
pub struct DispatchScheduler {
    config: SchedulerConfig,
    poller: Arc<PendingJobPoller>,
    sweeper: Arc<ExpiredJobSweeper>,
    reclaimer: Arc<StaleQueuedReclaimer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DispatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<JobStore>,
        publisher: Arc<dyn QueuePublisher>,
        warnings: Option<Arc<dyn WarningSink>>,
    ) -> Self {
        let dispatcher = Arc::new(GroupDispatcher::new(
            store.clone(),
            publisher,
            config.max_concurrent_groups,
            warnings.clone(),
        ));
        let poller = Arc::new(PendingJobPoller::new(
            store.clone(),
            dispatcher,
            config.batch_size,
        ));
        let sweeper = Arc::new(ExpiredJobSweeper::new(store.clone(), warnings));
        let reclaimer = Arc::new(StaleQueuedReclaimer::new(
            store,
            config.stale_queued_threshold,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            poller,
            sweeper,
            reclaimer,
            shutdown_tx,
        }
    }

    pub fn start(&self) {
        if !self.config.enabled {
            info!("dispatch scheduler disabled");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrent_groups = self.config.max_concurrent_groups,
            "dispatch scheduler starting"
        );

        self.spawn_loop(self.config.poll_interval, {
            let poller = self.poller.clone();
            move || {
                let poller = poller.clone();
                async move { poller.poll().await }
            }
        });

        self.spawn_loop(self.config.expired_sweep_interval, {
            let sweeper = self.sweeper.clone();
            move || {
                let sweeper = sweeper.clone();
                async move { sweeper.sweep().await.map(|_| ()) }
            }
        });

        self.spawn_loop(self.config.stale_queued_poll_interval, {
            let reclaimer = self.reclaimer.clone();
            move || {
                let reclaimer = reclaimer.clone();
                async move { reclaimer.reclaim().await.map(|_| ()) }
            }
        });
    }

    fn spawn_loop<F, Fut>(&self, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task().await {
                            error!(error = %e, "scheduler loop iteration failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        info!("dispatch scheduler stopping");
        let _ = self.shutdown_tx.send(());
    }
}
