//! Dispatch scheduler server.
//!
//! Runs the pending-job poll, expired sweep and stale-QUEUED reclaim loops
//! against the dispatch-job database, publishing due jobs onto the queue.
//! With leader election enabled the loops run only on the lock holder.

use std::sync::Arc;
use std::time::Duration;

use std::str::FromStr;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use fc_config::{AppConfig, ConfigLoader, QueueKind};
use fc_queue::embedded::EmbeddedQueue;
use fc_queue::QueuePublisher;
use fc_scheduler::{DispatchScheduler, JobStore, SchedulerConfig};
use fc_standby::{LeaderConfig, LeaderElector, LeaderStatus};

#[tokio::main]
async fn main() -> Result<()> {
    fc_common::logging::init_logging();
    let config = ConfigLoader::load().context("configuration rejected")?;

    info!(database = %config.database.url, "starting dispatch scheduler");

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            SqliteConnectOptions::from_str(&config.database.url)?.create_if_missing(true),
        )
        .await
        .context("dispatch job database unavailable")?;
    let store = Arc::new(JobStore::new(db));
    store.init_schema().await?;

    let publisher = build_publisher(&config).await?;
    let scheduler = Arc::new(DispatchScheduler::new(
        scheduler_config(&config),
        store,
        publisher.clone(),
        None,
    ));

    if config.leader.enabled {
        spawn_leader_gate(&config, scheduler.clone()).await?;
    } else {
        scheduler.start();
    }

    let app = Router::new()
        .route("/health/live", get(|| async { StatusCode::OK }))
        .route(
            "/health/ready",
            get({
                let publisher = publisher.clone();
                move || {
                    let publisher = publisher.clone();
                    async move { readiness(publisher).await }
                }
            }),
        );

    let address = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind {address}"))?;
    info!(address = %address, "health API listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "api server exited");
        }
    });

    signal::ctrl_c().await?;
    scheduler.stop();
    Ok(())
}

async fn readiness(publisher: Arc<dyn QueuePublisher>) -> impl IntoResponse {
    let healthy = tokio::time::timeout(Duration::from_secs(2), publisher.healthy())
        .await
        .unwrap_or(false);
    if healthy {
        (StatusCode::OK, Json(serde_json::json!({"healthy": true})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "healthy": false,
                "issues": ["queue publisher unhealthy"],
            })),
        )
    }
}

async fn build_publisher(config: &AppConfig) -> Result<Arc<dyn QueuePublisher>> {
    match config.queue.queue_type {
        QueueKind::Embedded => {
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(
                    SqliteConnectOptions::from_str(&config.queue.uri)?.create_if_missing(true),
                )
                .await
                .context("embedded queue database unavailable")?;
            let queue = Arc::new(EmbeddedQueue::new(
                pool,
                "embedded",
                Duration::from_secs(u64::from(config.queue.visibility_timeout_seconds)),
            ));
            queue.init_schema().await?;
            Ok(queue)
        }
        other => anyhow::bail!("queue type {other:?} not compiled into this binary"),
    }
}

fn scheduler_config(config: &AppConfig) -> SchedulerConfig {
    SchedulerConfig {
        enabled: config.scheduler.enabled,
        poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
        batch_size: config.scheduler.batch_size,
        max_concurrent_groups: config.scheduler.max_concurrent_groups,
        stale_queued_threshold: Duration::from_secs(
            config.scheduler.stale_queued_threshold_minutes * 60,
        ),
        stale_queued_poll_interval: Duration::from_millis(
            config.scheduler.stale_queued_poll_interval_ms,
        ),
        ..Default::default()
    }
}

/// Run the loops only while this replica holds the scheduler lock.
async fn spawn_leader_gate(config: &AppConfig, scheduler: Arc<DispatchScheduler>) -> Result<()> {
    let mut leader_config = LeaderConfig::for_role(config.leader.redis_url.clone(), "scheduler");
    leader_config.lock_ttl = Duration::from_secs(config.leader.ttl_seconds);
    leader_config.refresh_interval = Duration::from_secs(config.leader.refresh_seconds);

    let elector = Arc::new(LeaderElector::connect(leader_config).await?);
    elector.clone().start().await?;

    let mut status_rx = elector.subscribe();
    tokio::spawn(async move {
        let mut running = false;
        loop {
            let status = *status_rx.borrow_and_update();
            match status {
                LeaderStatus::Leader if !running => {
                    scheduler.start();
                    running = true;
                }
                LeaderStatus::Follower | LeaderStatus::Unknown if running => {
                    scheduler.stop();
                    running = false;
                }
                _ => {}
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    });

    Ok(())
}
