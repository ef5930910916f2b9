//! Message router server.
//!
//! Drains the configured queue, routes pointers through dispatch pools,
//! delivers over HTTP, and records dispatch-job completions. Serves the
//! monitoring API on the configured HTTP port.

use std::sync::Arc;
use std::time::Duration;

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use fc_config::{AppConfig, ConfigLoader, QueueKind};
use fc_queue::embedded::EmbeddedQueue;
use fc_router::{
    api, BreakerConfig, ConsumerSettings, CoreRuntime, HttpMediatorConfig, QueueBinding,
    RuntimeConfig,
};
use fc_scheduler::{JobStore, SchedulerFeedback};
use fc_standby::{LeaderConfig, LeaderElector, LeaderStatus};

#[tokio::main]
async fn main() -> Result<()> {
    fc_common::logging::init_logging();
    let config = ConfigLoader::load().context("configuration rejected")?;

    info!(
        queue_type = ?config.queue.queue_type,
        pools = config.pools.len(),
        "starting message router"
    );

    let binding = build_queue_binding(&config).await?;

    // Completion feedback shares the scheduler's job store so terminal
    // outcomes settle DispatchJob rows and attempt history.
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            SqliteConnectOptions::from_str(&config.database.url)?.create_if_missing(true),
        )
        .await
        .context("dispatch job database unavailable")?;
    let store = Arc::new(JobStore::new(db));
    store.init_schema().await?;
    let completion = Arc::new(SchedulerFeedback::new(store));

    let runtime = CoreRuntime::build(runtime_config(&config), vec![binding], completion)?;
    runtime.start();

    if config.leader.enabled {
        spawn_leader_watch(&config, runtime.clone()).await?;
    }

    let app = api::router(runtime.clone());
    let address = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind {address}"))?;
    info!(address = %address, "monitoring API listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "api server exited");
        }
    });

    signal::ctrl_c().await?;
    runtime.shutdown(Duration::from_secs(30)).await;
    Ok(())
}

async fn build_queue_binding(config: &AppConfig) -> Result<QueueBinding> {
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
            Ok(QueueBinding {
                consumer: queue.clone(),
                publisher: queue,
            })
        }
        #[cfg(feature = "sqs")]
        QueueKind::Sqs => {
            let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let queue = Arc::new(fc_queue::sqs::SqsFifoQueue::new(
                aws_sdk_sqs::Client::new(&aws),
                config.queue.uri.clone(),
                Duration::from_secs(u64::from(config.queue.visibility_timeout_seconds)),
            ));
            Ok(QueueBinding {
                consumer: queue.clone(),
                publisher: queue,
            })
        }
        #[cfg(feature = "activemq")]
        QueueKind::Activemq => {
            let queue = Arc::new(
                fc_queue::activemq::ActiveMqQueue::connect(fc_queue::activemq::ActiveMqSettings {
                    uri: config.queue.uri.clone(),
                    ..Default::default()
                })
                .await?,
            );
            Ok(QueueBinding {
                consumer: queue.clone(),
                publisher: queue,
            })
        }
        #[cfg(feature = "nats")]
        QueueKind::Nats => {
            let queue = Arc::new(
                fc_queue::nats::JetStreamQueue::connect(fc_queue::nats::JetStreamSettings {
                    url: config.queue.uri.clone(),
                    ack_wait: Duration::from_secs(u64::from(
                        config.queue.visibility_timeout_seconds,
                    )),
                    ..Default::default()
                })
                .await?,
            );
            Ok(QueueBinding {
                consumer: queue.clone(),
                publisher: queue,
            })
        }
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("queue type {other:?} not compiled into this binary"),
    }
}

fn runtime_config(config: &AppConfig) -> RuntimeConfig {
    RuntimeConfig {
        pools: config
            .pools
            .iter()
            .map(|p| {
                let mut definition =
                    fc_common::PoolDefinition::new(&p.code, p.concurrency).with_capacity(p.queue_capacity);
                definition.rate_limit_per_minute = p.rate_limit_per_minute;
                definition
            })
            .collect(),
        consumer: ConsumerSettings {
            connections: config.queue.connections,
            visibility_timeout: Duration::from_secs(u64::from(
                config.queue.visibility_timeout_seconds,
            )),
            ..Default::default()
        },
        mediator: HttpMediatorConfig {
            timeout: Duration::from_secs(config.mediator.timeout_seconds),
            max_retries: config.mediator.max_retries,
            base_backoff: Duration::from_millis(config.mediator.base_backoff_ms),
            ..Default::default()
        },
        breaker: BreakerConfig {
            min_requests: config.breaker.min_requests,
            window: Duration::from_secs(config.breaker.interval_seconds),
            failure_ratio: config.breaker.ratio,
            open_timeout: Duration::from_secs(config.breaker.timeout_seconds),
            half_open_probes: config.breaker.probes,
        },
        ..Default::default()
    }
}

/// Leader election for the consumer role: losing the lock pauses intake on
/// every consumer, reacquiring resumes it.
async fn spawn_leader_watch(config: &AppConfig, runtime: Arc<CoreRuntime>) -> Result<()> {
    let mut leader_config = LeaderConfig::for_role(config.leader.redis_url.clone(), "consumer");
    leader_config.lock_ttl = Duration::from_secs(config.leader.ttl_seconds);
    leader_config.refresh_interval = Duration::from_secs(config.leader.refresh_seconds);

    let elector = Arc::new(LeaderElector::connect(leader_config).await?);
    elector.clone().start().await?;

    // Hold intake until leadership is settled.
    for consumer in &runtime.consumers {
        consumer.pause_intake();
    }

    let mut status_rx = elector.subscribe();
    tokio::spawn(async move {
        loop {
            let status = *status_rx.borrow_and_update();
            for consumer in &runtime.consumers {
                match status {
                    LeaderStatus::Leader => consumer.resume_intake(),
                    LeaderStatus::Follower | LeaderStatus::Unknown => consumer.pause_intake(),
                }
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }
    });

    Ok(())
}
