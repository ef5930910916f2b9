//! Core runtime composition.
//!
//! One record built at startup wires every component together (pools,
//! manager, mediator, breakers, consumers, warning and health services,
//! metrics recorder) and owns the background lifecycle tasks. Components
//! receive explicit references; nothing reaches for globals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::broadcast;
use tracing::{info, warn};

use fc_common::{CompletionListener, PoolDefinition};
use fc_queue::{QueueConsumer, QueuePublisher};

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::consumer::{ConsumerSettings, DispatchConsumer};
use crate::health::{HealthConfig, HealthService};
use crate::manager::QueueManager;
use crate::mediator::{HttpMediator, HttpMediatorConfig};
use crate::metric_names;
use crate::warning::{WarningStore, WarningStoreConfig};
use crate::{Result, RouterError};

/// A queue the runtime consumes from and publishes health probes against.
pub struct QueueBinding {
    pub consumer: Arc<dyn QueueConsumer>,
    pub publisher: Arc<dyn QueuePublisher>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub pools: Vec<PoolDefinition>,
    pub consumer: ConsumerSettings,
    pub mediator: HttpMediatorConfig,
    pub breaker: BreakerConfig,
    pub warnings: WarningStoreConfig,
    pub health: HealthConfig,
}

pub struct CoreRuntime {
    pub manager: Arc<QueueManager>,
    pub warnings: Arc<WarningStore>,
    pub health: Arc<HealthService>,
    pub breakers: Arc<BreakerRegistry>,
    pub consumers: Vec<Arc<DispatchConsumer>>,
    pub publishers: Vec<Arc<dyn QueuePublisher>>,
    metrics_handle: PrometheusHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl CoreRuntime {
    pub fn build(
        config: RuntimeConfig,
        bindings: Vec<QueueBinding>,
        completion: Arc<dyn CompletionListener>,
    ) -> Result<Arc<Self>> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| RouterError::Config(format!("metrics recorder: {e}")))?;

        let warnings = Arc::new(WarningStore::new(config.warnings.clone()));
        let health = Arc::new(HealthService::new(config.health.clone(), warnings.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));

        let mediator = Arc::new(HttpMediator::new(config.mediator.clone(), breakers.clone())?);
        let manager = Arc::new(QueueManager::new(mediator));

        if config.pools.is_empty() {
            return Err(RouterError::Config("no pools configured".to_string()));
        }
        for definition in &config.pools {
            manager.register_pool(definition.clone());
        }

        let mut consumers = Vec::with_capacity(bindings.len());
        let mut publishers = Vec::with_capacity(bindings.len());
        for binding in bindings {
            publishers.push(binding.publisher);
            consumers.push(DispatchConsumer::new(
                binding.consumer,
                manager.clone(),
                health.clone(),
                warnings.clone(),
                completion.clone(),
                config.consumer.clone(),
            ));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            manager,
            warnings,
            health,
            breakers,
            consumers,
            publishers,
            metrics_handle,
            shutdown_tx,
        }))
    }

    /// Start consumers and the maintenance tasks.
    pub fn start(self: &Arc<Self>) {
        for consumer in &self.consumers {
            consumer.start();
        }
        self.spawn_maintenance();
        info!(
            pools = self.manager.pool_codes().len(),
            consumers = self.consumers.len(),
            "core runtime started"
        );
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        // Draining-pool disposal.
        {
            let runtime = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(10));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => runtime.manager.cleanup_draining(),
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Warning GC.
        {
            let runtime = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(300));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let removed = runtime.warnings.gc();
                            if removed > 0 {
                                info!(removed, "expired warnings cleared");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Queue-depth gauges.
        {
            let runtime = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for publisher in &runtime.publishers {
                                match publisher.depth().await {
                                    Ok(depth) => metric_names::set_queue_depth(
                                        publisher.identifier(),
                                        depth,
                                    ),
                                    Err(e) => warn!(
                                        queue = %publisher.identifier(),
                                        error = %e,
                                        "depth probe failed"
                                    ),
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }
    }

    pub fn metrics_text(&self) -> String {
        self.metrics_handle.render()
    }

    /// Ordered shutdown: stop receive loops first, drain pool work with a
    /// bounded grace window, then dispose of everything.
    pub async fn shutdown(&self, grace: Duration) {
        info!("core runtime shutting down");
        let _ = self.shutdown_tx.send(());

        for consumer in &self.consumers {
            consumer.shutdown().await;
        }

        self.manager.drain_all();
        let deadline = Instant::now() + grace;
        while !self.manager.all_pools_drained() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        self.manager.shutdown_all();
        info!("core runtime shutdown complete");
    }
}
