//! Liveness and readiness evaluation.
//!
//! Liveness is unconditional while the process runs. Readiness requires
//! reachable brokers (publisher probe under a short timeout) and at least
//! one active pool. The full health report folds in consumer staleness and
//! unacknowledged critical warnings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::warn;

use fc_common::{ConsumerHealth, InfrastructureHealth};
use fc_queue::QueuePublisher;

use crate::manager::QueueManager;
use crate::warning::WarningStore;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// A consumer that has not polled for this long counts as stalled.
    pub consumer_stall_threshold: Duration,
    /// Per-broker probe timeout.
    pub broker_probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            consumer_stall_threshold: Duration::from_secs(60),
            broker_probe_timeout: Duration::from_secs(2),
        }
    }
}

pub struct HealthService {
    config: HealthConfig,
    warnings: Arc<WarningStore>,
    last_poll: RwLock<HashMap<String, Instant>>,
    running: RwLock<HashMap<String, bool>>,
}

impl HealthService {
    pub fn new(config: HealthConfig, warnings: Arc<WarningStore>) -> Self {
        Self {
            config,
            warnings,
            last_poll: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_consumer_poll(&self, queue_identifier: &str) {
        self.last_poll
            .write()
            .insert(queue_identifier.to_string(), Instant::now());
    }

    pub fn set_consumer_running(&self, queue_identifier: &str, running: bool) {
        self.running
            .write()
            .insert(queue_identifier.to_string(), running);
    }

    pub fn consumer_health(&self) -> Vec<ConsumerHealth> {
        let last_poll = self.last_poll.read();
        let running = self.running.read();

        running
            .iter()
            .map(|(id, &is_running)| {
                let since_poll = last_poll.get(id).map(|t| t.elapsed());
                let healthy = is_running
                    && since_poll
                        .map(|d| d < self.config.consumer_stall_threshold)
                        .unwrap_or(false);
                ConsumerHealth {
                    queue_identifier: id.clone(),
                    healthy,
                    running: is_running,
                    millis_since_last_poll: since_poll.map(|d| d.as_millis() as i64),
                }
            })
            .collect()
    }

    pub fn stalled_consumers(&self) -> Vec<String> {
        self.consumer_health()
            .into_iter()
            .filter(|c| c.running && !c.healthy)
            .map(|c| c.queue_identifier)
            .collect()
    }

    /// Readiness gate: every broker reachable and at least one pool active.
    pub async fn readiness(
        &self,
        manager: &QueueManager,
        publishers: &[Arc<dyn QueuePublisher>],
    ) -> InfrastructureHealth {
        let mut issues = Vec::new();

        for publisher in publishers {
            let probe =
                tokio::time::timeout(self.config.broker_probe_timeout, publisher.healthy()).await;
            match probe {
                Ok(true) => {}
                Ok(false) => issues.push(format!("broker {} unhealthy", publisher.identifier())),
                Err(_) => issues.push(format!(
                    "broker {} probe timed out",
                    publisher.identifier()
                )),
            }
        }

        if !manager.has_active_pool() {
            issues.push("no active dispatch pool".to_string());
        }

        if issues.is_empty() {
            InfrastructureHealth::healthy()
        } else {
            warn!(?issues, "readiness check failed");
            InfrastructureHealth::unhealthy("not ready", issues)
        }
    }

    /// Aggregate health for `/health`: readiness plus consumer staleness
    /// and unacknowledged critical warnings.
    pub async fn report(
        &self,
        manager: &QueueManager,
        publishers: &[Arc<dyn QueuePublisher>],
    ) -> InfrastructureHealth {
        let readiness = self.readiness(manager, publishers).await;
        let mut issues = readiness.issues;

        for stalled in self.stalled_consumers() {
            issues.push(format!("consumer {stalled} is stalled"));
        }

        let critical = self.warnings.critical_count();
        if critical > 0 {
            issues.push(format!("{critical} unacknowledged critical warnings"));
        }

        if issues.is_empty() {
            InfrastructureHealth::healthy()
        } else {
            InfrastructureHealth::unhealthy("degraded", issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_staleness() {
        let service = HealthService::new(
            HealthConfig {
                consumer_stall_threshold: Duration::from_millis(10),
                broker_probe_timeout: Duration::from_secs(1),
            },
            Arc::new(WarningStore::default()),
        );

        service.set_consumer_running("q1", true);
        service.record_consumer_poll("q1");
        assert!(service.stalled_consumers().is_empty());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(service.stalled_consumers(), vec!["q1".to_string()]);
    }

    #[test]
    fn stopped_consumer_is_not_stalled() {
        let service =
            HealthService::new(HealthConfig::default(), Arc::new(WarningStore::default()));
        service.set_consumer_running("q1", false);
        assert!(service.stalled_consumers().is_empty());
    }
}
