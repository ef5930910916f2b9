//! Application configuration.
//!
//! TOML file with environment-variable overrides. Validation runs at
//! bootstrap; an invalid configuration aborts startup.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub queue: QueueConfig,
    #[serde(rename = "pool")]
    pub pools: Vec<PoolConfig>,
    pub mediator: MediatorConfig,
    pub breaker: BreakerConfig,
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    pub traffic: TrafficConfig,
    pub leader: LeaderConfig,
}

impl AppConfig {
    /// Bootstrap validation; failure aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;

        if self.pools.is_empty() {
            return Err(ConfigError::Validation(
                "at least one [[pool]] is required".to_string(),
            ));
        }
        for pool in &self.pools {
            pool.validate()?;
        }

        if self.breaker.ratio <= 0.0 || self.breaker.ratio > 1.0 {
            return Err(ConfigError::Validation(format!(
                "breaker.ratio must be in (0, 1], got {}",
                self.breaker.ratio
            )));
        }

        if self.traffic.strategy == TrafficStrategyKind::AwsAlb
            && self.traffic.alb.target_group_arn.is_empty()
        {
            return Err(ConfigError::Validation(
                "traffic.alb.target_group_arn is required for the aws-alb strategy".to_string(),
            ));
        }

        if self.leader.enabled && self.leader.redis_url.is_empty() {
            return Err(ConfigError::Validation(
                "leader.redis_url is required when leader election is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueKind {
    Sqs,
    Activemq,
    Nats,
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(rename = "type")]
    pub queue_type: QueueKind,
    /// Variant-specific identifier: SQS queue URL, AMQP URI, NATS URL, or
    /// a SQLite path for the embedded queue.
    pub uri: String,
    pub connections: u32,
    pub visibility_timeout_seconds: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_type: QueueKind::Embedded,
            uri: "sqlite://./data/queue.db".to_string(),
            connections: 2,
            visibility_timeout_seconds: 120,
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.is_empty() {
            return Err(ConfigError::Validation("queue.uri is required".to_string()));
        }
        if self.connections == 0 {
            return Err(ConfigError::Validation(
                "queue.connections must be at least 1".to_string(),
            ));
        }
        if self.visibility_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "queue.visibility_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_pool_capacity")]
    pub queue_capacity: u32,
}

fn default_pool_capacity() -> u32 {
    100
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.code.is_empty() {
            return Err(ConfigError::Validation("pool.code is required".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Validation(format!(
                "pool {} concurrency must be at least 1",
                self.code
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Minimum samples before the failure ratio is evaluated.
    pub min_requests: u32,
    /// Rolling window length in seconds.
    pub interval_seconds: u64,
    pub ratio: f64,
    /// Open-state duration in seconds.
    pub timeout_seconds: u64,
    /// Concurrent half-open probes.
    pub probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            interval_seconds: 60,
            ratio: 0.5,
            timeout_seconds: 30,
            probes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub max_concurrent_groups: usize,
    pub stale_queued_threshold_minutes: u64,
    pub stale_queued_poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            batch_size: 100,
            max_concurrent_groups: 16,
            stale_queued_threshold_minutes: 15,
            stale_queued_poll_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/dispatch.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrafficStrategyKind {
    Noop,
    AwsAlb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub strategy: TrafficStrategyKind,
    pub alb: AlbConfig,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            strategy: TrafficStrategyKind::Noop,
            alb: AlbConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlbConfig {
    pub target_group_arn: String,
    pub target_id: String,
    pub target_port: Option<i32>,
    pub deregistration_delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub ttl_seconds: u64,
    pub refresh_seconds: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ttl_seconds: 30,
            refresh_seconds: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> AppConfig {
        AppConfig {
            pools: vec![PoolConfig {
                code: "DEFAULT".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
                queue_capacity: 100,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn minimal_config_validates() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn rejects_missing_pools() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = minimal_config();
        config.pools[0].concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_alb_without_target_group() {
        let mut config = minimal_config();
        config.traffic.strategy = TrafficStrategyKind::AwsAlb;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
            [http]
            port = 9090

            [queue]
            type = "EMBEDDED"
            uri = "sqlite://./q.db"
            connections = 4
            visibility_timeout_seconds = 90

            [[pool]]
            code = "WEBHOOKS"
            concurrency = 8
            rate_limit_per_minute = 600
            queue_capacity = 200

            [mediator]
            max_retries = 5
            base_backoff_ms = 250
            timeout_seconds = 20

            [breaker]
            min_requests = 20
            ratio = 0.4

            [scheduler]
            poll_interval_ms = 2000
            max_concurrent_groups = 8

            [leader]
            enabled = true
            redis_url = "redis://redis:6379"
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.http.port, 9090);
        assert_eq!(config.queue.connections, 4);
        assert_eq!(config.pools[0].rate_limit_per_minute, Some(600));
        assert_eq!(config.mediator.max_retries, 5);
        assert_eq!(config.breaker.min_requests, 20);
        assert_eq!(config.scheduler.max_concurrent_groups, 8);
        assert!(config.leader.enabled);
    }
}
