//! Config file loading with environment overrides.
//!
//! The file path comes from `FC_CONFIG` (default `config.toml`); a missing
//! file yields the defaults. Selected fields can be overridden through
//! `FC_*` environment variables for container deployments.

use std::path::Path;

use tracing::{debug, info};

use crate::{AppConfig, ConfigError, QueueKind};

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<AppConfig, ConfigError> {
        let path = std::env::var("FC_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<AppConfig, ConfigError> {
        let mut config = if path.exists() {
            info!(path = %path.display(), "loading configuration");
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            AppConfig::default()
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut AppConfig) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("FC_HTTP_PORT") {
            config.http.port = port
                .parse()
                .map_err(|_| ConfigError::Validation(format!("bad FC_HTTP_PORT: {port}")))?;
        }
        if let Ok(queue_type) = std::env::var("FC_QUEUE_TYPE") {
            config.queue.queue_type = match queue_type.to_uppercase().as_str() {
                "SQS" => QueueKind::Sqs,
                "ACTIVEMQ" => QueueKind::Activemq,
                "NATS" => QueueKind::Nats,
                "EMBEDDED" => QueueKind::Embedded,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "bad FC_QUEUE_TYPE: {other}"
                    )))
                }
            };
        }
        if let Ok(uri) = std::env::var("FC_QUEUE_URI") {
            config.queue.uri = uri;
        }
        if let Ok(url) = std::env::var("FC_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(url) = std::env::var("FC_REDIS_URL") {
            config.leader.redis_url = url;
        }
        Ok(())
    }
}
