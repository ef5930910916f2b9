//! Traffic strategy for standby ↔ active role transitions.
//!
//! `noop` does nothing and suits single-instance deployments. `aws-alb`
//! registers the instance with a target group on promotion and, on
//! demotion, deregisters and waits for connection draining to finish.

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TrafficError {
    #[error("traffic strategy error: {0}")]
    Strategy(String),

    #[error("drain wait timed out after {0} seconds")]
    DrainTimeout(u64),
}

/// Hook pair invoked around leadership transitions. Implementations must be
/// idempotent: promoting an already-registered target is a no-op.
#[async_trait]
pub trait TrafficStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transitioning to PRIMARY: start receiving traffic.
    async fn promote(&self) -> Result<(), TrafficError>;

    /// Transitioning to STANDBY: stop receiving traffic and wait for
    /// in-flight connections to drain.
    async fn demote(&self) -> Result<(), TrafficError>;
}

pub struct NoopTrafficStrategy;

#[async_trait]
impl TrafficStrategy for NoopTrafficStrategy {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn promote(&self) -> Result<(), TrafficError> {
        Ok(())
    }

    async fn demote(&self) -> Result<(), TrafficError> {
        Ok(())
    }
}

#[cfg(feature = "alb")]
pub use alb::AlbTrafficStrategy;

#[cfg(feature = "alb")]
mod alb {
    use std::time::Duration;

    use aws_sdk_elasticloadbalancingv2::types::{TargetDescription, TargetHealthStateEnum};
    use aws_sdk_elasticloadbalancingv2::Client;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct AlbSettings {
        pub target_group_arn: String,
        /// Instance id or IP, depending on the target group's target type.
        pub target_id: String,
        pub target_port: Option<i32>,
        /// Upper bound on the drain wait during demotion.
        pub deregistration_delay: Duration,
        pub poll_interval: Duration,
    }

    pub struct AlbTrafficStrategy {
        client: Client,
        settings: AlbSettings,
    }

    impl AlbTrafficStrategy {
        pub fn new(client: Client, settings: AlbSettings) -> Self {
            Self { client, settings }
        }

        fn target(&self) -> Result<TargetDescription, TrafficError> {
            let mut builder = TargetDescription::builder().id(&self.settings.target_id);
            if let Some(port) = self.settings.target_port {
                builder = builder.port(port);
            }
            builder
                .build()
                .map_err(|e| TrafficError::Strategy(e.to_string()))
        }

        async fn target_state(&self) -> Result<Option<TargetHealthStateEnum>, TrafficError> {
            let description = self
                .client
                .describe_target_health()
                .target_group_arn(&self.settings.target_group_arn)
                .targets(self.target()?)
                .send()
                .await
                .map_err(|e| TrafficError::Strategy(e.to_string()))?;

            Ok(description
                .target_health_descriptions()
                .first()
                .and_then(|d| d.target_health())
                .and_then(|h| h.state())
                .cloned())
        }
    }

    #[async_trait]
    impl TrafficStrategy for AlbTrafficStrategy {
        fn name(&self) -> &'static str {
            "aws-alb"
        }

        async fn promote(&self) -> Result<(), TrafficError> {
            info!(
                target_group = %self.settings.target_group_arn,
                target = %self.settings.target_id,
                "registering with target group"
            );
            self.client
                .register_targets()
                .target_group_arn(&self.settings.target_group_arn)
                .targets(self.target()?)
                .send()
                .await
                .map_err(|e| TrafficError::Strategy(e.to_string()))?;
            Ok(())
        }

        async fn demote(&self) -> Result<(), TrafficError> {
            info!(
                target_group = %self.settings.target_group_arn,
                target = %self.settings.target_id,
                "deregistering from target group"
            );
            self.client
                .deregister_targets()
                .target_group_arn(&self.settings.target_group_arn)
                .targets(self.target()?)
                .send()
                .await
                .map_err(|e| TrafficError::Strategy(e.to_string()))?;

            // Poll until the target reports `unused`, bounded by the
            // configured deregistration delay.
            let deadline = tokio::time::Instant::now() + self.settings.deregistration_delay;
            loop {
                match self.target_state().await? {
                    None | Some(TargetHealthStateEnum::Unused) => return Ok(()),
                    Some(state) => {
                        tracing::debug!(state = ?state, "waiting for target drain");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(TrafficError::DrainTimeout(
                        self.settings.deregistration_delay.as_secs(),
                    ));
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
    }
}
