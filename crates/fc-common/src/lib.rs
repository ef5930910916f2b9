use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Message Pointer
// ============================================================================

/// The routing envelope carried in every queue body.
///
/// One canonical definition shared by the router and the scheduler. The wire
/// format is camelCase JSON; unknown fields are ignored on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    pub pool_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub mediation_type: MediationKind,
    pub mediation_target: String,
    pub message_group_id: String,
    /// Ordering hint within a message group. Not part of the minimal wire
    /// contract; producers that care about intra-batch order set it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    /// Populated by the consumer when the pointer enters a routing batch.
    #[serde(skip)]
    pub batch_id: Option<String>,
    /// Broker-assigned message id, populated by the consumer.
    #[serde(skip)]
    pub source_message_id: Option<String>,
}

impl MessagePointer {
    /// Validate the non-empty invariants before routing.
    pub fn validate(&self) -> Result<(), PointerError> {
        if self.id.is_empty() {
            return Err(PointerError::MissingField("id"));
        }
        if self.pool_code.is_empty() {
            return Err(PointerError::MissingField("poolCode"));
        }
        if self.message_group_id.is_empty() {
            return Err(PointerError::MissingField("messageGroupId"));
        }
        if self.mediation_target.is_empty() {
            return Err(PointerError::MissingField("mediationTarget"));
        }
        Ok(())
    }

    /// Parse a queue body into a validated pointer.
    pub fn from_wire(body: &str) -> Result<Self, PointerError> {
        let pointer: MessagePointer = serde_json::from_str(body)?;
        pointer.validate()?;
        Ok(pointer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PointerError {
    #[error("malformed pointer envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("pointer field {0} is empty")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationKind {
    HTTP,
}

// ============================================================================
// Queue Envelope
// ============================================================================

/// A message to be published onto a queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

impl QueueMessage {
    /// Build the queue envelope for a pointer: `id` doubles as the
    /// deduplication id so replays inside the dedup window collapse.
    pub fn for_pointer(pointer: &MessagePointer) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: pointer.id.clone(),
            body: serde_json::to_string(pointer)?,
            message_group_id: Some(pointer.message_group_id.clone()),
            deduplication_id: Some(pointer.id.clone()),
        })
    }
}

/// A message leased from a queue. The receipt handle grants the right to
/// ack, nack, or extend and is rotated by the queue on every lease.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub message_group_id: Option<String>,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
    pub receive_count: u32,
}

// ============================================================================
// Delivery Outcomes
// ============================================================================

/// Final outcome of a delivery attempt sequence, as reported by a pool back
/// to the consumer that leased the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered and acknowledged downstream; queue message is acked.
    Success,
    /// Retryable failure after the attempt budget; queue message is nacked
    /// with the suggested delay.
    TransientFailure,
    /// Non-retryable failure (configuration class); queue message is acked
    /// and the originating dispatch job, if any, is failed.
    PermanentFailure,
}

/// Classification of the error behind a non-success outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryErrorKind {
    /// Network, timeout, DNS, TLS, or read failure.
    Connection,
    /// Downstream processing failure (5xx, 429, ack=false).
    Process,
    /// Downstream configuration failure (other 4xx).
    Config,
}

impl std::fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryErrorKind::Connection => write!(f, "CONNECTION"),
            DeliveryErrorKind::Process => write!(f, "PROCESS"),
            DeliveryErrorKind::Config => write!(f, "CONFIG"),
        }
    }
}

/// Everything the consumer and the scheduler need to know about how a
/// delivery went: the outcome plus the per-attempt fields recorded in
/// `dispatch_job_attempts`.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    /// Deferral hint for transient failures (ack=false / 429 / backoff).
    pub delay_seconds: Option<u32>,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<DeliveryErrorKind>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl DeliveryReport {
    pub fn success(status_code: u16, attempts: u32, duration_ms: u64) -> Self {
        Self {
            outcome: DeliveryOutcome::Success,
            delay_seconds: None,
            status_code: Some(status_code),
            response_body: None,
            error_message: None,
            error_kind: None,
            attempts,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DeliveryOutcome::Success
    }
}

/// Narrow completion seam between the consumer and whoever owns the
/// persisted job a pointer came from. The consumer calls this after the
/// queue-level ack/nack is decided; the scheduler's feedback service is the
/// production implementation.
#[async_trait::async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_delivery_complete(&self, pointer: &MessagePointer, report: &DeliveryReport);
}

/// Listener used when no dispatch-job bookkeeping applies.
pub struct NoopCompletionListener;

#[async_trait::async_trait]
impl CompletionListener for NoopCompletionListener {
    async fn on_delivery_complete(&self, _pointer: &MessagePointer, _report: &DeliveryReport) {}
}

// ============================================================================
// Pool Definitions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Active,
    Suspended,
    Archived,
}

/// Runtime definition of a dispatch pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDefinition {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: u32,
    #[serde(default = "default_pool_status")]
    pub status: PoolStatus,
}

fn default_queue_capacity() -> u32 {
    100
}

fn default_pool_status() -> PoolStatus {
    PoolStatus::Active
}

impl PoolDefinition {
    pub fn new(code: impl Into<String>, concurrency: u32) -> Self {
        Self {
            code: code.into(),
            concurrency,
            rate_limit_per_minute: None,
            queue_capacity: default_queue_capacity(),
            status: PoolStatus::Active,
        }
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Point-in-time statistics for a pool, served by the monitoring API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub status: PoolStatus,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub is_rate_limited: bool,
}

// ============================================================================
// Warnings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    /// Unknown pool code or malformed envelope.
    Routing,
    /// Delivery processing failures.
    Processing,
    /// Downstream configuration errors (4xx class).
    Configuration,
    /// Pool intake saturation.
    PoolCapacity,
    /// Broker connectivity problems.
    QueueConnectivity,
    /// Scheduler dispatch issues (expiry, publish failure).
    Dispatch,
    /// Consumer liveness problems.
    ConsumerHealth,
    /// Memory or resource pressure.
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Sink for operational warnings. The router's bounded warning store is
/// the production implementation; components that only need to emit take
/// this narrow view.
pub trait WarningSink: Send + Sync {
    fn emit(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    );
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message: message.into(),
            source: source.into(),
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}

// ============================================================================
// Health
// ============================================================================

/// Aggregate health payload served on `/health` and `/health/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct InfrastructureHealth {
    pub healthy: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl InfrastructureHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: "ok".to_string(),
            issues: Vec::new(),
        }
    }

    pub fn unhealthy(message: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            issues,
        }
    }
}

/// Per-consumer liveness view for `/health` aggregation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHealth {
    pub queue_identifier: String,
    pub healthy: bool,
    pub running: bool,
    pub millis_since_last_poll: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_round_trips_camel_case() {
        let json = r#"{"id":"m1","poolCode":"WEBHOOKS","authToken":"tok",
            "mediationType":"HTTP","mediationTarget":"https://example.com/hook",
            "messageGroupId":"g1"}"#;
        let pointer = MessagePointer::from_wire(json).unwrap();
        assert_eq!(pointer.pool_code, "WEBHOOKS");
        assert_eq!(pointer.message_group_id, "g1");
        assert!(pointer.batch_id.is_none());

        let out = serde_json::to_string(&pointer).unwrap();
        assert!(out.contains("\"poolCode\":\"WEBHOOKS\""));
        assert!(!out.contains("batch_id"));
    }

    #[test]
    fn pointer_ignores_unknown_fields() {
        let json = r#"{"id":"m1","poolCode":"P","mediationType":"HTTP",
            "mediationTarget":"https://x","messageGroupId":"g","extra":42}"#;
        assert!(MessagePointer::from_wire(json).is_ok());
    }

    #[test]
    fn pointer_rejects_empty_group() {
        let json = r#"{"id":"m1","poolCode":"P","mediationType":"HTTP",
            "mediationTarget":"https://x","messageGroupId":""}"#;
        let err = MessagePointer::from_wire(json).unwrap_err();
        assert!(matches!(err, PointerError::MissingField("messageGroupId")));
    }

    #[test]
    fn queue_envelope_uses_id_for_dedup() {
        let pointer = MessagePointer {
            id: "job-7".to_string(),
            pool_code: "P".to_string(),
            auth_token: None,
            mediation_type: MediationKind::HTTP,
            mediation_target: "https://x".to_string(),
            message_group_id: "g".to_string(),
            sequence: None,
            batch_id: None,
            source_message_id: None,
        };
        let envelope = QueueMessage::for_pointer(&pointer).unwrap();
        assert_eq!(envelope.deduplication_id.as_deref(), Some("job-7"));
        assert_eq!(envelope.message_group_id.as_deref(), Some("g"));
    }
}
