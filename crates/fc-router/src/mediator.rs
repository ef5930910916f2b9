//! HTTP delivery mediator.
//!
//! POSTs the pointer payload to its mediation target, classifies the
//! response, retries retryable outcomes with full-jitter exponential
//! backoff, and consults the per-(pool, host) circuit breaker before every
//! outbound attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use fc_common::{DeliveryErrorKind, DeliveryOutcome, DeliveryReport, MessagePointer};

use crate::breaker::BreakerRegistry;
use crate::metric_names;

const BACKOFF_CAP: Duration = Duration::from_secs(30);
const DEFAULT_ACK_FALSE_DELAY: u32 = 5;
const DEFAULT_RATE_LIMIT_DELAY: u32 = 30;

/// Delivery seam between pools and the outside world. Mocked in tests.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn deliver(&self, pointer: &MessagePointer) -> DeliveryReport;
}

/// Response envelope a webhook target may return on 2xx or 429.
#[derive(Debug, Deserialize)]
struct WebhookResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(rename = "delaySeconds")]
    delay_seconds: Option<u32>,
}

fn default_ack() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-attempt classification, before the retry loop folds it into a final
/// [`DeliveryReport`].
#[derive(Debug)]
enum Attempt {
    Success {
        status: u16,
        body: Option<String>,
    },
    Retryable {
        kind: DeliveryErrorKind,
        delay: Option<u32>,
        status: Option<u16>,
        body: Option<String>,
        message: String,
    },
    Fatal {
        status: u16,
        body: Option<String>,
        message: String,
    },
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: Arc<BreakerRegistry>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig, breakers: Arc<BreakerRegistry>) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| crate::RouterError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            config,
            breakers,
        })
    }

    fn host_of(target: &str) -> String {
        reqwest::Url::parse(target)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "invalid".to_string())
    }

    /// Full-jitter exponential backoff for retry `n` (1-based), capped.
    fn backoff_for(&self, retry: u32) -> Duration {
        let exp = self
            .config
            .base_backoff
            .saturating_mul(1u32 << (retry - 1).min(16));
        let cap = exp.min(BACKOFF_CAP);
        rand::rng().random_range(Duration::ZERO..=cap)
    }

    async fn attempt(&self, pointer: &MessagePointer) -> Attempt {
        let mut request = self
            .client
            .post(&pointer.mediation_target)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");

        if let Some(ref token) = pointer.auth_token {
            request = request.bearer_auth(token);
        }

        let body = match serde_json::to_string(pointer) {
            Ok(body) => body,
            Err(e) => {
                return Attempt::Fatal {
                    status: 0,
                    body: None,
                    message: format!("payload serialization failed: {e}"),
                }
            }
        };

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    "request timeout".to_string()
                } else if e.is_connect() {
                    format!("connection error: {e}")
                } else {
                    format!("request failed: {e}")
                };
                return Attempt::Retryable {
                    kind: DeliveryErrorKind::Connection,
                    delay: None,
                    status: None,
                    body: None,
                    message,
                };
            }
        };

        let status = response.status();
        let status_code = status.as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok());
        let text = response.text().await.ok().filter(|t| !t.is_empty());

        if status.is_success() {
            // Empty bodies and bodies without `ack` both count as acked.
            let envelope = text
                .as_deref()
                .and_then(|t| serde_json::from_str::<WebhookResponse>(t).ok());
            if let Some(envelope) = envelope {
                if !envelope.ack {
                    let delay = envelope.delay_seconds.unwrap_or(DEFAULT_ACK_FALSE_DELAY);
                    return Attempt::Retryable {
                        kind: DeliveryErrorKind::Process,
                        delay: Some(delay),
                        status: Some(status_code),
                        body: text,
                        message: "target returned ack=false".to_string(),
                    };
                }
            }
            return Attempt::Success {
                status: status_code,
                body: text,
            };
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let delay = text
                .as_deref()
                .and_then(|t| serde_json::from_str::<WebhookResponse>(t).ok())
                .and_then(|e| e.delay_seconds)
                .or(retry_after)
                .unwrap_or(DEFAULT_RATE_LIMIT_DELAY);
            return Attempt::Retryable {
                kind: DeliveryErrorKind::Process,
                delay: Some(delay),
                status: Some(status_code),
                body: text,
                message: "HTTP 429: rate limited".to_string(),
            };
        }

        // 408 and 425 are the retryable members of the 4xx family.
        if status == StatusCode::REQUEST_TIMEOUT || status_code == 425 {
            return Attempt::Retryable {
                kind: DeliveryErrorKind::Process,
                delay: None,
                status: Some(status_code),
                body: text,
                message: format!("HTTP {status_code}: retryable client error"),
            };
        }

        if status.is_client_error() {
            return Attempt::Fatal {
                status: status_code,
                body: text,
                message: format!("HTTP {status_code}: configuration error"),
            };
        }

        Attempt::Retryable {
            kind: DeliveryErrorKind::Process,
            delay: None,
            status: Some(status_code),
            body: text,
            message: format!("HTTP {status_code}: server error"),
        }
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn deliver(&self, pointer: &MessagePointer) -> DeliveryReport {
        let host = Self::host_of(&pointer.mediation_target);
        let breaker = self.breakers.breaker(&pointer.pool_code, &host);
        let started = Instant::now();

        let mut attempts = 0u32;
        let mut last_retryable: Option<(DeliveryErrorKind, Option<u32>, Option<u16>, Option<String>, String)> =
            None;

        while attempts <= self.config.max_retries {
            if !breaker.allow_request() {
                debug!(
                    message_id = %pointer.id,
                    pool = %pointer.pool_code,
                    host = %host,
                    "circuit open, short-circuiting delivery"
                );
                metric_names::record_mediator_outcome("breaker_open");
                let report = DeliveryReport {
                    outcome: DeliveryOutcome::TransientFailure,
                    delay_seconds: last_retryable
                        .as_ref()
                        .and_then(|(_, delay, _, _, _)| *delay)
                        .or(Some(DEFAULT_ACK_FALSE_DELAY)),
                    status_code: None,
                    response_body: None,
                    error_message: Some("circuit breaker open".to_string()),
                    error_kind: Some(DeliveryErrorKind::Connection),
                    attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                return report;
            }

            attempts += 1;
            match self.attempt(pointer).await {
                Attempt::Success { status, body } => {
                    breaker.record_success();
                    metric_names::record_mediator_outcome("success");
                    metric_names::record_mediator_latency(started.elapsed());
                    debug!(message_id = %pointer.id, status, attempts, "delivery succeeded");
                    let mut report =
                        DeliveryReport::success(status, attempts, started.elapsed().as_millis() as u64);
                    report.response_body = body;
                    return report;
                }
                Attempt::Fatal {
                    status,
                    body,
                    message,
                } => {
                    breaker.record_success();
                    metric_names::record_mediator_outcome("permanent_failure");
                    metric_names::record_mediator_latency(started.elapsed());
                    warn!(message_id = %pointer.id, status, %message, "delivery failed permanently");
                    return DeliveryReport {
                        outcome: DeliveryOutcome::PermanentFailure,
                        delay_seconds: None,
                        status_code: (status != 0).then_some(status),
                        response_body: body,
                        error_message: Some(message),
                        error_kind: Some(DeliveryErrorKind::Config),
                        attempts,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Attempt::Retryable {
                    kind,
                    delay,
                    status,
                    body,
                    message,
                } => {
                    breaker.record_failure();
                    warn!(
                        message_id = %pointer.id,
                        attempt = attempts,
                        status = ?status,
                        %message,
                        "delivery attempt failed"
                    );
                    last_retryable = Some((kind, delay, status, body, message));

                    if attempts <= self.config.max_retries {
                        let pause = self.backoff_for(attempts);
                        debug!(
                            message_id = %pointer.id,
                            backoff_ms = pause.as_millis() as u64,
                            "backing off before retry"
                        );
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }

        // Retry budget exhausted. Surface the last suggested delay, or the
        // next backoff step as the redelivery pause.
        let (kind, delay, status, body, message) = last_retryable
            .expect("retry loop exits with at least one recorded attempt");
        let fallback = self.backoff_for(self.config.max_retries + 1).as_secs() as u32;
        metric_names::record_mediator_outcome("transient_failure");
        metric_names::record_mediator_latency(started.elapsed());

        DeliveryReport {
            outcome: DeliveryOutcome::TransientFailure,
            delay_seconds: Some(delay.unwrap_or(fallback.max(1))),
            status_code: status,
            response_body: body,
            error_message: Some(message),
            error_kind: Some(kind),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
