//! HTTP mediator behavior against a live mock server.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fc_common::{DeliveryErrorKind, DeliveryOutcome, MediationKind, MessagePointer};
use fc_router::breaker::{BreakerConfig, BreakerRegistry};
use fc_router::{HttpMediator, HttpMediatorConfig, Mediator};

fn pointer(target: String) -> MessagePointer {
    MessagePointer {
        id: "m1".to_string(),
        pool_code: "TEST".to_string(),
        auth_token: Some("secret-token".to_string()),
        mediation_type: MediationKind::HTTP,
        mediation_target: target,
        message_group_id: "g1".to_string(),
        sequence: None,
        batch_id: None,
        source_message_id: None,
    }
}

fn mediator(max_retries: u32) -> HttpMediator {
    mediator_with_breaker(max_retries, BreakerConfig::default())
}

fn mediator_with_breaker(max_retries: u32, breaker: BreakerConfig) -> HttpMediator {
    HttpMediator::new(
        HttpMediatorConfig {
            timeout: Duration::from_secs(2),
            max_retries,
            base_backoff: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
        },
        Arc::new(BreakerRegistry::new(breaker)),
    )
    .unwrap()
}

#[tokio::test]
async fn success_with_ack_true() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("Authorization", "Bearer secret-token"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ack":true}"#))
        .expect(1)
        .mount(&server)
        .await;

    let report = mediator(3)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::Success);
    assert_eq!(report.status_code, Some(200));
    assert_eq!(report.attempts, 1);
}

#[tokio::test]
async fn success_with_empty_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let report = mediator(3)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;
    assert_eq!(report.outcome, DeliveryOutcome::Success);
}

#[tokio::test]
async fn server_errors_then_not_found_ends_permanent() {
    // Three 500s consume the retry budget's retries, the fourth attempt
    // hits a 404 and the outcome is permanent.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let report = mediator(3)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::PermanentFailure);
    assert_eq!(report.status_code, Some(404));
    assert_eq!(report.error_kind, Some(DeliveryErrorKind::Config));
    assert_eq!(report.attempts, 4);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn ack_false_surfaces_requested_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"ack":false,"delaySeconds":7}"#),
        )
        .mount(&server)
        .await;

    let report = mediator(0)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::TransientFailure);
    assert_eq!(report.delay_seconds, Some(7));
    assert_eq!(report.error_kind, Some(DeliveryErrorKind::Process));
    assert_eq!(report.attempts, 1);
}

#[tokio::test]
async fn rate_limited_respects_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "42"))
        .mount(&server)
        .await;

    let report = mediator(0)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::TransientFailure);
    assert_eq!(report.delay_seconds, Some(42));
}

#[tokio::test]
async fn request_timeout_status_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(408))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let report = mediator(2)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::Success);
    assert_eq!(report.attempts, 2);
}

#[tokio::test]
async fn bad_request_is_permanent_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
        .expect(1)
        .mount(&server)
        .await;

    let report = mediator(5)
        .deliver(&pointer(format!("{}/hook", server.uri())))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::PermanentFailure);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.response_body.as_deref(), Some("bad payload"));
}

#[tokio::test]
async fn connection_refused_is_transient() {
    // Nothing listens on this port.
    let report = mediator(1)
        .deliver(&pointer("http://127.0.0.1:1/hook".to_string()))
        .await;

    assert_eq!(report.outcome, DeliveryOutcome::TransientFailure);
    assert_eq!(report.error_kind, Some(DeliveryErrorKind::Connection));
    assert_eq!(report.attempts, 2);
}

#[tokio::test]
async fn open_breaker_short_circuits_without_network_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let breaker = BreakerConfig {
        min_requests: 2,
        window: Duration::from_secs(60),
        failure_ratio: 0.5,
        open_timeout: Duration::from_secs(60),
        half_open_probes: 1,
    };
    let mediator = mediator_with_breaker(0, breaker);
    let target = pointer(format!("{}/hook", server.uri()));

    // Two failing deliveries trip the breaker.
    mediator.deliver(&target).await;
    mediator.deliver(&target).await;
    let calls_before = server.received_requests().await.unwrap().len();
    assert_eq!(calls_before, 2);

    // Short-circuited: no further outbound requests.
    let report = mediator.deliver(&target).await;
    assert_eq!(report.outcome, DeliveryOutcome::TransientFailure);
    assert_eq!(report.attempts, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn post_body_is_the_pointer_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let target = pointer(format!("{}/hook", server.uri()));
    mediator(0).deliver(&target).await;

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["id"], "m1");
    assert_eq!(body["poolCode"], "TEST");
    assert_eq!(body["messageGroupId"], "g1");
}
