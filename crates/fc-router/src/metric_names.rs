//! Metric recording helpers.
//!
//! Counter and gauge names form the stable observability contract:
//! `messages_received`, `messages_acked`, `messages_nacked`,
//! `messages_parse_failed`, `pool_offer_rejected`,
//! `mediator_outcome_total{result}`, `circuit_breaker_state{pool,host}`,
//! `queue_depth{queue}`, plus latency histograms for the mediator and the
//! consumer poll loop.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub fn record_received(queue: &str, count: u64) {
    counter!("messages_received", "queue" => queue.to_string()).increment(count);
}

pub fn record_acked(queue: &str) {
    counter!("messages_acked", "queue" => queue.to_string()).increment(1);
}

pub fn record_nacked(queue: &str) {
    counter!("messages_nacked", "queue" => queue.to_string()).increment(1);
}

pub fn record_parse_failed(queue: &str) {
    counter!("messages_parse_failed", "queue" => queue.to_string()).increment(1);
}

pub fn record_offer_rejected(pool: &str) {
    counter!("pool_offer_rejected", "pool" => pool.to_string()).increment(1);
}

pub fn record_mediator_outcome(result: &str) {
    counter!("mediator_outcome_total", "result" => result.to_string()).increment(1);
}

pub fn record_mediator_latency(duration: Duration) {
    histogram!("mediator_latency_seconds").record(duration.as_secs_f64());
}

pub fn record_poll_latency(queue: &str, duration: Duration) {
    histogram!("consumer_poll_latency_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_circuit_breaker_state(pool: &str, host: &str, state: f64) {
    gauge!(
        "circuit_breaker_state",
        "pool" => pool.to_string(),
        "host" => host.to_string()
    )
    .set(state);
}

pub fn set_queue_depth(queue: &str, depth: i64) {
    gauge!("queue_depth", "queue" => queue.to_string()).set(depth as f64);
}
