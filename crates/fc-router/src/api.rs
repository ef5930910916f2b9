//! Monitoring HTTP surface.
//!
//! Health endpoints follow the platform contract: `/health/live` answers
//! 200 while the process runs, `/health/ready` gates on broker
//! reachability and pool availability, `/health` adds degradation detail,
//! `/metrics` renders Prometheus text. The JSON endpoints expose pool
//! stats, the in-flight snapshot, warnings and breaker states.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::runtime::CoreRuntime;

pub fn router(runtime: Arc<CoreRuntime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/pools", get(pools))
        .route("/inflight", get(in_flight))
        .route("/warnings", get(warnings))
        .route("/warnings/{id}/acknowledge", post(acknowledge_warning))
        .route("/breakers", get(breakers))
        .with_state(runtime)
}

async fn health(State(runtime): State<Arc<CoreRuntime>>) -> impl IntoResponse {
    let report = runtime
        .health
        .report(&runtime.manager, &runtime.publishers)
        .await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn live() -> impl IntoResponse {
    StatusCode::OK
}

async fn ready(State(runtime): State<Arc<CoreRuntime>>) -> impl IntoResponse {
    let readiness = runtime
        .health
        .readiness(&runtime.manager, &runtime.publishers)
        .await;
    let status = if readiness.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

async fn metrics(State(runtime): State<Arc<CoreRuntime>>) -> impl IntoResponse {
    runtime.metrics_text()
}

async fn pools(State(runtime): State<Arc<CoreRuntime>>) -> impl IntoResponse {
    Json(runtime.manager.pool_stats())
}

#[derive(Debug, Deserialize)]
struct InFlightQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    filter: Option<String>,
}

fn default_limit() -> usize {
    100
}

async fn in_flight(
    State(runtime): State<Arc<CoreRuntime>>,
    Query(query): Query<InFlightQuery>,
) -> impl IntoResponse {
    Json(
        runtime
            .manager
            .in_flight_snapshot(query.limit, query.filter.as_deref()),
    )
}

#[derive(Debug, Deserialize)]
struct WarningsQuery {
    unacknowledged: Option<bool>,
}

async fn warnings(
    State(runtime): State<Arc<CoreRuntime>>,
    Query(query): Query<WarningsQuery>,
) -> impl IntoResponse {
    let list = if query.unacknowledged.unwrap_or(false) {
        runtime.warnings.unacknowledged()
    } else {
        runtime.warnings.all()
    };
    Json(list)
}

async fn acknowledge_warning(
    State(runtime): State<Arc<CoreRuntime>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if runtime.warnings.acknowledge(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn breakers(State(runtime): State<Arc<CoreRuntime>>) -> impl IntoResponse {
    Json(runtime.breakers.all_stats())
}
