//! Pool registry and routing behavior.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use fc_common::{DeliveryReport, MediationKind, MessagePointer, PoolDefinition};
use fc_router::manager::{QueueManager, RouteOutcome};
use fc_router::pool::PoolJob;
use fc_router::Mediator;

struct AlwaysOkMediator;

#[async_trait]
impl Mediator for AlwaysOkMediator {
    async fn deliver(&self, _pointer: &MessagePointer) -> DeliveryReport {
        DeliveryReport::success(200, 1, 0)
    }
}

fn pointer(id: &str, pool: &str) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: pool.to_string(),
        auth_token: None,
        mediation_type: MediationKind::HTTP,
        mediation_target: "http://localhost:9/hook".to_string(),
        message_group_id: "g".to_string(),
        sequence: None,
        batch_id: None,
        source_message_id: None,
    }
}

fn route(manager: &QueueManager, p: MessagePointer) -> (RouteOutcome, oneshot::Receiver<DeliveryReport>) {
    let (tx, rx) = oneshot::channel();
    let outcome = manager.route(p, |pointer| PoolJob {
        pointer,
        completion: tx,
    });
    (outcome, rx)
}

#[tokio::test]
async fn routes_to_registered_pool() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 2));

    let (outcome, rx) = route(&manager, pointer("m1", "P"));
    assert_eq!(outcome, RouteOutcome::Accepted);
    assert!(rx.await.unwrap().is_success());
}

#[tokio::test]
async fn unknown_pool_is_a_routing_miss() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 2));

    let (outcome, _rx) = route(&manager, pointer("m1", "OTHER"));
    assert_eq!(outcome, RouteOutcome::UnknownPool);
    assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test]
async fn duplicate_pointer_is_suppressed_while_in_flight() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 2));

    let (first, rx) = route(&manager, pointer("m1", "P"));
    assert_eq!(first, RouteOutcome::Accepted);

    let (second, _rx2) = route(&manager, pointer("m1", "P"));
    assert_eq!(second, RouteOutcome::DuplicateInFlight);

    rx.await.unwrap();
    manager.complete("m1");

    // Once settled, the id may fly again.
    let (third, _rx3) = route(&manager, pointer("m1", "P"));
    assert_eq!(third, RouteOutcome::Accepted);
}

#[tokio::test]
async fn deregister_is_idempotent_and_drains() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 2));

    manager.deregister_pool("P");
    manager.deregister_pool("P");

    let (outcome, _rx) = route(&manager, pointer("m1", "P"));
    assert_eq!(outcome, RouteOutcome::UnknownPool);

    manager.cleanup_draining();
}

#[tokio::test]
async fn replacing_a_pool_keeps_the_code_routable() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 1));
    manager.register_pool(PoolDefinition::new("P", 8));

    let stats = manager.pool_stats();
    let replaced = stats.iter().find(|s| s.pool_code == "P").unwrap();
    assert_eq!(replaced.concurrency, 8);

    let (outcome, rx) = route(&manager, pointer("m1", "P"));
    assert_eq!(outcome, RouteOutcome::Accepted);
    rx.await.unwrap();
}

#[tokio::test]
async fn repeated_replacement_parks_every_prior_instance() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 1));

    // Two replacements in quick succession: both drained predecessors must
    // survive until cleanup disposes of them.
    manager.register_pool(PoolDefinition::new("P", 2));
    manager.register_pool(PoolDefinition::new("P", 4));

    let stats = manager.pool_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].concurrency, 4);

    let (outcome, rx) = route(&manager, pointer("m1", "P"));
    assert_eq!(outcome, RouteOutcome::Accepted);
    rx.await.unwrap();

    // Idle predecessors are fully drained and get disposed here.
    manager.cleanup_draining();
}

#[tokio::test]
async fn snapshot_respects_limit_and_filter() {
    let manager = QueueManager::new(Arc::new(AlwaysOkMediator));
    manager.register_pool(PoolDefinition::new("P", 1));

    // Park several ids in the in-flight set by routing into a group that
    // serializes behind the first delivery.
    let mut receivers = Vec::new();
    for i in 0..5 {
        let (outcome, rx) = route(&manager, pointer(&format!("snap-{i}"), "P"));
        assert_eq!(outcome, RouteOutcome::Accepted);
        receivers.push(rx);
    }

    let limited = manager.in_flight_snapshot(2, None);
    assert!(limited.len() <= 2);

    let filtered = manager.in_flight_snapshot(10, Some("snap-3"));
    assert!(filtered.iter().all(|e| e.message_id.contains("snap-3")));

    for rx in receivers {
        let _ = rx.await;
    }
}
