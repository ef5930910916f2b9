//! QueueManager: pool registry and pointer router.
//!
//! Read-mostly registry of `poolCode → DispatchPool`. Registration is
//! idempotent; replacing or deregistering drains the prior instance before
//! it disappears. The manager also tracks in-flight pointers for duplicate
//! suppression and the monitoring snapshot; receipt handles stay with the
//! consumer that leased them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use fc_common::{MessagePointer, PoolDefinition, PoolStats, PoolStatus};

use crate::mediator::Mediator;
use crate::pool::{DispatchPool, OfferOutcome, PoolJob};

/// Result of routing one pointer toward its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Accepted,
    /// No pool registered under the pointer's pool code.
    UnknownPool,
    /// Pool intake is full.
    Saturated,
    /// Pool exists but is suspended/archived/draining.
    Rejected,
    /// Pointer id is already in flight on this replica.
    DuplicateInFlight,
}

struct InFlightEntry {
    pool_code: String,
    message_group_id: String,
    queue_identifier: String,
    started_at: Instant,
}

pub struct QueueManager {
    pools: DashMap<String, Arc<DispatchPool>>,
    /// Keyed by `code#generation` so repeated replacement of one code never
    /// collides; a collision would orphan the evicted instance's workers.
    draining: DashMap<String, Arc<DispatchPool>>,
    draining_generation: AtomicU64,
    in_flight: DashMap<String, InFlightEntry>,
    mediator: Arc<dyn Mediator>,
}

impl QueueManager {
    pub fn new(mediator: Arc<dyn Mediator>) -> Self {
        Self {
            pools: DashMap::new(),
            draining: DashMap::new(),
            draining_generation: AtomicU64::new(0),
            in_flight: DashMap::new(),
            mediator,
        }
    }

    fn park_draining(&self, code: &str, pool: Arc<DispatchPool>) {
        let generation = self.draining_generation.fetch_add(1, Ordering::SeqCst);
        self.draining.insert(format!("{code}#{generation}"), pool);
    }

    /// Register (or replace) a pool. Replacement parks the prior instance
    /// in the draining set so its in-flight work finishes.
    pub fn register_pool(&self, definition: PoolDefinition) {
        let code = definition.code.clone();
        let pool = DispatchPool::new(definition, self.mediator.clone());

        if let Some(previous) = self.pools.insert(code.clone(), pool) {
            info!(pool_code = %code, "replacing pool, draining previous instance");
            previous.drain();
            self.park_draining(&code, previous);
        } else {
            info!(pool_code = %code, "pool registered");
        }
    }

    /// Deregister a pool; idempotent. The instance drains before disposal.
    pub fn deregister_pool(&self, code: &str) {
        if let Some((_, pool)) = self.pools.remove(code) {
            info!(
                pool_code = %code,
                queue_size = pool.queue_size(),
                active_workers = pool.active_workers(),
                "pool deregistered, draining"
            );
            pool.drain();
            self.park_draining(code, pool);
        } else {
            debug!(pool_code = %code, "deregister for unknown pool, ignoring");
        }
    }

    pub fn pool(&self, code: &str) -> Option<Arc<DispatchPool>> {
        self.pools.get(code).map(|entry| entry.value().clone())
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn has_active_pool(&self) -> bool {
        self.pools
            .iter()
            .any(|e| e.value().status() == PoolStatus::Active)
    }

    /// Route a pointer into its pool, tracking it as in flight on success.
    pub fn route(&self, pointer: MessagePointer, job: impl FnOnce(MessagePointer) -> PoolJob) -> RouteOutcome {
        if self.in_flight.contains_key(&pointer.id) {
            debug!(message_id = %pointer.id, "pointer already in flight, suppressing");
            return RouteOutcome::DuplicateInFlight;
        }

        let Some(pool) = self.pool(&pointer.pool_code) else {
            warn!(
                message_id = %pointer.id,
                pool_code = %pointer.pool_code,
                "no pool registered for pointer"
            );
            return RouteOutcome::UnknownPool;
        };

        let entry = InFlightEntry {
            pool_code: pointer.pool_code.clone(),
            message_group_id: pointer.message_group_id.clone(),
            queue_identifier: pointer
                .source_message_id
                .clone()
                .unwrap_or_default(),
            started_at: Instant::now(),
        };
        let id = pointer.id.clone();
        // Insert before the offer so a racing redelivery of the same id is
        // suppressed; rolled back when the offer is not accepted.
        self.in_flight.insert(id.clone(), entry);

        match pool.offer(job(pointer)) {
            OfferOutcome::Accepted => RouteOutcome::Accepted,
            OfferOutcome::Saturated => {
                self.in_flight.remove(&id);
                RouteOutcome::Saturated
            }
            OfferOutcome::Closed | OfferOutcome::Draining => {
                self.in_flight.remove(&id);
                RouteOutcome::Rejected
            }
        }
    }

    /// Forget an in-flight pointer once the consumer settled its lease.
    pub fn complete(&self, pointer_id: &str) {
        self.in_flight.remove(pointer_id);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Bounded in-flight snapshot, oldest first, optionally filtered by a
    /// pointer-id substring.
    pub fn in_flight_snapshot(&self, limit: usize, id_filter: Option<&str>) -> Vec<InFlightInfo> {
        let mut entries: Vec<InFlightInfo> = self
            .in_flight
            .iter()
            .filter(|entry| id_filter.is_none_or(|f| entry.key().contains(f)))
            .map(|entry| {
                let value = entry.value();
                InFlightInfo {
                    message_id: entry.key().clone(),
                    pool_code: value.pool_code.clone(),
                    message_group_id: value.message_group_id.clone(),
                    queue_identifier: value.queue_identifier.clone(),
                    elapsed_ms: value.started_at.elapsed().as_millis() as u64,
                }
            })
            .collect();

        entries.sort_by(|a, b| b.elapsed_ms.cmp(&a.elapsed_ms));
        entries.truncate(limit);
        entries
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().stats()).collect()
    }

    /// Dispose of drained pools. Called periodically by the lifecycle task.
    pub fn cleanup_draining(&self) {
        let finished: Vec<String> = self
            .draining
            .iter()
            .filter(|e| e.value().is_fully_drained())
            .map(|e| e.key().clone())
            .collect();

        for key in finished {
            if let Some((_, pool)) = self.draining.remove(&key) {
                info!(pool_code = %pool.code(), "drained pool disposed");
                pool.shutdown();
            }
        }
    }

    pub fn all_pools_drained(&self) -> bool {
        self.pools.iter().all(|e| e.value().is_fully_drained())
    }

    /// Drain every pool toward shutdown.
    pub fn drain_all(&self) {
        for entry in self.pools.iter() {
            entry.value().drain();
        }
    }

    pub fn shutdown_all(&self) {
        for entry in self.pools.iter() {
            entry.value().shutdown();
        }
        for entry in self.draining.iter() {
            entry.value().shutdown();
        }
        let abandoned = self.in_flight.len();
        if abandoned > 0 {
            warn!(abandoned, "in-flight pointers abandoned at shutdown; leases will expire");
            self.in_flight.clear();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightInfo {
    pub message_id: String,
    pub pool_code: String,
    pub message_group_id: String,
    pub queue_identifier: String,
    pub elapsed_ms: u64,
}
