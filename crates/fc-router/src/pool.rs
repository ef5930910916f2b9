//! Dispatch pool: bounded intake, per-group FIFO, fixed worker set.
//!
//! Each message group maps to a slot holding at most one in-flight job plus
//! a FIFO of waiting jobs ordered by `(sequence, arrival)`. Exactly
//! `concurrency` workers pull ready groups; a group becomes ready only when
//! its slot has waiting work and nothing in flight, so two jobs of one group
//! are never processed concurrently while distinct groups run in parallel.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use fc_common::{DeliveryReport, MessagePointer, PoolDefinition, PoolStats, PoolStatus};

use crate::mediator::Mediator;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const RATE_LIMIT_POLL: Duration = Duration::from_millis(100);

/// Token bucket: refill of `per_minute / 60` tokens per second with burst
/// capacity equal to the per-second rate rounded up.
fn build_limiter(per_minute: u32) -> Option<Arc<DirectLimiter>> {
    let per_minute = NonZeroU32::new(per_minute)?;
    let burst = NonZeroU32::new(per_minute.get().div_ceil(60)).unwrap_or(nonzero_ext::nonzero!(1u32));
    Some(Arc::new(RateLimiter::direct(
        Quota::per_minute(per_minute).allow_burst(burst),
    )))
}

/// A unit of work offered to a pool: the pointer plus the channel the
/// delivery report travels back on. The sender side is owned by the pool
/// until the job completes; dropping it signals an aborted job.
pub struct PoolJob {
    pub pointer: MessagePointer,
    pub completion: oneshot::Sender<DeliveryReport>,
}

/// Result of a non-blocking intake offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    /// Bounded intake is full; the caller should redeliver later.
    Saturated,
    /// Pool is suspended or archived and rejects new submissions.
    Closed,
    /// Pool is draining toward shutdown.
    Draining,
}

struct SlotEntry {
    sequence: i64,
    arrival: u64,
    job: PoolJob,
}

/// Slot lifecycle: absent (EMPTY) → waiting jobs queued (WAITING) →
/// one job processing (IN_FLIGHT) → back to WAITING or removed when empty.
#[derive(Default)]
struct GroupSlot {
    waiting: VecDeque<SlotEntry>,
    in_flight: bool,
}

impl GroupSlot {
    /// Insert preserving `(sequence ASC, arrival ASC)` order.
    fn insert(&mut self, entry: SlotEntry) {
        let at = self
            .waiting
            .iter()
            .position(|e| (e.sequence, e.arrival) > (entry.sequence, entry.arrival))
            .unwrap_or(self.waiting.len());
        self.waiting.insert(at, entry);
    }
}

pub struct DispatchPool {
    code: Arc<str>,
    status: RwLock<PoolStatus>,
    concurrency: AtomicU32,
    queue_capacity: AtomicU32,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    arrival_counter: AtomicU64,

    slots: Arc<DashMap<Arc<str>, GroupSlot>>,
    ready: Arc<Mutex<VecDeque<Arc<str>>>>,
    work_available: Arc<Notify>,

    /// Positive values ask that many workers to exit (concurrency decrease).
    shrink: Arc<AtomicI32>,

    rate_limiter: Arc<RwLock<Option<Arc<DirectLimiter>>>>,
    rate_limit_per_minute: RwLock<Option<u32>>,

    mediator: Arc<dyn Mediator>,
    /// Intake gate: cleared on drain, offers rejected from then on.
    accepting: AtomicBool,
    /// Worker gate: cleared on shutdown only, so drained pools still finish
    /// their queued work.
    running: Arc<AtomicBool>,
}

impl DispatchPool {
    pub fn new(definition: PoolDefinition, mediator: Arc<dyn Mediator>) -> Arc<Self> {
        let limiter = definition.rate_limit_per_minute.and_then(build_limiter);

        let pool = Arc::new(Self {
            code: Arc::from(definition.code.as_str()),
            status: RwLock::new(definition.status),
            concurrency: AtomicU32::new(definition.concurrency.max(1)),
            queue_capacity: AtomicU32::new(definition.queue_capacity.max(1)),
            queue_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
            arrival_counter: AtomicU64::new(0),
            slots: Arc::new(DashMap::new()),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            work_available: Arc::new(Notify::new()),
            shrink: Arc::new(AtomicI32::new(0)),
            rate_limiter: Arc::new(RwLock::new(limiter)),
            rate_limit_per_minute: RwLock::new(definition.rate_limit_per_minute),
            mediator,
            accepting: AtomicBool::new(true),
            running: Arc::new(AtomicBool::new(true)),
        });

        let workers = pool.concurrency.load(Ordering::SeqCst);
        for worker_id in 0..workers {
            pool.clone().spawn_worker(worker_id);
        }

        info!(
            pool_code = %pool.code,
            concurrency = workers,
            capacity = pool.queue_capacity.load(Ordering::SeqCst),
            rate_limit = ?definition.rate_limit_per_minute,
            "dispatch pool started"
        );
        pool
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: PoolStatus) {
        let previous = {
            let mut guard = self.status.write();
            std::mem::replace(&mut *guard, status)
        };
        if previous != status {
            info!(pool_code = %self.code, from = ?previous, to = ?status, "pool status changed");
        }
    }

    /// Non-blocking intake. Saturation and closed states fail fast; the
    /// consumer layer decides how long to keep retrying.
    pub fn offer(&self, job: PoolJob) -> OfferOutcome {
        if !self.accepting.load(Ordering::SeqCst) {
            return OfferOutcome::Draining;
        }
        match self.status() {
            PoolStatus::Active => {}
            PoolStatus::Suspended | PoolStatus::Archived => return OfferOutcome::Closed,
        }

        let capacity = self.queue_capacity.load(Ordering::SeqCst);
        if self.queue_size.fetch_add(1, Ordering::SeqCst) >= capacity {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            debug!(pool_code = %self.code, capacity, "intake full, rejecting offer");
            return OfferOutcome::Saturated;
        }

        let group: Arc<str> = Arc::from(job.pointer.message_group_id.as_str());
        let entry = SlotEntry {
            sequence: job.pointer.sequence.unwrap_or(0),
            arrival: self.arrival_counter.fetch_add(1, Ordering::SeqCst),
            job,
        };

        let notify_ready = {
            let mut slot = self.slots.entry(group.clone()).or_default();
            slot.insert(entry);
            !slot.in_flight
        };

        if notify_ready {
            self.ready.lock().push_back(group);
            self.work_available.notify_one();
        }
        OfferOutcome::Accepted
    }

    fn spawn_worker(self: Arc<Self>, worker_id: u32) {
        tokio::spawn(async move {
            debug!(pool_code = %self.code, worker_id, "worker started");
            loop {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                // Honor a pending concurrency decrease. The add-back covers
                // the race where two workers observe the same request.
                if self.shrink.load(Ordering::SeqCst) > 0 {
                    if self.shrink.fetch_sub(1, Ordering::SeqCst) > 0 {
                        break;
                    }
                    self.shrink.fetch_add(1, Ordering::SeqCst);
                }

                let Some(group) = self.next_ready_group().await else {
                    continue;
                };
                let Some(entry) = self.claim_head(&group) else {
                    // Spurious ready entry; drop the slot if it drained.
                    self.slots
                        .remove_if(&group, |_, slot| !slot.in_flight && slot.waiting.is_empty());
                    continue;
                };

                self.queue_size.fetch_sub(1, Ordering::SeqCst);
                self.wait_for_rate_limit().await;

                self.active_workers.fetch_add(1, Ordering::SeqCst);
                let report = self.mediator.deliver(&entry.job.pointer).await;
                self.active_workers.fetch_sub(1, Ordering::SeqCst);

                if entry.job.completion.send(report).is_err() {
                    warn!(
                        pool_code = %self.code,
                        message_id = %entry.job.pointer.id,
                        "completion receiver dropped before delivery report"
                    );
                }

                self.release_slot(&group);
            }
            debug!(pool_code = %self.code, worker_id, "worker exited");
        });
    }

    /// Pop a ready group or park until one shows up.
    async fn next_ready_group(&self) -> Option<Arc<str>> {
        if let Some(group) = self.ready.lock().pop_front() {
            return Some(group);
        }
        tokio::select! {
            _ = self.work_available.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
        self.ready.lock().pop_front()
    }

    /// Take the slot's head job and mark the group in flight. Spurious
    /// ready entries (group already claimed, or drained) return None.
    fn claim_head(&self, group: &Arc<str>) -> Option<SlotEntry> {
        let mut slot = self.slots.get_mut(group)?;
        if slot.in_flight {
            return None;
        }
        let entry = slot.waiting.pop_front()?;
        slot.in_flight = true;
        Some(entry)
    }

    /// Mark the group idle again; requeue it if work is waiting, drop the
    /// slot when it is empty.
    fn release_slot(&self, group: &Arc<str>) {
        let has_more = {
            let Some(mut slot) = self.slots.get_mut(group) else {
                return;
            };
            slot.in_flight = false;
            !slot.waiting.is_empty()
        };

        if has_more {
            self.ready.lock().push_back(group.clone());
            self.work_available.notify_one();
        } else {
            self.slots
                .remove_if(group, |_, slot| !slot.in_flight && slot.waiting.is_empty());
        }
    }

    /// Block until the governor hands out a token. Re-reads the limiter on
    /// every poll so runtime rate-limit swaps take effect mid-wait.
    async fn wait_for_rate_limit(&self) {
        loop {
            let limiter = self.rate_limiter.read().clone();
            match limiter {
                None => return,
                Some(limiter) => {
                    if limiter.check().is_ok() {
                        return;
                    }
                    tokio::time::sleep(RATE_LIMIT_POLL).await;
                }
            }
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limiter
            .read()
            .as_ref()
            .map(|l| l.check().is_err())
            .unwrap_or(false)
    }

    /// Adjust the worker set size at runtime.
    pub fn update_concurrency(self: &Arc<Self>, new_concurrency: u32) -> bool {
        if new_concurrency == 0 {
            warn!(pool_code = %self.code, "rejecting concurrency of zero");
            return false;
        }
        let old = self.concurrency.swap(new_concurrency, Ordering::SeqCst);
        if new_concurrency > old {
            for worker_id in old..new_concurrency {
                self.clone().spawn_worker(worker_id);
            }
        } else if new_concurrency < old {
            self.shrink
                .fetch_add((old - new_concurrency) as i32, Ordering::SeqCst);
            // Wake parked workers so the shrink request is observed.
            self.work_available.notify_waiters();
        }
        info!(pool_code = %self.code, old, new = new_concurrency, "pool concurrency updated");
        true
    }

    /// Swap the rate limiter in place; `None` or zero disables it.
    pub fn update_rate_limit(&self, per_minute: Option<u32>) {
        let current = *self.rate_limit_per_minute.read();
        if current == per_minute {
            return;
        }
        *self.rate_limiter.write() = per_minute.and_then(build_limiter);
        *self.rate_limit_per_minute.write() = per_minute;
        info!(pool_code = %self.code, rate_limit = ?per_minute, "pool rate limit updated");
    }

    /// Stop accepting offers; in-flight and queued work still completes.
    pub fn drain(&self) {
        info!(pool_code = %self.code, "pool draining");
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    /// Hard stop: wake every worker so the running flag is observed. Queued
    /// jobs are dropped, which reads as an abort to their completion
    /// receivers.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.work_available.notify_waiters();
        let dropped: u32 = self.queue_size.swap(0, Ordering::SeqCst);
        if dropped > 0 {
            warn!(pool_code = %self.code, dropped, "queued jobs aborted at shutdown");
        }
        self.slots.clear();
        self.ready.lock().clear();
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.code.to_string(),
            status: self.status(),
            concurrency: self.concurrency.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
            queue_size: self.queue_size.load(Ordering::SeqCst),
            queue_capacity: self.queue_capacity.load(Ordering::SeqCst),
            group_count: self.slots.len() as u32,
            rate_limit_per_minute: *self.rate_limit_per_minute.read(),
            is_rate_limited: self.is_rate_limited(),
        }
    }
}
