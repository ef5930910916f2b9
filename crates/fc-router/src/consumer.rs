//! Queue consumer loop.
//!
//! One instance per configured queue. Runs `connections` parallel pollers
//! plus a visibility extender. The consumer owns every receipt handle it
//! leases: pools report delivery outcomes over a completion channel and the
//! consumer alone acks, nacks or extends against the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use fc_common::{
    CompletionListener, DeliveryOutcome, MessagePointer, PointerError, ReceivedMessage,
    WarningCategory, WarningSeverity,
};
use fc_queue::{QueueConsumer, QueueError};

use crate::health::HealthService;
use crate::manager::{QueueManager, RouteOutcome};
use crate::metric_names;
use crate::pool::PoolJob;
use crate::warning::WarningStore;

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Parallel polling tasks for this queue.
    pub connections: u32,
    pub max_batch: u32,
    pub receive_wait: Duration,
    pub visibility_timeout: Duration,
    /// Nack delay when no pool matches the pointer.
    pub routing_miss_delay_seconds: u32,
    /// Nack delay when the pool intake is full.
    pub saturation_delay_seconds: u32,
    /// Upper bound on how long an offer is retried before nacking.
    pub offer_wait: Duration,
    /// Safety margin subtracted from the visibility timeout when deciding
    /// which leases to extend.
    pub extension_jitter: Duration,
    /// Grace period for in-flight work during shutdown.
    pub drain_grace: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            connections: 2,
            max_batch: 10,
            receive_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(120),
            routing_miss_delay_seconds: 30,
            saturation_delay_seconds: 5,
            offer_wait: Duration::from_secs(1),
            extension_jitter: Duration::from_secs(10),
            drain_grace: Duration::from_secs(30),
        }
    }
}

struct Lease {
    handle: Mutex<String>,
    last_renewal: Mutex<Instant>,
}

pub struct DispatchConsumer {
    queue: Arc<dyn QueueConsumer>,
    manager: Arc<QueueManager>,
    health: Arc<HealthService>,
    warnings: Arc<WarningStore>,
    completion: Arc<dyn CompletionListener>,
    settings: ConsumerSettings,
    leases: Arc<DashMap<String, Arc<Lease>>>,
    running: Arc<AtomicBool>,
    intake_enabled: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DispatchConsumer {
    pub fn new(
        queue: Arc<dyn QueueConsumer>,
        manager: Arc<QueueManager>,
        health: Arc<HealthService>,
        warnings: Arc<WarningStore>,
        completion: Arc<dyn CompletionListener>,
        settings: ConsumerSettings,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            queue,
            manager,
            health,
            warnings,
            completion,
            settings,
            leases: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(true)),
            intake_enabled: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
        })
    }

    pub fn queue_identifier(&self) -> &str {
        self.queue.identifier()
    }

    /// Pause intake (leadership loss). In-flight work completes; leases of
    /// unstarted work expire back onto the queue naturally.
    pub fn pause_intake(&self) {
        if self.intake_enabled.swap(false, Ordering::SeqCst) {
            info!(queue = %self.queue.identifier(), "consumer intake paused");
        }
    }

    pub fn resume_intake(&self) {
        if !self.intake_enabled.swap(true, Ordering::SeqCst) {
            info!(queue = %self.queue.identifier(), "consumer intake resumed");
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.leases.len()
    }

    /// Spawn the poll tasks and the visibility extender.
    pub fn start(self: &Arc<Self>) {
        self.health
            .set_consumer_running(self.queue.identifier(), true);

        for task_index in 0..self.settings.connections.max(1) {
            let consumer = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = consumer.poll_once() => {}
                    }
                    if !consumer.running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                debug!(queue = %consumer.queue.identifier(), task_index, "poll task exited");
            });
        }

        let consumer = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let tick = consumer.settings.visibility_timeout / 4;
            let mut ticker = tokio::time::interval(tick.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => consumer.extend_aging_leases().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        info!(
            queue = %self.queue.identifier(),
            connections = self.settings.connections,
            "consumer started"
        );
    }

    async fn poll_once(&self) {
        if !self.intake_enabled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }

        let started = Instant::now();
        let batch = self
            .queue
            .receive(self.settings.max_batch, self.settings.receive_wait)
            .await;
        metric_names::record_poll_latency(self.queue.identifier(), started.elapsed());

        match batch {
            Ok(messages) => {
                self.health.record_consumer_poll(self.queue.identifier());
                if messages.is_empty() {
                    return;
                }
                metric_names::record_received(self.queue.identifier(), messages.len() as u64);

                let batch_id = uuid::Uuid::new_v4().to_string();
                for message in messages {
                    self.handle_message(message, &batch_id).await;
                }
            }
            Err(QueueError::Stopped) => {
                self.running.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!(queue = %self.queue.identifier(), error = %e, "receive failed");
                self.warnings.add(
                    WarningCategory::QueueConnectivity,
                    WarningSeverity::Error,
                    format!("receive failed on {}: {e}", self.queue.identifier()),
                    "DispatchConsumer",
                );
                // Back off with jitter so replicas do not hammer a sick broker.
                let pause = Duration::from_millis(rand::rng().random_range(1000..3000));
                tokio::time::sleep(pause).await;
            }
        }
    }

    async fn handle_message(&self, message: ReceivedMessage, batch_id: &str) {
        let mut pointer = match MessagePointer::from_wire(&message.body) {
            Ok(pointer) => pointer,
            Err(e) => {
                self.reject_unparseable(&message, &e).await;
                return;
            }
        };
        pointer.batch_id = Some(batch_id.to_string());
        pointer.source_message_id = message.broker_message_id.clone();

        // Replica-local duplicate suppression: a redelivery of an id that is
        // still being worked is acked; the original attempt will settle it.
        if self.leases.contains_key(&pointer.id) {
            debug!(message_id = %pointer.id, "duplicate in-flight arrival, acking");
            let _ = self.queue.ack(&message.receipt_handle).await;
            return;
        }

        let offer_deadline = Instant::now() + self.settings.offer_wait;
        loop {
            let (tx, rx) = oneshot::channel();
            let outcome = self
                .manager
                .route(pointer.clone(), |p| PoolJob {
                    pointer: p,
                    completion: tx,
                });

            match outcome {
                RouteOutcome::Accepted => {
                    self.track_and_await(pointer, message, rx);
                    return;
                }
                RouteOutcome::Saturated if Instant::now() < offer_deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                RouteOutcome::Saturated => {
                    metric_names::record_offer_rejected(&pointer.pool_code);
                    self.warnings.add(
                        WarningCategory::PoolCapacity,
                        WarningSeverity::Warn,
                        format!("pool {} intake full", pointer.pool_code),
                        "DispatchConsumer",
                    );
                    self.nack(&message.receipt_handle, Some(self.settings.saturation_delay_seconds))
                        .await;
                    return;
                }
                RouteOutcome::UnknownPool => {
                    self.warnings.add(
                        WarningCategory::Routing,
                        WarningSeverity::Error,
                        format!(
                            "no pool {} for message {}",
                            pointer.pool_code, pointer.id
                        ),
                        "DispatchConsumer",
                    );
                    self.nack(&message.receipt_handle, Some(self.settings.routing_miss_delay_seconds))
                        .await;
                    return;
                }
                RouteOutcome::Rejected => {
                    self.warnings.add(
                        WarningCategory::PoolCapacity,
                        WarningSeverity::Warn,
                        format!("pool {} rejects submissions", pointer.pool_code),
                        "DispatchConsumer",
                    );
                    self.nack(&message.receipt_handle, Some(self.settings.saturation_delay_seconds))
                        .await;
                    return;
                }
                RouteOutcome::DuplicateInFlight => {
                    let _ = self.queue.ack(&message.receipt_handle).await;
                    return;
                }
            }
        }
    }

    async fn reject_unparseable(&self, message: &ReceivedMessage, error: &PointerError) {
        warn!(
            queue = %self.queue.identifier(),
            message_id = %message.message_id,
            error = %error,
            "unparseable envelope, acking to drop"
        );
        metric_names::record_parse_failed(self.queue.identifier());
        self.warnings.add(
            WarningCategory::Routing,
            WarningSeverity::Error,
            format!("unparseable envelope {}: {error}", message.message_id),
            "DispatchConsumer",
        );
        let _ = self.queue.ack(&message.receipt_handle).await;
        metric_names::record_acked(self.queue.identifier());
    }

    /// Record the lease and spawn the waiter that settles it when the pool
    /// reports completion.
    fn track_and_await(
        &self,
        pointer: MessagePointer,
        message: ReceivedMessage,
        rx: oneshot::Receiver<fc_common::DeliveryReport>,
    ) {
        let lease = Arc::new(Lease {
            handle: Mutex::new(message.receipt_handle),
            last_renewal: Mutex::new(Instant::now()),
        });
        self.leases.insert(pointer.id.clone(), lease);

        let queue = self.queue.clone();
        let queue_id = self.queue.identifier().to_string();
        let leases = self.leases.clone();
        let manager = self.manager.clone();
        let warnings = self.warnings.clone();
        let completion = self.completion.clone();

        tokio::spawn(async move {
            let report = rx.await;

            let handle = leases
                .remove(&pointer.id)
                .map(|(_, lease)| lease.handle.lock().clone());
            let Some(handle) = handle else {
                manager.complete(&pointer.id);
                return;
            };

            match report {
                Ok(report) => {
                    match report.outcome {
                        DeliveryOutcome::Success => {
                            if let Err(e) = queue.ack(&handle).await {
                                warn!(message_id = %pointer.id, error = %e, "ack failed");
                            }
                            metric_names::record_acked(&queue_id);
                        }
                        DeliveryOutcome::TransientFailure => {
                            if let Err(e) = queue.nack(&handle, report.delay_seconds).await {
                                warn!(message_id = %pointer.id, error = %e, "nack failed");
                            }
                            metric_names::record_nacked(&queue_id);
                        }
                        DeliveryOutcome::PermanentFailure => {
                            // Dead-lettering is the job owner's concern; the
                            // queue message must not loop forever.
                            if let Err(e) = queue.ack(&handle).await {
                                warn!(message_id = %pointer.id, error = %e, "ack failed");
                            }
                            metric_names::record_acked(&queue_id);
                            warnings.add(
                                WarningCategory::Configuration,
                                WarningSeverity::Error,
                                format!(
                                    "permanent delivery failure for {} to {}: {}",
                                    pointer.id,
                                    pointer.mediation_target,
                                    report.error_message.as_deref().unwrap_or("unknown")
                                ),
                                "DispatchConsumer",
                            );
                        }
                    }
                    completion.on_delivery_complete(&pointer, &report).await;
                }
                Err(_) => {
                    // Pool dropped the job (shutdown or drain): make the
                    // message visible again immediately.
                    let _ = queue.nack(&handle, Some(0)).await;
                    metric_names::record_nacked(&queue_id);
                }
            }

            manager.complete(&pointer.id);
        });
    }

    async fn nack(&self, handle: &str, delay_seconds: Option<u32>) {
        if let Err(e) = self.queue.nack(handle, delay_seconds).await {
            warn!(queue = %self.queue.identifier(), error = %e, "nack failed");
        }
        metric_names::record_nacked(self.queue.identifier());
    }

    /// Renew leases that are within the jitter margin of expiring.
    async fn extend_aging_leases(&self) {
        let threshold = self
            .settings
            .visibility_timeout
            .saturating_sub(self.settings.extension_jitter);
        let extension = self.settings.visibility_timeout.as_secs() as u32;

        let aging: Vec<(String, Arc<Lease>)> = self
            .leases
            .iter()
            .filter(|entry| entry.value().last_renewal.lock().elapsed() >= threshold)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (pointer_id, lease) in aging {
            let current = lease.handle.lock().clone();
            match self.queue.extend_visibility(&current, extension).await {
                Ok(rotated) => {
                    if let Some(new_handle) = rotated {
                        *lease.handle.lock() = new_handle;
                    }
                    *lease.last_renewal.lock() = Instant::now();
                    debug!(message_id = %pointer_id, "lease extended");
                }
                Err(e) => {
                    warn!(message_id = %pointer_id, error = %e, "lease extension failed");
                }
            }
        }
    }

    /// Stop polling, wait (bounded) for in-flight work, then stop the queue.
    pub async fn shutdown(&self) {
        info!(queue = %self.queue.identifier(), "consumer shutting down");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let deadline = Instant::now() + self.settings.drain_grace;
        while !self.leases.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let remaining = self.leases.len();
        if remaining > 0 {
            warn!(
                queue = %self.queue.identifier(),
                remaining,
                "drain grace elapsed; remaining leases will expire on the broker"
            );
        }

        self.queue.stop().await;
        self.health
            .set_consumer_running(self.queue.identifier(), false);
    }
}
