//! Group dispatcher: per-group FIFO publication.
//!
//! Each message group drains serially; a global semaphore bounds how many
//! groups publish concurrently. A job is marked QUEUED before its pointer
//! is published; a failed publish restores PENDING and counts the attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use fc_common::{
    MediationKind, MessagePointer, QueueMessage, WarningCategory, WarningSeverity, WarningSink,
};
use fc_queue::QueuePublisher;

use crate::store::JobStore;
use crate::DispatchJob;

pub struct GroupDispatcher {
    store: Arc<JobStore>,
    publisher: Arc<dyn QueuePublisher>,
    group_permits: Arc<Semaphore>,
    /// Per-group FIFO of jobs awaiting publication. A group key also being
    /// present in `active` means a drain task currently owns its queue.
    queues: Arc<Mutex<HashMap<String, VecDeque<DispatchJob>>>>,
    active: Arc<Mutex<std::collections::HashSet<String>>>,
    warnings: Option<Arc<dyn WarningSink>>,
}

impl GroupDispatcher {
    pub fn new(
        store: Arc<JobStore>,
        publisher: Arc<dyn QueuePublisher>,
        max_concurrent_groups: usize,
        warnings: Option<Arc<dyn WarningSink>>,
    ) -> Self {
        Self {
            store,
            publisher,
            group_permits: Arc::new(Semaphore::new(max_concurrent_groups.max(1))),
            queues: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(std::collections::HashSet::new())),
            warnings,
        }
    }

    /// Append a group's dispatchable jobs and ensure a drain task runs.
    pub async fn submit(self: &Arc<Self>, group: String, jobs: Vec<DispatchJob>) {
        if jobs.is_empty() {
            return;
        }

        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(group.clone()).or_default();
            for job in jobs {
                // A job can reappear across poll ticks while still queued
                // here; keep one instance per id.
                if queue.iter().all(|existing| existing.id != job.id) {
                    queue.push_back(job);
                }
            }
        }

        let newly_active = self.active.lock().insert(group.clone());
        if !newly_active {
            return;
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _permit = dispatcher
                .group_permits
                .acquire()
                .await
                .expect("group semaphore closed");

            loop {
                let next = dispatcher.queues.lock().get_mut(&group).and_then(VecDeque::pop_front);
                let Some(job) = next else {
                    break;
                };
                dispatcher.publish_one(job).await;
            }

            let mut queues = dispatcher.queues.lock();
            if queues.get(&group).is_some_and(VecDeque::is_empty) {
                queues.remove(&group);
            }
            drop(queues);
            dispatcher.active.lock().remove(&group);
        });
    }

    /// QUEUED-then-publish for one job.
    async fn publish_one(&self, job: DispatchJob) {
        match self.store.mark_queued(&job.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "job no longer PENDING, skipping publish");
                return;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to mark job QUEUED");
                return;
            }
        }

        let pointer = MessagePointer {
            id: job.id.clone(),
            pool_code: job.dispatch_pool_id.clone(),
            auth_token: None,
            mediation_type: MediationKind::HTTP,
            mediation_target: job.target_url.clone(),
            message_group_id: job.message_group.clone(),
            sequence: Some(job.sequence),
            batch_id: None,
            source_message_id: None,
        };

        let envelope = match QueueMessage::for_pointer(&pointer) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "pointer serialization failed");
                let _ = self.store.restore_pending(&job.id).await;
                return;
            }
        };

        match self.publisher.publish(envelope).await {
            Ok(_) => {
                debug!(job_id = %job.id, group = %job.message_group, "job published");
                metrics::counter!("scheduler_jobs_published_total").increment(1);
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "publish failed, restoring PENDING");
                metrics::counter!("scheduler_publish_errors_total").increment(1);
                if let Some(ref warnings) = self.warnings {
                    warnings.emit(
                        WarningCategory::Dispatch,
                        WarningSeverity::Error,
                        format!("publish failed for job {}: {e}", job.id),
                        "GroupDispatcher".to_string(),
                    );
                }
                if let Err(e) = self.store.restore_pending(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "failed to restore job to PENDING");
                }
            }
        }
    }
}
