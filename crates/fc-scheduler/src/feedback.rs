//! Completion feedback from the consumer.
//!
//! Terminal delivery outcomes transition the originating job
//! QUEUED → SUCCESS|FAILED and append a `dispatch_job_attempts` row.
//! Transient failures leave the job QUEUED; the broker redelivers the
//! pointer and the next outcome settles it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use fc_common::{CompletionListener, DeliveryOutcome, DeliveryReport, MessagePointer};

use crate::store::JobStore;
use crate::JobStatus;

pub struct SchedulerFeedback {
    store: Arc<JobStore>,
}

impl SchedulerFeedback {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CompletionListener for SchedulerFeedback {
    async fn on_delivery_complete(&self, pointer: &MessagePointer, report: &DeliveryReport) {
        let status = match report.outcome {
            DeliveryOutcome::Success => JobStatus::Success,
            DeliveryOutcome::PermanentFailure => JobStatus::Failed,
            DeliveryOutcome::TransientFailure => return,
        };

        match self.store.record_completion(&pointer.id, status, report).await {
            Ok(true) => {
                metrics::counter!(
                    "scheduler_jobs_completed_total",
                    "status" => status.as_str()
                )
                .increment(1);
            }
            Ok(false) => {
                // Not an error: the pointer may not belong to a dispatch
                // job, or a reclaim already moved the row.
            }
            Err(e) => {
                warn!(job_id = %pointer.id, error = %e, "failed to record completion");
            }
        }
    }
}
