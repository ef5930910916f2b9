//! Pending-job poll loop body.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::dispatcher::GroupDispatcher;
use crate::store::JobStore;
use crate::{DispatchJob, Result};

pub struct PendingJobPoller {
    store: Arc<JobStore>,
    dispatcher: Arc<GroupDispatcher>,
    batch_size: u32,
}

impl PendingJobPoller {
    pub fn new(store: Arc<JobStore>, dispatcher: Arc<GroupDispatcher>, batch_size: u32) -> Self {
        Self {
            store,
            dispatcher,
            batch_size,
        }
    }

    /// One tick: select due PENDING rows, withhold blocked groups, hand the
    /// rest to the group dispatcher.
    pub async fn poll(&self) -> Result<()> {
        let due = self.store.fetch_due_pending(self.batch_size).await?;
        if due.is_empty() {
            trace!("no due pending jobs");
            return Ok(());
        }

        metrics::gauge!("scheduler_pending_jobs").set(due.len() as f64);
        debug!(count = due.len(), "due pending jobs selected");

        // IndexMap keeps the store's (group, sequence, created_at) order.
        let mut by_group: IndexMap<String, Vec<DispatchJob>> = IndexMap::new();
        for job in due {
            by_group.entry(job.message_group.clone()).or_default().push(job);
        }

        let groups: HashSet<String> = by_group.keys().cloned().collect();
        let blocked = self.store.blocked_groups(&groups).await?;
        metrics::gauge!("scheduler_blocked_groups").set(blocked.len() as f64);

        for (group, jobs) in by_group {
            if blocked.contains(&group) {
                debug!(group = %group, withheld = jobs.len(), "group blocked on a failed job");
                metrics::counter!("scheduler_jobs_blocked_total").increment(jobs.len() as u64);
                continue;
            }

            // Inside a non-blocked group every mode is dispatchable:
            // IMMEDIATE unconditionally, BLOCK_ON_ERROR because the group
            // carries no FAILED blocker.
            self.dispatcher.submit(group, jobs).await;
        }

        Ok(())
    }
}
