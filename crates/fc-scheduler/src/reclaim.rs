//! Expired-job sweep and stale-QUEUED reclaim.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use fc_common::{WarningCategory, WarningSeverity, WarningSink};

use crate::store::JobStore;
use crate::Result;

/// Marks PENDING/QUEUED rows past their expiry as EXPIRED.
pub struct ExpiredJobSweeper {
    store: Arc<JobStore>,
    warnings: Option<Arc<dyn WarningSink>>,
}

impl ExpiredJobSweeper {
    pub fn new(store: Arc<JobStore>, warnings: Option<Arc<dyn WarningSink>>) -> Self {
        Self { store, warnings }
    }

    pub async fn sweep(&self) -> Result<usize> {
        let expired = self.store.sweep_expired().await?;
        if expired.is_empty() {
            return Ok(0);
        }

        metrics::counter!("scheduler_jobs_expired_total").increment(expired.len() as u64);
        info!(count = expired.len(), "expired dispatch jobs marked");

        if let Some(ref warnings) = self.warnings {
            warnings.emit(
                WarningCategory::Dispatch,
                WarningSeverity::Warn,
                format!("{} dispatch jobs expired before delivery", expired.len()),
                "ExpiredJobSweeper".to_string(),
            );
        }
        Ok(expired.len())
    }
}

/// Resets QUEUED rows whose queue message is presumed lost.
///
/// A row sitting in QUEUED past the threshold means the published pointer
/// never completed; resetting to PENDING lets the next poll republish.
/// The queue-side deduplication window absorbs the rare double-publish.
pub struct StaleQueuedReclaimer {
    store: Arc<JobStore>,
    threshold: Duration,
}

impl StaleQueuedReclaimer {
    pub fn new(store: Arc<JobStore>, threshold: Duration) -> Self {
        Self { store, threshold }
    }

    pub async fn reclaim(&self) -> Result<u64> {
        let count = self.store.reclaim_stale_queued(self.threshold).await?;
        metrics::counter!("scheduler_stale_queued_reclaimed_total").increment(count);

        if count > 0 {
            info!(
                count,
                threshold_minutes = self.threshold.as_secs() / 60,
                "stale QUEUED jobs reset to PENDING"
            );
        } else {
            debug!("no stale QUEUED jobs");
        }
        Ok(count)
    }
}
