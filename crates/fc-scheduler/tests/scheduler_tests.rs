//! Scheduler behavior: selection, block-on-error gating, publication
//! bookkeeping, expiry, stale reclaim and completion feedback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use fc_common::{
    CompletionListener, DeliveryErrorKind, DeliveryOutcome, DeliveryReport, MediationKind,
    MessagePointer, QueueMessage,
};
use fc_queue::{BatchPublishOutcome, QueueError, QueuePublisher};
use fc_scheduler::{
    DispatchJob, DispatchMode, GroupDispatcher, JobStatus, JobStore, PendingJobPoller,
    SchedulerFeedback, StaleQueuedReclaimer,
};

/// Publisher capturing envelopes; optionally fails every publish.
struct RecordingPublisher {
    published: Mutex<Vec<QueueMessage>>,
    fail: bool,
}

impl RecordingPublisher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    fn published_ids(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|m| m.message_id.clone())
            .collect()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    fn identifier(&self) -> &str {
        "recording"
    }

    fn max_batch_size(&self) -> usize {
        100
    }

    async fn publish(&self, message: QueueMessage) -> fc_queue::Result<String> {
        if self.fail {
            return Err(QueueError::Broker("synthetic publish failure".to_string()));
        }
        let id = message.message_id.clone();
        self.published.lock().push(message);
        Ok(id)
    }

    async fn publish_batch(
        &self,
        messages: Vec<QueueMessage>,
    ) -> fc_queue::Result<BatchPublishOutcome> {
        let mut outcome = BatchPublishOutcome::default();
        for message in messages {
            outcome.published.push(self.publish(message).await?);
        }
        Ok(outcome)
    }

    async fn depth(&self) -> fc_queue::Result<i64> {
        Ok(self.published.lock().len() as i64)
    }

    async fn healthy(&self) -> bool {
        !self.fail
    }
}

async fn store_with_pool() -> (Arc<JobStore>, SqlitePool) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(JobStore::new(pool.clone()));
    store.init_schema().await.unwrap();
    (store, pool)
}

fn job(id: &str, group: &str, sequence: i64, mode: DispatchMode, status: JobStatus) -> DispatchJob {
    let now = Utc::now();
    DispatchJob {
        id: id.to_string(),
        status,
        mode,
        message_group: group.to_string(),
        sequence,
        dispatch_pool_id: "P".to_string(),
        target_url: "https://example.com/hook".to_string(),
        payload: Some(serde_json::json!({"order": id})),
        timeout_seconds: 30,
        max_retries: 3,
        retry_strategy: None,
        scheduled_for: now - ChronoDuration::seconds(1),
        expires_at: now + ChronoDuration::hours(1),
        attempt_count: 0,
        created_at: now,
        updated_at: now,
    }
}

fn success_report() -> DeliveryReport {
    DeliveryReport::success(200, 1, 12)
}

fn permanent_report() -> DeliveryReport {
    DeliveryReport {
        outcome: DeliveryOutcome::PermanentFailure,
        delay_seconds: None,
        status_code: Some(404),
        response_body: Some("not found".to_string()),
        error_message: Some("HTTP 404: configuration error".to_string()),
        error_kind: Some(DeliveryErrorKind::Config),
        attempts: 4,
        duration_ms: 250,
    }
}

fn pointer_for(id: &str) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "P".to_string(),
        auth_token: None,
        mediation_type: MediationKind::HTTP,
        mediation_target: "https://example.com/hook".to_string(),
        message_group_id: "g".to_string(),
        sequence: None,
        batch_id: None,
        source_message_id: None,
    }
}

async fn poll_once(store: Arc<JobStore>, publisher: Arc<RecordingPublisher>) {
    let dispatcher = Arc::new(GroupDispatcher::new(store.clone(), publisher, 16, None));
    let poller = PendingJobPoller::new(store, dispatcher, 100);
    poller.poll().await.unwrap();
    // Group drain tasks are spawned; give them a beat.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn due_pending_job_is_published_and_marked_queued() {
    let (store, _pool) = store_with_pool().await;
    let publisher = RecordingPublisher::new();

    store
        .insert(&job("j1", "g", 1, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();

    poll_once(store.clone(), publisher.clone()).await;

    assert_eq!(publisher.published_ids(), vec!["j1"]);
    let envelope = &publisher.published.lock()[0];
    assert_eq!(envelope.deduplication_id.as_deref(), Some("j1"));
    assert_eq!(envelope.message_group_id.as_deref(), Some("g"));

    let stored = store.get("j1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
}

#[tokio::test]
async fn unscheduled_and_expired_jobs_are_not_selected() {
    let (store, pool) = store_with_pool().await;
    let publisher = RecordingPublisher::new();

    let mut future = job("future", "g", 1, DispatchMode::Immediate, JobStatus::Pending);
    future.scheduled_for = Utc::now() + ChronoDuration::hours(1);
    store.insert(&future).await.unwrap();

    store
        .insert(&job("spent", "g2", 1, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();
    sqlx::query("UPDATE dispatch_jobs SET expires_at = ?1 WHERE id = 'spent'")
        .bind(Utc::now().timestamp_millis() - 1000)
        .execute(&pool)
        .await
        .unwrap();

    poll_once(store.clone(), publisher.clone()).await;
    assert!(publisher.published_ids().is_empty());
}

#[tokio::test]
async fn group_publishes_in_sequence_order() {
    let (store, _pool) = store_with_pool().await;
    let publisher = RecordingPublisher::new();

    store
        .insert(&job("second", "g", 2, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();
    store
        .insert(&job("first", "g", 1, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();

    poll_once(store.clone(), publisher.clone()).await;

    assert_eq!(publisher.published_ids(), vec!["first", "second"]);
}

#[tokio::test]
async fn failed_block_on_error_job_blocks_its_group() {
    let (store, pool) = store_with_pool().await;
    let publisher = RecordingPublisher::new();

    store
        .insert(&job("a", "g", 1, DispatchMode::BlockOnError, JobStatus::Failed))
        .await
        .unwrap();
    store
        .insert(&job("b", "g", 2, DispatchMode::BlockOnError, JobStatus::Pending))
        .await
        .unwrap();
    store
        .insert(&job("c", "other", 1, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();

    poll_once(store.clone(), publisher.clone()).await;

    // The blocked group is withheld entirely; other groups proceed.
    assert_eq!(publisher.published_ids(), vec!["c"]);
    assert_eq!(
        store.get("b").await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    // Resolving the blocker releases the group on the next tick.
    sqlx::query("UPDATE dispatch_jobs SET status = 'SUCCESS' WHERE id = 'a'")
        .execute(&pool)
        .await
        .unwrap();

    poll_once(store.clone(), publisher.clone()).await;
    assert_eq!(publisher.published_ids(), vec!["c", "b"]);
}

#[tokio::test]
async fn publish_failure_restores_pending_and_counts_attempt() {
    let (store, _pool) = store_with_pool().await;
    let publisher = RecordingPublisher::failing();

    store
        .insert(&job("j1", "g", 1, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();

    let dispatcher = Arc::new(GroupDispatcher::new(
        store.clone(),
        publisher.clone(),
        16,
        None,
    ));
    let poller = PendingJobPoller::new(store.clone(), dispatcher, 100);
    poller.poll().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = store.get("j1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
}

#[tokio::test]
async fn expired_sweep_marks_pending_and_queued() {
    let (store, pool) = store_with_pool().await;

    store
        .insert(&job("p", "g", 1, DispatchMode::Immediate, JobStatus::Pending))
        .await
        .unwrap();
    store
        .insert(&job("q", "g2", 1, DispatchMode::Immediate, JobStatus::Queued))
        .await
        .unwrap();
    store
        .insert(&job("done", "g3", 1, DispatchMode::Immediate, JobStatus::Success))
        .await
        .unwrap();

    let past = Utc::now().timestamp_millis() - 1000;
    sqlx::query("UPDATE dispatch_jobs SET expires_at = ?1")
        .bind(past)
        .execute(&pool)
        .await
        .unwrap();

    let expired = store.sweep_expired().await.unwrap();
    assert_eq!(expired.len(), 2);
    assert_eq!(store.get("p").await.unwrap().unwrap().status, JobStatus::Expired);
    assert_eq!(store.get("q").await.unwrap().unwrap().status, JobStatus::Expired);
    assert_eq!(
        store.get("done").await.unwrap().unwrap().status,
        JobStatus::Success
    );
}

#[tokio::test]
async fn stale_queued_rows_return_to_pending_without_attempt_bump() {
    let (store, pool) = store_with_pool().await;

    let mut stuck = job("stuck", "g", 1, DispatchMode::Immediate, JobStatus::Queued);
    stuck.attempt_count = 2;
    store.insert(&stuck).await.unwrap();
    store
        .insert(&job("fresh", "g2", 1, DispatchMode::Immediate, JobStatus::Queued))
        .await
        .unwrap();

    // Age the stuck row twenty minutes into the past.
    let twenty_minutes_ago = Utc::now().timestamp_millis() - 20 * 60 * 1000;
    sqlx::query("UPDATE dispatch_jobs SET updated_at = ?1 WHERE id = 'stuck'")
        .bind(twenty_minutes_ago)
        .execute(&pool)
        .await
        .unwrap();

    let reclaimer = StaleQueuedReclaimer::new(store.clone(), Duration::from_secs(15 * 60));
    let reclaimed = reclaimer.reclaim().await.unwrap();
    assert_eq!(reclaimed, 1);

    let reclaimed_job = store.get("stuck").await.unwrap().unwrap();
    assert_eq!(reclaimed_job.status, JobStatus::Pending);
    assert_eq!(reclaimed_job.attempt_count, 2);
    assert!(reclaimed_job.updated_at.timestamp_millis() > twenty_minutes_ago);

    assert_eq!(
        store.get("fresh").await.unwrap().unwrap().status,
        JobStatus::Queued
    );
}

#[tokio::test]
async fn successful_completion_records_attempt_history() {
    let (store, _pool) = store_with_pool().await;

    store
        .insert(&job("j1", "g", 1, DispatchMode::Immediate, JobStatus::Queued))
        .await
        .unwrap();

    let feedback = SchedulerFeedback::new(store.clone());
    feedback
        .on_delivery_complete(&pointer_for("j1"), &success_report())
        .await;

    let stored = store.get("j1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Success);
    assert_eq!(stored.attempt_count, 1);

    let attempts = store.attempts_for("j1").await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].status, "SUCCESS");
    assert_eq!(attempts[0].response_code, Some(200));
}

#[tokio::test]
async fn permanent_failure_fails_the_job() {
    let (store, _pool) = store_with_pool().await;

    store
        .insert(&job("j1", "g", 1, DispatchMode::Immediate, JobStatus::Queued))
        .await
        .unwrap();

    let feedback = SchedulerFeedback::new(store.clone());
    feedback
        .on_delivery_complete(&pointer_for("j1"), &permanent_report())
        .await;

    let stored = store.get("j1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);

    let attempts = store.attempts_for("j1").await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, "FAILED");
    assert_eq!(attempts[0].response_code, Some(404));
    assert_eq!(attempts[0].error_type.as_deref(), Some("CONFIG"));
}

#[tokio::test]
async fn transient_outcome_leaves_the_job_queued() {
    let (store, _pool) = store_with_pool().await;

    store
        .insert(&job("j1", "g", 1, DispatchMode::Immediate, JobStatus::Queued))
        .await
        .unwrap();

    let report = DeliveryReport {
        outcome: DeliveryOutcome::TransientFailure,
        delay_seconds: Some(5),
        status_code: Some(503),
        response_body: None,
        error_message: Some("HTTP 503: server error".to_string()),
        error_kind: Some(DeliveryErrorKind::Process),
        attempts: 4,
        duration_ms: 90,
    };
    let feedback = SchedulerFeedback::new(store.clone());
    feedback.on_delivery_complete(&pointer_for("j1"), &report).await;

    let stored = store.get("j1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert!(store.attempts_for("j1").await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_for_unknown_pointer_is_ignored() {
    let (store, _pool) = store_with_pool().await;

    let feedback = SchedulerFeedback::new(store.clone());
    feedback
        .on_delivery_complete(&pointer_for("not-a-job"), &success_report())
        .await;

    assert!(store.get("not-a-job").await.unwrap().is_none());
}
