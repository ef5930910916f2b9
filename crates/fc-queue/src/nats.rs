//! NATS JetStream queue variant.
//!
//! Work-queue retention with a durable pull consumer and explicit acks.
//! Grouped messages publish to `<base>.<group>`; the `Nats-Msg-Id` header
//! carries the deduplication id into the stream's duplicate window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    AckKind,
};
use dashmap::DashMap;
use futures::StreamExt;
use tracing::{debug, info};

use fc_common::{QueueMessage, ReceivedMessage};

use crate::{
    record_unknown_handle, BatchPublishFailure, BatchPublishOutcome, QueueConsumer, QueueError,
    QueuePublisher, Result,
};

const MAX_BATCH: usize = 1000;
const MSG_ID_HEADER: &str = "Nats-Msg-Id";
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_DELIVER: i64 = 10;

#[derive(Debug, Clone)]
pub struct JetStreamSettings {
    pub url: String,
    pub stream_name: String,
    /// Base subject; grouped messages go to `<base>.<group>`.
    pub subject_base: String,
    pub durable_name: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
    pub duplicate_window: Duration,
}

impl Default for JetStreamSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "dispatch".to_string(),
            subject_base: "dispatch".to_string(),
            durable_name: "fc-router".to_string(),
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: DEFAULT_MAX_DELIVER,
            duplicate_window: Duration::from_secs(5 * 60),
        }
    }
}

pub struct JetStreamQueue {
    settings: JetStreamSettings,
    client: async_nats::Client,
    context: jetstream::Context,
    stream: Stream,
    consumer: PullConsumer,
    leases: DashMap<String, jetstream::Message>,
    running: AtomicBool,
}

impl JetStreamQueue {
    pub async fn connect(settings: JetStreamSettings) -> Result<Self> {
        info!(url = %settings.url, stream = %settings.stream_name, "connecting to JetStream");

        let client = async_nats::connect(&settings.url)
            .await
            .map_err(|e| QueueError::Broker(format!("NATS connect failed: {e}")))?;
        let context = jetstream::new(client.clone());

        let stream = context
            .get_or_create_stream(StreamConfig {
                name: settings.stream_name.clone(),
                subjects: vec![
                    settings.subject_base.clone(),
                    format!("{}.>", settings.subject_base),
                ],
                retention: RetentionPolicy::WorkQueue,
                duplicate_window: settings.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream stream failed: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                &settings.durable_name,
                PullConfig {
                    durable_name: Some(settings.durable_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: settings.ack_wait,
                    max_deliver: settings.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream consumer failed: {e}")))?;

        Ok(Self {
            settings,
            client,
            context,
            stream,
            consumer,
            leases: DashMap::new(),
            running: AtomicBool::new(true),
        })
    }

    fn subject_for(&self, group: Option<&str>) -> String {
        match group {
            Some(group) if !group.is_empty() => {
                // Dots are subject separators; flatten them out of the key.
                format!("{}.{}", self.settings.subject_base, group.replace('.', "_"))
            }
            _ => self.settings.subject_base.clone(),
        }
    }

    fn group_from_subject(&self, subject: &str) -> Option<String> {
        subject
            .strip_prefix(&format!("{}.", self.settings.subject_base))
            .map(str::to_string)
    }
}

#[async_trait]
impl QueuePublisher for JetStreamQueue {
    fn identifier(&self) -> &str {
        &self.settings.stream_name
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }

    async fn publish(&self, message: QueueMessage) -> Result<String> {
        let subject = self.subject_for(message.message_group_id.as_deref());

        let mut headers = async_nats::HeaderMap::new();
        let dedup = message
            .deduplication_id
            .clone()
            .unwrap_or_else(|| message.message_id.clone());
        headers.insert(MSG_ID_HEADER, dedup.as_str());

        self.context
            .publish_with_headers(subject, headers, message.body.clone().into())
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream publish failed: {e}")))?
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream publish ack failed: {e}")))?;

        debug!(stream = %self.settings.stream_name, message_id = %message.message_id, "published to JetStream");
        Ok(message.message_id)
    }

    async fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchPublishOutcome> {
        let mut outcome = BatchPublishOutcome::default();
        for chunk in messages.chunks(MAX_BATCH) {
            for message in chunk {
                let id = message.message_id.clone();
                match self.publish(message.clone()).await {
                    Ok(id) => outcome.published.push(id),
                    Err(e) => outcome.failed.push(BatchPublishFailure {
                        message_id: id,
                        reason: e.to_string(),
                    }),
                }
            }
        }
        Ok(outcome)
    }

    async fn depth(&self) -> Result<i64> {
        let mut stream = self.stream.clone();
        let info = stream
            .info()
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream info failed: {e}")))?;
        Ok(info.state.messages as i64)
    }

    async fn healthy(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

#[async_trait]
impl QueueConsumer for JetStreamQueue {
    fn identifier(&self) -> &str {
        &self.settings.stream_name
    }

    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let mut fetched = self
            .consumer
            .fetch()
            .max_messages(max_messages as usize)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream fetch failed: {e}")))?;

        let mut messages = Vec::new();
        while let Some(next) = fetched.next().await {
            let msg =
                next.map_err(|e| QueueError::Broker(format!("JetStream delivery failed: {e}")))?;

            let handle = uuid::Uuid::new_v4().to_string();
            let message_id = msg
                .headers
                .as_ref()
                .and_then(|h| h.get(MSG_ID_HEADER))
                .map(|v| v.as_str().to_string())
                .unwrap_or_else(|| handle.clone());
            let receive_count = msg.info().map(|i| i.delivered as u32).unwrap_or(1);
            let group = self.group_from_subject(msg.subject.as_str());

            messages.push(ReceivedMessage {
                message_id: message_id.clone(),
                body: String::from_utf8_lossy(&msg.payload).into_owned(),
                message_group_id: group,
                receipt_handle: handle.clone(),
                broker_message_id: Some(message_id),
                queue_identifier: self.settings.stream_name.clone(),
                receive_count,
            });
            self.leases.insert(handle, msg);
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let Some((_, msg)) = self.leases.remove(receipt_handle) else {
            record_unknown_handle(&self.settings.stream_name, "ack");
            return Ok(());
        };
        msg.ack()
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream ack failed: {e}")))
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let Some((_, msg)) = self.leases.remove(receipt_handle) else {
            record_unknown_handle(&self.settings.stream_name, "nack");
            return Ok(());
        };
        let delay = delay_seconds.map(|s| Duration::from_secs(u64::from(s)));
        msg.ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream nak failed: {e}")))
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        _seconds: u32,
    ) -> Result<Option<String>> {
        let Some(msg) = self.leases.get(receipt_handle) else {
            record_unknown_handle(&self.settings.stream_name, "extend");
            return Ok(None);
        };
        // In-progress ack resets the ack_wait clock; the handle stays valid.
        msg.ack_with(AckKind::Progress)
            .await
            .map_err(|e| QueueError::Broker(format!("JetStream progress failed: {e}")))?;
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(stream = %self.settings.stream_name, "JetStream consumer stopped");
    }
}
