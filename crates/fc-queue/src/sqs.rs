//! SQS-FIFO queue variant.
//!
//! `MessageGroupId` carries the ordering key and `MessageDeduplicationId`
//! defaults to the message id. Nack is a visibility change to the requested
//! delay; the receipt handle stays valid after an extension.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::{
    MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use fc_common::{QueueMessage, ReceivedMessage};

use crate::{
    BatchPublishFailure, BatchPublishOutcome, QueueConsumer, QueueError, QueuePublisher, Result,
};

const MAX_BATCH: usize = 10;

pub struct SqsFifoQueue {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout: Duration,
    running: AtomicBool,
}

impl SqsFifoQueue {
    pub fn new(client: Client, queue_url: String, visibility_timeout: Duration) -> Self {
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout,
            running: AtomicBool::new(true),
        }
    }

    fn broker_err(e: impl std::fmt::Display) -> QueueError {
        QueueError::Broker(e.to_string())
    }
}

#[async_trait]
impl QueuePublisher for SqsFifoQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }

    async fn publish(&self, message: QueueMessage) -> Result<String> {
        let group = message
            .message_group_id
            .clone()
            .unwrap_or_else(|| message.message_id.clone());
        let dedup = message
            .deduplication_id
            .clone()
            .unwrap_or_else(|| message.message_id.clone());

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .message_group_id(group)
            .message_deduplication_id(dedup)
            .send()
            .await
            .map_err(Self::broker_err)?;

        debug!(queue = %self.queue_name, message_id = %message.message_id, "published to SQS");
        Ok(message.message_id)
    }

    async fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchPublishOutcome> {
        let mut outcome = BatchPublishOutcome::default();

        for chunk in messages.chunks(MAX_BATCH) {
            let mut entries = Vec::with_capacity(chunk.len());
            for (i, message) in chunk.iter().enumerate() {
                let group = message
                    .message_group_id
                    .clone()
                    .unwrap_or_else(|| message.message_id.clone());
                let dedup = message
                    .deduplication_id
                    .clone()
                    .unwrap_or_else(|| message.message_id.clone());
                let entry = SendMessageBatchRequestEntry::builder()
                    .id(format!("e{i}"))
                    .message_body(&message.body)
                    .message_group_id(group)
                    .message_deduplication_id(dedup)
                    .build()
                    .map_err(Self::broker_err)?;
                entries.push(entry);
            }

            let response = self
                .client
                .send_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(Self::broker_err)?;

            for ok in response.successful() {
                let index: usize = ok.id().trim_start_matches('e').parse().unwrap_or(0);
                outcome.published.push(chunk[index].message_id.clone());
            }
            for failed in response.failed() {
                let index: usize = failed.id().trim_start_matches('e').parse().unwrap_or(0);
                outcome.failed.push(BatchPublishFailure {
                    message_id: chunk[index].message_id.clone(),
                    reason: failed.message().unwrap_or("batch entry failed").to_string(),
                });
            }
        }

        Ok(outcome)
    }

    async fn depth(&self) -> Result<i64> {
        let response = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(Self::broker_err)?;

        Ok(response
            .attributes()
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn healthy(&self) -> bool {
        self.client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .is_ok()
    }
}

#[async_trait]
impl QueueConsumer for SqsFifoQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(MAX_BATCH as u32) as i32)
            .visibility_timeout(self.visibility_timeout.as_secs() as i32)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(Self::broker_err)?;

        let mut messages = Vec::new();
        for sqs_msg in response.messages.unwrap_or_default() {
            let (Some(body), Some(handle)) = (sqs_msg.body(), sqs_msg.receipt_handle()) else {
                continue;
            };
            let group = sqs_msg
                .attributes()
                .and_then(|a| a.get(&MessageSystemAttributeName::MessageGroupId))
                .cloned();
            let receive_count = sqs_msg
                .attributes()
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            let broker_id = sqs_msg.message_id().map(str::to_string);

            messages.push(ReceivedMessage {
                message_id: broker_id.clone().unwrap_or_default(),
                body: body.to_string(),
                message_group_id: group,
                receipt_handle: handle.to_string(),
                broker_message_id: broker_id,
                queue_identifier: self.queue_name.clone(),
                receive_count,
            });
        }

        if !messages.is_empty() {
            debug!(queue = %self.queue_name, count = messages.len(), "received from SQS");
        }
        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(Self::broker_err)?;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.unwrap_or(0) as i32)
            .send()
            .await
            .map_err(Self::broker_err)?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<Option<String>> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(Self::broker_err)?;
        // SQS keeps the same receipt handle valid.
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS consumer stopped");
    }
}
