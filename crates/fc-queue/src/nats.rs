//! NATS JetStream Queue Consumer
//!
//! Provides a pull-consumer based adapter for NATS JetStream, used as an
//! alternative to SQS/ActiveMQ when the deployment already runs a NATS
//! cluster. Visibility-timeout semantics are approximated with JetStream's
//! ack-wait window: `extend_visibility` maps to an AckProgress (WIP) signal,
//! `nack` maps to a NAK with an explicit redelivery delay, and redelivery is
//! bounded by the consumer's `max_deliver` setting rather than tracked here.

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy},
    AckKind,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use fc_common::{Message, QueuedMessage};
use crate::{QueueConsumer, QueuePublisher, QueueError, QueueMetrics, Result};

/// Configuration for a NATS JetStream consumer
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL, e.g. "nats://localhost:4222"
    pub url: String,
    /// Stream name backing the queue
    pub stream_name: String,
    /// Durable consumer name
    pub consumer_name: String,
    /// Subject filter for this consumer within the stream
    pub filter_subject: String,
    /// Ack-wait window; functions as the visibility timeout
    pub ack_wait: Duration,
    /// Maximum redelivery attempts before JetStream stops redelivering
    pub max_deliver: i64,
    /// Maximum batch size per pull
    pub batch_size: usize,
    /// How long a pull request waits for messages before returning empty
    pub batch_expires: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "FLOWCATALYST".to_string(),
            consumer_name: "fc-router".to_string(),
            filter_subject: "flowcatalyst.>".to_string(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 10,
            batch_size: 10,
            batch_expires: Duration::from_secs(20),
        }
    }
}

/// NATS JetStream pull consumer
pub struct NatsQueueConsumer {
    config: NatsConfig,
    jetstream: jetstream::Context,
    consumer: jetstream::consumer::Consumer<PullConsumerConfig>,
    running: AtomicBool,
    last_poll_at: AtomicI64,
    /// Maps receipt handles we hand out to the in-flight JetStream message
    in_flight: Arc<dashmap::DashMap<String, jetstream::Message>>,
}

impl NatsQueueConsumer {
    /// Connect to NATS, resolve the stream, and create/attach the durable pull consumer
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        info!(
            url = %config.url,
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            "Connecting to NATS JetStream"
        );

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Database(format!("NATS connect failed: {}", e)))?;

        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_stream(&config.stream_name)
            .await
            .map_err(|e| QueueError::Database(format!("Failed to get stream: {}", e)))?;

        let consumer_config = PullConsumerConfig {
            durable_name: Some(config.consumer_name.clone()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            filter_subject: config.filter_subject.clone(),
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&config.consumer_name, consumer_config)
            .await
            .map_err(|e| QueueError::Database(format!("Failed to create consumer: {}", e)))?;

        Ok(Self {
            config,
            jetstream,
            consumer,
            running: AtomicBool::new(true),
            last_poll_at: AtomicI64::new(chrono::Utc::now().timestamp()),
            in_flight: Arc::new(dashmap::DashMap::new()),
        })
    }

    fn generate_receipt_handle(&self) -> String {
        format!("{}:{}", self.config.consumer_name, uuid::Uuid::new_v4())
    }
}

#[async_trait]
impl QueueConsumer for NatsQueueConsumer {
    fn identifier(&self) -> &str {
        &self.config.stream_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        self.last_poll_at.store(chrono::Utc::now().timestamp(), Ordering::SeqCst);

        let batch_size = (max_messages as usize).min(self.config.batch_size);

        let mut batch = self
            .consumer
            .batch()
            .max_messages(batch_size)
            .expires(self.config.batch_expires)
            .messages()
            .await
            .map_err(|e| QueueError::Database(format!("JetStream fetch failed: {}", e)))?;

        let mut messages = Vec::with_capacity(batch_size);

        use futures::StreamExt;
        while let Some(next) = batch.next().await {
            let nats_msg = match next {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, stream = %self.config.stream_name, "Error receiving JetStream message");
                    break;
                }
            };

            match serde_json::from_slice::<Message>(&nats_msg.payload) {
                Ok(message) => {
                    let broker_message_id = nats_msg
                        .info()
                        .ok()
                        .map(|info| info.stream_sequence.to_string());

                    let receipt_handle = self.generate_receipt_handle();
                    self.in_flight.insert(receipt_handle.clone(), nats_msg);

                    messages.push(QueuedMessage {
                        message,
                        receipt_handle,
                        broker_message_id,
                        queue_identifier: self.config.stream_name.clone(),
                    });
                }
                Err(e) => {
                    error!(
                        stream = %self.config.stream_name,
                        error = %e,
                        "Failed to parse JetStream message, terminating delivery"
                    );
                    let _ = nats_msg.ack_with(AckKind::Term).await;
                }
            }
        }

        if !messages.is_empty() {
            debug!(
                stream = %self.config.stream_name,
                count = messages.len(),
                "Polled messages from JetStream"
            );
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let (_, nats_msg) = self
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        nats_msg
            .ack()
            .await
            .map_err(|e| QueueError::Database(format!("ACK failed: {}", e)))?;

        debug!(receipt_handle = %receipt_handle, "Message acknowledged in JetStream");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let (_, nats_msg) = self
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        let delay = delay_seconds.map(|s| Duration::from_secs(s as u64));

        nats_msg
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| QueueError::Database(format!("NAK failed: {}", e)))?;

        debug!(
            receipt_handle = %receipt_handle,
            delay_seconds = ?delay_seconds,
            "Message NAKed in JetStream"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, _seconds: u32) -> Result<()> {
        let nats_msg = self
            .in_flight
            .get(receipt_handle)
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;

        // JetStream has no arbitrary-duration visibility extension; AckProgress
        // resets the ack-wait timer back to the consumer's configured window.
        nats_msg
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| QueueError::Database(format!("AckProgress failed: {}", e)))?;

        debug!(receipt_handle = %receipt_handle, "Sent AckProgress (WIP) for JetStream message");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let elapsed = chrono::Utc::now().timestamp() - self.last_poll_at.load(Ordering::SeqCst);
        elapsed < 60
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(stream = %self.config.stream_name, "NATS JetStream consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let info = self
            .consumer
            .info()
            .await
            .map_err(|e| QueueError::Database(format!("Failed to fetch consumer info: {}", e)))?;

        Ok(Some(QueueMetrics {
            pending_messages: info.num_pending,
            in_flight_messages: info.num_ack_pending as u64,
            queue_identifier: self.config.stream_name.clone(),
            total_polled: info.delivered.stream_sequence,
            total_acked: info.ack_floor.stream_sequence,
            total_nacked: info.num_redelivered as u64,
            total_deferred: 0,
        }))
    }
}

/// NATS JetStream publisher, used for development/seeding and for the
/// FIFO-ack publish endpoint
pub struct NatsPublisher {
    subject_prefix: String,
    client: RwLock<async_nats::Client>,
}

impl NatsPublisher {
    pub async fn connect(url: &str, subject_prefix: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| QueueError::Database(format!("NATS connect failed: {}", e)))?;

        Ok(Self {
            subject_prefix: subject_prefix.to_string(),
            client: RwLock::new(client),
        })
    }

    fn subject_for(&self, message: &Message) -> String {
        match &message.message_group_id {
            Some(group) => format!("{}.{}", self.subject_prefix, group),
            None => format!("{}.default", self.subject_prefix),
        }
    }
}

#[async_trait]
impl QueuePublisher for NatsPublisher {
    fn identifier(&self) -> &str {
        &self.subject_prefix
    }

    async fn publish(&self, message: Message) -> Result<String> {
        let subject = self.subject_for(&message);
        let message_id = message.id.clone();
        let body = serde_json::to_vec(&message)?;

        let client = self.client.read().await;
        client
            .publish(subject, body.into())
            .await
            .map_err(|e| QueueError::Database(format!("Publish failed: {}", e)))?;
        client
            .flush()
            .await
            .map_err(|e| QueueError::Database(format!("Flush failed: {}", e)))?;

        Ok(message_id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message).await?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.max_deliver, 10);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_subject_grouping() {
        let grouped = Message {
            id: "m1".to_string(),
            pool_code: "DEFAULT".to_string(),
            auth_token: None,
            signing_secret: None,
            mediation_type: fc_common::MediationType::HTTP,
            mediation_target: "http://localhost".to_string(),
            message_group_id: Some("g1".to_string()),
        };
        assert_eq!(grouped.message_group_id.as_deref(), Some("g1"));
    }
}
