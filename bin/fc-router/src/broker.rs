//! Broker selection for the production router binary
//!
//! `QUEUE_TYPE` picks which adapter backs every configured queue for this
//! process: SQS, ActiveMQ, NATS JetStream, or an embedded SQLite queue.
//! Mixing broker types within a single instance isn't supported - the
//! config source's queue list is assumed homogeneous for a given deployment.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use fc_common::{Message, QueueConfig};
use fc_queue::{
    activemq::{ActiveMqConfig, ActiveMqConsumer, ActiveMqPublisher},
    nats::{NatsConfig, NatsPublisher, NatsQueueConsumer},
    sqlite::SqliteQueue,
    sqs::SqsQueueConsumer,
    QueueConsumer, QueueError, QueuePublisher, Result as QueueResult,
};
use fc_router::manager::ConsumerFactory;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerType {
    Sqs,
    ActiveMq,
    Nats,
    Embedded,
}

impl FromStr for BrokerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SQS" => Ok(Self::Sqs),
            "ACTIVEMQ" => Ok(Self::ActiveMq),
            "NATS" => Ok(Self::Nats),
            "EMBEDDED" => Ok(Self::Embedded),
            other => Err(anyhow!("Unknown QUEUE_TYPE '{}' (expected SQS, ACTIVEMQ, NATS, or EMBEDDED)", other)),
        }
    }
}

/// Read `QUEUE_TYPE` from the environment, defaulting to SQS for backward
/// compatibility with deployments that predate multi-broker support.
pub fn broker_type_from_env() -> AnyResult<BrokerType> {
    match std::env::var("QUEUE_TYPE") {
        Ok(v) if !v.is_empty() => BrokerType::from_str(&v),
        _ => Ok(BrokerType::Sqs),
    }
}

/// Creates queue consumers for the configured broker type, both at startup
/// and whenever config sync introduces a new queue at runtime.
pub struct MultiBrokerConsumerFactory {
    broker_type: BrokerType,
    sqs_client: Option<aws_sdk_sqs::Client>,
    amqp_uri: Option<String>,
    nats_url: Option<String>,
    sqlite_pool: Option<sqlx::SqlitePool>,
}

impl MultiBrokerConsumerFactory {
    pub fn sqs(client: aws_sdk_sqs::Client) -> Self {
        Self { broker_type: BrokerType::Sqs, sqs_client: Some(client), amqp_uri: None, nats_url: None, sqlite_pool: None }
    }

    pub fn activemq(uri: String) -> Self {
        Self { broker_type: BrokerType::ActiveMq, sqs_client: None, amqp_uri: Some(uri), nats_url: None, sqlite_pool: None }
    }

    pub fn nats(url: String) -> Self {
        Self { broker_type: BrokerType::Nats, sqs_client: None, amqp_uri: None, nats_url: Some(url), sqlite_pool: None }
    }

    pub fn embedded(pool: sqlx::SqlitePool) -> Self {
        Self { broker_type: BrokerType::Embedded, sqs_client: None, amqp_uri: None, nats_url: None, sqlite_pool: Some(pool) }
    }

    pub fn broker_type(&self) -> BrokerType {
        self.broker_type
    }
}

#[async_trait]
impl ConsumerFactory for MultiBrokerConsumerFactory {
    async fn create_consumer(
        &self,
        config: &QueueConfig,
    ) -> fc_router::Result<Arc<dyn QueueConsumer + Send + Sync>> {
        match self.broker_type {
            BrokerType::Sqs => {
                let client = self.sqs_client.clone()
                    .ok_or_else(|| fc_router::error::RouterError::Config("SQS client not configured".to_string()))?;
                let consumer = SqsQueueConsumer::from_queue_url(
                    client,
                    config.uri.clone(),
                    config.visibility_timeout as i32,
                ).await;
                Ok(Arc::new(consumer))
            }
            BrokerType::ActiveMq => {
                let uri = self.amqp_uri.clone()
                    .ok_or_else(|| fc_router::error::RouterError::Config("AMQP uri not configured".to_string()))?;
                let amqp_config = ActiveMqConfig {
                    uri,
                    queue_name: config.name.clone(),
                    ..Default::default()
                };
                let consumer = ActiveMqConsumer::new(amqp_config).await
                    .map_err(router_error_from_queue)?;
                Ok(Arc::new(consumer))
            }
            BrokerType::Nats => {
                let url = self.nats_url.clone()
                    .ok_or_else(|| fc_router::error::RouterError::Config("NATS url not configured".to_string()))?;
                let nats_config = NatsConfig {
                    url,
                    stream_name: config.name.clone(),
                    consumer_name: format!("fc-router-{}", config.name),
                    filter_subject: format!("{}.>", config.name),
                    ack_wait: std::time::Duration::from_secs(config.visibility_timeout as u64),
                    ..Default::default()
                };
                let consumer = NatsQueueConsumer::connect(nats_config).await
                    .map_err(router_error_from_queue)?;
                Ok(Arc::new(consumer))
            }
            BrokerType::Embedded => {
                let pool = self.sqlite_pool.clone()
                    .ok_or_else(|| fc_router::error::RouterError::Config("SQLite pool not configured".to_string()))?;
                let consumer = SqliteQueue::new(pool, config.name.clone(), config.visibility_timeout);
                Ok(Arc::new(consumer))
            }
        }
    }
}

fn router_error_from_queue(e: QueueError) -> fc_router::error::RouterError {
    fc_router::error::RouterError::Config(e.to_string())
}

/// Publisher used by the publish-message HTTP endpoint, wrapping whichever
/// broker backs this deployment.
pub enum MultiBrokerPublisher {
    Sqs(SqsPublisher),
    ActiveMq(ActiveMqPublisher),
    Nats(NatsPublisher),
    Embedded(SqliteQueue),
}

#[async_trait]
impl QueuePublisher for MultiBrokerPublisher {
    fn identifier(&self) -> &str {
        match self {
            Self::Sqs(p) => p.identifier(),
            Self::ActiveMq(p) => p.identifier(),
            Self::Nats(p) => p.identifier(),
            Self::Embedded(p) => p.identifier(),
        }
    }

    async fn publish(&self, message: Message) -> QueueResult<String> {
        match self {
            Self::Sqs(p) => p.publish(message).await,
            Self::ActiveMq(p) => p.publish(&message).await,
            Self::Nats(p) => p.publish(message).await,
            Self::Embedded(p) => p.publish(message).await,
        }
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<Vec<String>> {
        match self {
            Self::Sqs(p) => p.publish_batch(messages).await,
            Self::ActiveMq(p) => {
                let mut ids = Vec::with_capacity(messages.len());
                for m in messages {
                    ids.push(p.publish(&m).await?);
                }
                Ok(ids)
            }
            Self::Nats(p) => p.publish_batch(messages).await,
            Self::Embedded(p) => p.publish_batch(messages).await,
        }
    }
}

// Simple SQS publisher implementation, used when QUEUE_TYPE=SQS
pub struct SqsPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsPublisher {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl QueuePublisher for SqsPublisher {
    fn identifier(&self) -> &str {
        &self.queue_url
    }

    async fn publish(&self, message: Message) -> QueueResult<String> {
        let message_id = message.id.clone();
        let body = serde_json::to_string(&message)?;

        let mut request = self.client.send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        // FIFO queues require message_group_id and message_deduplication_id
        if self.queue_url.ends_with(".fifo") {
            let group_id = message.message_group_id.clone()
                .unwrap_or_else(|| "default".to_string());
            request = request
                .message_group_id(group_id)
                .message_deduplication_id(&message_id);
        }

        request.send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(message_id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> QueueResult<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let id = self.publish(message).await?;
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Build a SQLite connection pool for the embedded broker and ensure its schema exists.
pub async fn init_embedded_pool(path: &str) -> AnyResult<sqlx::SqlitePool> {
    info!(path = %path, "Opening embedded SQLite queue");
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", path))
        .await?;
    Ok(pool)
}
