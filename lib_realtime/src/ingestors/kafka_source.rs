//! Kafka consumer-group [`MessageSource`] built on rdkafka's `StreamConsumer`.
//!
//! Offsets are stored explicitly after a message has been routed and
//! committed by librdkafka's auto-commit timer, so a crash replays at most
//! the messages routed since the last commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tracing::{debug, info, warn};

use super::stream_bridge::{InboundMessage, MessageSource, StreamError};

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma separated `host:port` list.
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub session_timeout: Duration,
    /// Upper bound for the startup metadata fetch.
    pub metadata_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".into(),
            topic: "realtime".into(),
            group_id: "realtime-consumer".into(),
            session_timeout: Duration::from_secs(15),
            metadata_timeout: Duration::from_secs(10),
        }
    }
}

impl KafkaConfig {
    pub fn to_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string());
        config
    }
}

pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaSource {
    /// Creates the consumer, checks that the brokers answer, then subscribes.
    pub async fn connect(config: KafkaConfig) -> Result<Self, StreamError> {
        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            "Opening Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .to_client_config()
            .create()
            .map_err(|e| StreamError::Connect(format!("failed to create consumer: {e}")))?;
        let consumer = Arc::new(consumer);

        let client = Arc::clone(&consumer);
        let topic = config.topic.clone();
        let timeout = config.metadata_timeout;
        let metadata = tokio::task::spawn_blocking(move || client.fetch_metadata(Some(topic.as_str()), timeout))
            .await
            .map_err(|e| StreamError::Connect(format!("metadata fetch aborted: {e}")))?
            .map_err(|e| StreamError::Connect(format!("brokers unreachable: {e}")))?;

        for topic in metadata.topics() {
            match topic.error() {
                Some(code) => warn!(topic = topic.name(), error = ?code, "Topic metadata reports an error"),
                None => debug!(topic = topic.name(), partitions = topic.partitions().len(), "Topic metadata"),
            }
        }

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| StreamError::Connect(format!("failed to subscribe: {e}")))?;

        info!(topic = %config.topic, "Kafka consumer subscribed");
        Ok(Self {
            consumer,
            topic: config.topic,
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&self) -> Result<InboundMessage, StreamError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| StreamError::Receive(e.to_string()))?;

        Ok(InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }

    fn ack(&self, message: &InboundMessage) -> Result<(), StreamError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)
            .map_err(|e| StreamError::Ack(e.to_string()))
    }

    async fn close(&self) {
        let consumer = Arc::clone(&self.consumer);
        let committed = tokio::task::spawn_blocking(move || {
            let result = consumer.commit_consumer_state(CommitMode::Sync);
            consumer.unsubscribe();
            result
        })
        .await;

        match committed {
            Ok(Ok(())) => info!(topic = %self.topic, "Final offsets committed"),
            Ok(Err(e)) => debug!(topic = %self.topic, error = %e, "No final offset commit"),
            Err(e) => warn!(topic = %self.topic, error = %e, "Final offset commit aborted"),
        }
    }
}
