//! # Stream Ingestion Bridge
//!
//! Attaches to an ordered, offset-tracked event stream and routes every
//! decoded record into [`Hub::broadcast`].
//!
//! ## Partitions
//!
//! The receive loop only dispatches. Each partition seen on the stream gets
//! its own worker task fed through a bounded queue, so messages of one
//! partition are routed strictly in order while partitions progress
//! independently: a slow session on one partition's units does not hold up
//! delivery for the others.
//!
//! ## Delivery rules
//!
//! - A message is acknowledged only after all of its records were handed to
//!   the hub, whether or not anyone was subscribed.
//! - A payload that does not decode is logged, acknowledged and skipped so
//!   it cannot block the partition.
//! - Receive errors after startup are retried forever with exponential
//!   backoff; only the cancellation token ends the loop. The message in
//!   hand and everything already queued to a worker when cancellation fires
//!   are still processed and acknowledged before the source is closed.
//!
//! The broker client sits behind [`MessageSource`] so the loop runs the same
//! against Kafka and against an in-memory channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::hub::Hub;
use crate::ingestors::decode::{decode_payload, DecodeError};
use crate::metrics::{MESSAGES_CONSUMED_TOTAL, MESSAGES_MALFORMED_TOTAL, STREAM_ERRORS_TOTAL};

/// Raw payloads longer than this are cut in malformed-message logs.
const LOGGED_PAYLOAD_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connection failed: {0}")]
    Connect(String),
    #[error("stream receive failed: {0}")]
    Receive(String),
    #[error("offset store failed: {0}")]
    Ack(String),
}

/// One message detached from the broker client.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

/// Ordered source of stream messages with per-message acknowledgement.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next message.
    async fn recv(&self) -> Result<InboundMessage, StreamError>;

    /// Marks `message` as processed. Called from partition workers, possibly
    /// concurrently for different partitions.
    fn ack(&self, message: &InboundMessage) -> Result<(), StreamError>;

    /// Called once when the consume loop exits.
    async fn close(&self) {}
}

#[async_trait]
impl<T: MessageSource + ?Sized> MessageSource for Arc<T> {
    async fn recv(&self) -> Result<InboundMessage, StreamError> {
        (**self).recv().await
    }

    fn ack(&self, message: &InboundMessage) -> Result<(), StreamError> {
        (**self).ack(message)
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Messages buffered per partition worker before the receive loop waits.
    pub partition_queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30000),
            partition_queue_capacity: 256,
        }
    }
}

struct PartitionWorker {
    queue: mpsc::Sender<InboundMessage>,
    task: JoinHandle<()>,
}

pub struct StreamBridge<S> {
    source: Arc<S>,
    hub: Arc<Hub>,
    config: BridgeConfig,
}

impl<S: MessageSource + 'static> StreamBridge<S> {
    /// Establishes the source and spawns the consume loop.
    ///
    /// Fails fast: an error from `connect` is returned as is and nothing is
    /// spawned.
    pub async fn start<F>(
        connect: F,
        hub: Arc<Hub>,
        config: BridgeConfig,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, StreamError>
    where
        F: Future<Output = Result<S, StreamError>>,
    {
        let source = Arc::new(connect.await?);
        info!("Stream consumer started");
        let bridge = Self { source, hub, config };
        Ok(tokio::spawn(bridge.consume(cancel)))
    }

    async fn consume(self, cancel: CancellationToken) {
        let mut backoff = self.config.reconnect_base_delay;
        let mut workers: HashMap<i32, PartitionWorker> = HashMap::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.source.recv() => next,
            };

            match next {
                Ok(message) => {
                    backoff = self.config.reconnect_base_delay;
                    let partition = message.partition;
                    counter!(MESSAGES_CONSUMED_TOTAL, "partition" => partition.to_string()).increment(1);

                    let worker = workers
                        .entry(partition)
                        .or_insert_with(|| self.spawn_worker(partition));
                    let queued = worker.queue.send(message).await;
                    if let Err(mpsc::error::SendError(message)) = queued {
                        warn!(
                            partition,
                            offset = message.offset,
                            "Partition worker is gone, message left unacknowledged"
                        );
                        workers.remove(&partition);
                    }
                }
                Err(e) => {
                    counter!(STREAM_ERRORS_TOTAL).increment(1);
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Stream consume error");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.reconnect_max_delay);
                }
            }
        }

        // Dropping the queues lets each worker drain what it holds and exit.
        let tasks: Vec<JoinHandle<()>> = workers.into_values().map(|worker| worker.task).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Partition worker failed");
            }
        }

        self.source.close().await;
        info!("Stream consumer stopped");
    }

    fn spawn_worker(&self, partition: i32) -> PartitionWorker {
        let (queue, mut inbox) = mpsc::channel::<InboundMessage>(self.config.partition_queue_capacity.max(1));
        let source = Arc::clone(&self.source);
        let hub = Arc::clone(&self.hub);
        debug!(partition, "Starting partition worker");

        let task = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                process(&hub, &message).await;
                match source.ack(&message) {
                    Ok(()) => trace!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        "Message acknowledged"
                    ),
                    Err(e) => warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to acknowledge message"
                    ),
                }
            }
            debug!(partition, "Partition worker stopped");
        });

        PartitionWorker { queue, task }
    }
}

async fn process(hub: &Hub, message: &InboundMessage) {
    let Some(payload) = message.payload.as_deref() else {
        debug!(topic = %message.topic, partition = message.partition, offset = message.offset, "Skipping empty message");
        return;
    };

    match route_payload(hub, payload).await {
        Ok(records) => trace!(partition = message.partition, offset = message.offset, records, "Message routed"),
        Err(e) => {
            counter!(MESSAGES_MALFORMED_TOTAL).increment(1);
            let raw = String::from_utf8_lossy(&payload[..payload.len().min(LOGGED_PAYLOAD_LIMIT)]);
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                raw = %raw,
                "Invalid stream message"
            );
        }
    }
}

/// Decodes `payload` and broadcasts each record to its unit.
///
/// Returns the number of records routed.
pub async fn route_payload(hub: &Hub, payload: &[u8]) -> Result<usize, DecodeError> {
    let records = decode_payload(payload)?;
    for record in &records {
        hub.broadcast(record.unit_id, record).await;
    }
    Ok(records.len())
}
