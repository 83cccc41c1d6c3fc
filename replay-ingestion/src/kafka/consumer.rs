use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::kafka::offset_tracker::Offsets;
use crate::kafka::types::RawMessage;
use crate::metrics_consts::{CONSUMER_KAFKA_ERROR, OFFSETS_COMMITTED};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("message source closed")]
    Closed,
}

/// Where the driver pulls messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message. `Err(ConsumerError::Closed)` ends the stream.
    async fn recv(&self) -> Result<RawMessage, ConsumerError>;
}

/// Commits offsets back to the broker. Only the driver calls this.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit(&self, offsets: &Offsets) -> Result<(), ConsumerError>;
}

/// Single-topic recording consumer with manual offset commits.
pub struct RecordingConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl RecordingConsumer {
    pub fn new(config: &ClientConfig, topic: &str) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = config.create()?;
        consumer.subscribe(&[topic])?;
        info!(topic, "Subscribed to recordings topic");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the error back only when it is fatal for the consumer.
    async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
        match &e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut => {
                        record_kafka_error("info", "consumption");
                    }
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        warn!("Offset out of range - seeking to configured offset reset policy");
                        record_kafka_error("info", "offset_out_of_range");
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        warn!("Kafka consumer error: {code:?}");
                        record_kafka_error("warn", "consumer");
                        sleep(Duration::from_millis(100 * current_count.min(10))).await;
                    }
                }
                None
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                record_kafka_error("fatal", "consumer");
                Some(e)
            }
            KafkaError::Global(RDKafkaErrorCode::Authentication) => {
                error!("Kafka authentication failed");
                record_kafka_error("fatal", "authentication");
                Some(e)
            }
            KafkaError::Global(code) => {
                warn!("Global Kafka error: {code:?} - waiting for reconnect");
                record_kafka_error("warn", "global");
                sleep(Duration::from_millis(500 * current_count.min(6))).await;
                None
            }
            KafkaError::Canceled => {
                info!("Consumer canceled - shutting down");
                Some(e)
            }
            _ => {
                error!("Unexpected Kafka error: {:?}", e);
                record_kafka_error("warn", "unexpected");
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
                None
            }
        }
    }
}

fn record_kafka_error(level: &'static str, error: &'static str) {
    metrics::counter!(CONSUMER_KAFKA_ERROR, &[("level", level), ("error", error)]).increment(1);
}

#[async_trait]
impl MessageSource for RecordingConsumer {
    async fn recv(&self) -> Result<RawMessage, ConsumerError> {
        let mut error_count = 0;
        loop {
            match self.consumer.recv().await {
                Ok(message) => return Ok(RawMessage::from_borrowed(&message)),
                Err(e) => {
                    error_count += 1;
                    if let Some(fatal) = Self::handle_kafka_error(e, error_count).await {
                        return Err(fatal.into());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl OffsetCommitter for RecordingConsumer {
    async fn commit(&self, offsets: &Offsets) -> Result<(), ConsumerError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }

        self.consumer.commit(&list, CommitMode::Sync)?;
        metrics::counter!(OFFSETS_COMMITTED).increment(offsets.len() as u64);
        info!("Committed offsets for {} partitions", offsets.len());
        Ok(())
    }
}
