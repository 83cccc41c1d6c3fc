use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::kafka::config::producer_config;
use crate::metrics_consts::{PUBLISHER_FLUSH_DURATION_MS, PUBLISHER_MESSAGES};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (delivery canceled)")]
    Canceled,
    #[error("publisher flush timed out after {0:?}")]
    FlushTimeout(Duration),
    #[error("publisher is closed")]
    Closed,
}

/// Broker acknowledgement of a single published message.
pub type Delivery = BoxFuture<'static, Result<(), PublishError>>;

/// The deliveries one caller is responsible for.
///
/// Publishers are shared by concurrent commits, so each commit collects the
/// deliveries of its own messages and waits on exactly those.
#[derive(Default)]
pub struct DeliveryBatch {
    deliveries: Vec<Delivery>,
}

impl DeliveryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delivery: Delivery) {
        self.deliveries.push(delivery);
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Wait until every delivery resolves. The first failure is returned
    /// once all of them have.
    pub async fn wait(self, timeout: Duration) -> Result<(), PublishError> {
        if self.deliveries.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let count = self.deliveries.len();
        let results = tokio::time::timeout(timeout, join_all(self.deliveries))
            .await
            .map_err(|_| PublishError::FlushTimeout(timeout))?;

        metrics::histogram!(PUBLISHER_FLUSH_DURATION_MS)
            .record(started.elapsed().as_millis() as f64);
        debug!(count, "Deliveries acknowledged");

        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}

/// Publisher for derived events (replay actions, billing outcomes).
///
/// `publish` only enqueues. Callers that need the broker to hold the message
/// before they report success await the returned [`Delivery`].
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<Delivery, PublishError>;
}

/// Kafka-backed publisher. Constructed once by the service and shared by
/// every committer.
pub struct KafkaPublisher {
    producer: FutureProducer,
    closed: AtomicBool,
}

impl KafkaPublisher {
    /// Create the producer and "ping" the brokers by requesting metadata.
    pub async fn connect(config: &KafkaConfig) -> Result<Self, PublishError> {
        let client_config = producer_config(config);
        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        let ping = producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            ping.client().fetch_metadata(None, Duration::from_secs(15))
        })
        .await
        .map_err(|_| PublishError::Canceled)?;

        match metadata {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        Ok(Self {
            producer,
            closed: AtomicBool::new(false),
        })
    }

    /// Block until every message queued in the producer, from any caller, is
    /// acknowledged or `timeout` passes.
    pub async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let started = Instant::now();
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|_| PublishError::Canceled)?;
        metrics::histogram!(PUBLISHER_FLUSH_DURATION_MS)
            .record(started.elapsed().as_millis() as f64);
        Ok(flushed?)
    }

    /// Refuse further publishes, then flush what is still queued.
    pub async fn close(&self, timeout: Duration) -> Result<(), PublishError> {
        self.closed.store(true, Ordering::SeqCst);
        self.flush(timeout).await?;
        info!("Kafka publisher closed");
        Ok(())
    }
}

fn acknowledgement(delivery: DeliveryFuture) -> Delivery {
    async move {
        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => {
                error!("Failed to deliver message: {e:#}");
                Err(PublishError::Kafka(e))
            }
            Err(_) => Err(PublishError::Canceled),
        }
    }
    .boxed()
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<Delivery, PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }

        let record: FutureRecord<'_, str, [u8]> = FutureRecord {
            topic,
            key,
            payload: Some(payload.as_slice()),
            timestamp: None,
            partition: None,
            headers: None,
        };

        match self.producer.send_result(record) {
            Ok(delivery) => {
                metrics::counter!(PUBLISHER_MESSAGES, "topic" => topic.to_string(), "status" => "enqueued")
                    .increment(1);
                Ok(acknowledgement(delivery))
            }
            Err((e, _)) => {
                metrics::counter!(PUBLISHER_MESSAGES, "topic" => topic.to_string(), "status" => "failed")
                    .increment(1);
                Err(e.into())
            }
        }
    }
}
