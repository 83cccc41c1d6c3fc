use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::billing::InitialSegmentBilling;
use crate::commit::{build_committer, BatchCommitter, CommitContext};
use crate::config::{Config, ConsumerVariant};
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::consumer::RecordingConsumer;
use crate::kafka::driver::{run_buffered, run_process_pool};
use crate::kafka::producer::KafkaPublisher;
use crate::recording::{parse_recording_message, ProcessedRecordingMessage};
use crate::runtime::{BufferedRuntime, CommitterFlushPolicy, FlushThresholds};
use crate::storage::postgres::PgFilePartStore;
use crate::storage::s3::S3BlobStore;
use crate::storage::{BlobStore, FilePartStore, MemoryFilePartStore};
use crate::strategy::{BoundedExecutor, ProcessPoolStrategy, RecordingMessageHandler};

/// Recording ingestion service: one consumer, one committer and the driver
/// loop selected by `CONSUMER_VARIANT`.
pub struct ReplayIngestionService {
    config: Config,
    consumer: Arc<RecordingConsumer>,
    publisher: Arc<KafkaPublisher>,
    committer: Arc<dyn BatchCommitter>,
}

impl ReplayIngestionService {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for consumer topic '{}' and group '{}'",
                config.kafka.kafka_consumer_topic, config.kafka.kafka_consumer_group
            )
        })?;

        let blobs: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(&config).await);
        let file_parts = file_part_store(&config).await?;

        let publisher = Arc::new(
            KafkaPublisher::connect(&config.kafka)
                .await
                .context("Failed to connect the event publisher")?,
        );

        let context = Arc::new(CommitContext {
            blobs,
            file_parts,
            publisher: publisher.clone(),
            billing: Arc::new(InitialSegmentBilling),
            actions_topic: config.kafka.kafka_actions_topic.clone(),
            outcomes_topic: config.kafka.kafka_outcomes_topic.clone(),
            publisher_flush_timeout: config.publisher_flush_timeout(),
        });
        let committer = build_committer(config.commit_strategy, context, config.max_commit_workers);

        let consumer_config = ConsumerConfigBuilder::new(
            &config.kafka.kafka_hosts,
            &config.kafka.kafka_consumer_group,
        )
        .with_tls(config.kafka.kafka_tls)
        .with_offset_reset(&config.kafka.kafka_consumer_offset_reset)
        .with_max_partition_fetch_bytes(config.kafka.kafka_max_partition_fetch_bytes)
        .build();
        let consumer = RecordingConsumer::new(&consumer_config, &config.kafka.kafka_consumer_topic)
            .with_context(|| {
                format!(
                    "Failed to create consumer for topic '{}'",
                    config.kafka.kafka_consumer_topic
                )
            })?;
        let consumer = Arc::new(consumer);

        Ok(Self {
            config,
            consumer,
            publisher,
            committer,
        })
    }

    /// Run until ctrl-c, then drain and close the publisher.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal, shutting down gracefully..."),
                Err(e) => error!("Failed to listen for shutdown signal: {e:#}"),
            }
            signal.cancel();
        });

        self.run_with_shutdown(shutdown).await
    }

    pub async fn run_with_shutdown(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            variant = ?self.config.consumer_variant,
            commit_strategy = ?self.config.commit_strategy,
            topic = self.consumer.topic(),
            "Starting replay ingestion"
        );

        let outcome = match self.config.consumer_variant {
            ConsumerVariant::Buffered => self.run_buffered(shutdown).await,
            ConsumerVariant::ProcessPool => self.run_process_pool(shutdown).await,
        };

        if let Err(e) = self
            .publisher
            .close(self.config.publisher_flush_timeout())
            .await
        {
            warn!("Failed to flush publisher on shutdown: {e:#}");
        }
        outcome
    }

    async fn run_buffered(&self, shutdown: CancellationToken) -> Result<()> {
        let thresholds = FlushThresholds {
            max_length: self.config.max_buffer_length,
            max_bytes: self.config.max_buffer_size_bytes,
            max_wait: self.config.max_buffer_time(),
        };
        let runtime: BufferedRuntime<ProcessedRecordingMessage> = BufferedRuntime::new(
            Arc::new(CommitterFlushPolicy::new(thresholds, self.committer.clone())),
            Box::new(|payload: &[u8]| -> Result<ProcessedRecordingMessage> {
                Ok(parse_recording_message(payload)?)
            }),
        );

        run_buffered(
            &runtime,
            self.consumer.as_ref(),
            self.consumer.as_ref(),
            self.config.subscription_interval(),
            shutdown,
        )
        .await
    }

    async fn run_process_pool(&self, shutdown: CancellationToken) -> Result<()> {
        // Workers commit single segments; the consumer commits offsets
        let mut strategy = ProcessPoolStrategy::new(
            BoundedExecutor::new(self.config.pool_workers()),
            Arc::new(RecordingMessageHandler::new(self.committer.clone())),
            self.consumer.clone(),
            self.config.pool_queue_depth(),
            self.config.commit_throttle(),
        );

        run_process_pool(
            &mut strategy,
            self.consumer.as_ref(),
            self.config.subscription_interval(),
            self.config.join_timeout(),
            shutdown,
        )
        .await
    }
}

async fn file_part_store(config: &Config) -> Result<Arc<dyn FilePartStore>> {
    let Some(database_url) = &config.database_url else {
        warn!("DATABASE_URL is not set, file parts are kept in memory");
        return Ok(Arc::new(MemoryFilePartStore::new()));
    };

    let store = PgFilePartStore::connect(database_url, config.max_pg_connections)
        .await
        .context("Failed to connect to the file parts database")?;
    store
        .migrate()
        .await
        .context("Failed to run file parts migrations")?;
    Ok(Arc::new(store))
}
