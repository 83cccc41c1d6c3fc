use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "ingest-replay-recordings")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "ingest-replay-recordings")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "10485760")] // 10MB, recordings are large
    pub kafka_max_partition_fetch_bytes: u32,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "ingest-replay-actions")]
    pub kafka_actions_topic: String,

    #[envconfig(default = "outcomes")]
    pub kafka_outcomes_topic: String,
}

/// Which consumer drives the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerVariant {
    /// Accumulate segments and flush them as a batch through a committer.
    Buffered,
    /// Commit each segment on a bounded worker pool.
    ProcessPool,
}

impl FromStr for ConsumerVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buffered" => Ok(ConsumerVariant::Buffered),
            "process_pool" | "process-pool" => Ok(ConsumerVariant::ProcessPool),
            other => Err(format!("unknown consumer variant: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    Threaded,
    Batched,
}

impl FromStr for CommitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threaded" => Ok(CommitStrategy::Threaded),
            "batched" => Ok(CommitStrategy::Batched),
            other => Err(format!("unknown commit strategy: {other}")),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "buffered")]
    pub consumer_variant: ConsumerVariant,

    #[envconfig(default = "batched")]
    pub commit_strategy: CommitStrategy,

    // Buffered runtime thresholds; whichever is hit first triggers a flush
    #[envconfig(default = "250")]
    pub max_buffer_length: usize,

    #[envconfig(default = "10000000")] // 10MB
    pub max_buffer_size_bytes: usize,

    #[envconfig(default = "1000")]
    pub max_buffer_time_ms: u64,

    #[envconfig(default = "100")]
    pub max_commit_workers: usize,

    #[envconfig(default = "30")]
    pub publisher_flush_timeout_secs: u64,

    // Process pool strategy
    #[envconfig(default = "1")]
    pub pool_cpu_multiplier: usize,

    #[envconfig(default = "4")]
    pub pool_queue_multiplier: usize,

    #[envconfig(default = "1000")]
    pub commit_throttle_ms: u64,

    #[envconfig(default = "10")]
    pub join_timeout_secs: u64,

    #[envconfig(default = "1000")]
    pub subscription_interval_ms: u64,

    // Blob storage
    #[envconfig(default = "replay-recordings")]
    pub s3_bucket: String,

    #[envconfig(default = "us-east-1")]
    pub s3_region: String,

    pub s3_endpoint: Option<String>,

    pub s3_access_key_id: Option<String>,

    pub s3_secret_access_key: Option<String>,

    // File-part metadata; rows live in memory when unset
    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    // Query backends
    #[envconfig(default = "http://localhost:1218")]
    pub snuba_url: String,

    #[envconfig(default = "http://localhost:1218")]
    pub eap_url: String,

    #[envconfig(default = "50")]
    pub query_default_limit: usize,

    #[envconfig(default = "1000000")]
    pub query_sample_row_cap: u64,

    /// Pre-flight count and sampling of Snuba queries over the row cap.
    #[envconfig(default = "true")]
    pub query_sample: bool,

    /// Rows per request when EAP segments are read back for assembly.
    #[envconfig(default = "1000")]
    pub query_segment_page_size: usize,

    #[envconfig(default = "30")]
    pub query_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_buffer_time(&self) -> Duration {
        Duration::from_millis(self.max_buffer_time_ms)
    }

    pub fn commit_throttle(&self) -> Duration {
        Duration::from_millis(self.commit_throttle_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn subscription_interval(&self) -> Duration {
        Duration::from_millis(self.subscription_interval_ms)
    }

    pub fn publisher_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.publisher_flush_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Worker count of the process pool: CPU count times the multiplier.
    pub fn pool_workers(&self) -> usize {
        num_cpus::get() * self.pool_cpu_multiplier
    }

    /// Bound on submitted-but-uncommitted messages in the process pool.
    pub fn pool_queue_depth(&self) -> usize {
        self.pool_workers() * self.pool_queue_multiplier
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_length == 0 {
            bail!("MAX_BUFFER_LENGTH must be greater than zero");
        }
        if self.max_buffer_size_bytes == 0 {
            bail!("MAX_BUFFER_SIZE_BYTES must be greater than zero");
        }
        if self.max_commit_workers == 0 {
            bail!("MAX_COMMIT_WORKERS must be greater than zero");
        }
        if self.pool_cpu_multiplier == 0 || self.pool_queue_multiplier == 0 {
            bail!("pool multipliers must be greater than zero");
        }
        if self.subscription_interval_ms == 0 {
            bail!("SUBSCRIPTION_INTERVAL_MS must be greater than zero");
        }
        if self.query_sample_row_cap == 0 {
            bail!("QUERY_SAMPLE_ROW_CAP must be greater than zero");
        }
        if self.query_segment_page_size == 0 {
            bail!("QUERY_SEGMENT_PAGE_SIZE must be greater than zero");
        }
        if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
            bail!("S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together");
        }
        Ok(())
    }
}
