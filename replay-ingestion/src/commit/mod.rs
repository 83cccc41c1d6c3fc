//! Batch committers.
//!
//! A committer durably writes a flushed batch of recording segments and emits
//! their side effects (billing outcomes, click actions). When `commit` returns
//! `Ok` every blob is written and every derived event has been acknowledged by
//! the broker, so the caller may commit offsets.

pub mod batched;
pub mod threaded;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::billing::{BillableSegment, BillingDecider, BillingOutcome};
use crate::config::CommitStrategy;
use crate::kafka::producer::{DeliveryBatch, EventPublisher, PublishError};
use crate::metrics_consts::{
    BILLING_OUTCOMES, RECORDING_DEAD_CLICKS, RECORDING_RAGE_CLICKS, RECORDING_SEGMENTS,
    RECORDING_SEGMENT_BYTES, RECORDING_UNCOMPRESSED_BYTES,
};
use crate::recording::ProcessedRecordingMessage;
use crate::storage::{BlobStore, BlobStoreError, FilePartStore, FilePartStoreError};

pub use batched::{merge_buffer, BatchedCommitter, MergedBuffer};
pub use threaded::{worker_count, ThreadedCommitter};

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("blob write failed: {0}")]
    Blob(#[from] BlobStoreError),
    #[error("file part write failed: {0}")]
    FileParts(#[from] FilePartStoreError),
    #[error("event publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait BatchCommitter: Send + Sync {
    async fn commit(&self, messages: &[ProcessedRecordingMessage]) -> Result<(), CommitError>;
}

/// Collaborators shared by both committers.
pub struct CommitContext {
    pub blobs: Arc<dyn BlobStore>,
    pub file_parts: Arc<dyn FilePartStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub billing: Arc<dyn BillingDecider>,
    pub actions_topic: String,
    pub outcomes_topic: String,
    pub publisher_flush_timeout: Duration,
}

impl CommitContext {
    /// Publish an accepted outcome if the segment is billable.
    pub async fn track_initial_segment_event(
        &self,
        message: &ProcessedRecordingMessage,
        deliveries: &mut DeliveryBatch,
    ) -> Result<bool, CommitError> {
        let segment = BillableSegment::from(message);
        if !self.billing.is_billable_segment(&segment) {
            return Ok(false);
        }

        let payload = serde_json::to_vec(&BillingOutcome::accepted(&segment))?;
        let delivery = self
            .publisher
            .publish(&self.outcomes_topic, Some(&message.replay_id), payload)
            .await?;
        deliveries.push(delivery);
        metrics::counter!(BILLING_OUTCOMES).increment(1);
        Ok(true)
    }

    /// Publish the segment's click actions, if it has any.
    pub async fn emit_actions_event(
        &self,
        message: &ProcessedRecordingMessage,
        deliveries: &mut DeliveryBatch,
    ) -> Result<bool, CommitError> {
        let Some(actions) = &message.actions_event else {
            return Ok(false);
        };

        let payload = actions.to_payload()?;
        let delivery = self
            .publisher
            .publish(&self.actions_topic, Some(&message.replay_id), payload)
            .await?;
        deliveries.push(delivery);
        Ok(true)
    }

    /// Wait until the broker holds every event in `deliveries`.
    pub async fn wait_for_deliveries(&self, deliveries: DeliveryBatch) -> Result<(), CommitError> {
        deliveries.wait(self.publisher_flush_timeout).await?;
        Ok(())
    }
}

/// Per-segment metrics, emitted after the batch is durable.
pub fn record_recording_metadata(message: &ProcessedRecordingMessage) {
    let kind = if message.is_replay_video {
        "video"
    } else {
        "recording"
    };
    metrics::counter!(RECORDING_SEGMENTS, "kind" => kind).increment(1);
    metrics::histogram!(RECORDING_SEGMENT_BYTES, "kind" => kind).record(message.size() as f64);
    metrics::histogram!(RECORDING_UNCOMPRESSED_BYTES).record(message.uncompressed_size as f64);

    if let Some(actions) = &message.actions_event {
        metrics::counter!(RECORDING_DEAD_CLICKS).increment(actions.dead_click_count() as u64);
        metrics::counter!(RECORDING_RAGE_CLICKS).increment(actions.rage_click_count() as u64);
    }

    debug!(
        replay_id = %message.replay_id,
        segment_id = message.segment_id,
        project_id = message.project_id,
        size = message.size(),
        "Recorded replay segment"
    );
}

pub fn build_committer(
    strategy: CommitStrategy,
    context: Arc<CommitContext>,
    max_workers: usize,
) -> Arc<dyn BatchCommitter> {
    match strategy {
        CommitStrategy::Threaded => Arc::new(ThreadedCommitter::new(context, max_workers)),
        CommitStrategy::Batched => Arc::new(BatchedCommitter::new(context)),
    }
}
