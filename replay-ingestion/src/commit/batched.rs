use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{error, info, warn};

use crate::commit::{record_recording_metadata, BatchCommitter, CommitContext, CommitError};
use crate::kafka::producer::DeliveryBatch;
use crate::metrics_consts::{COMMIT_DURATION_MS, COMMIT_ERRORS, MERGED_BUFFER_BYTES};
use crate::recording::keys::make_merged_filename;
use crate::recording::ProcessedRecordingMessage;
use crate::storage::{FilePart, FilePartRow};

/// A batch of segments concatenated into one blob.
///
/// Segment boundaries only exist in `rows`; the blob itself is raw
/// concatenated bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedBuffer {
    pub buffer: Bytes,
    pub rows: Vec<FilePartRow>,
    pub remote_key: String,
    /// Longest retention in the batch, so the blob outlives every segment in it.
    pub retention_days: i64,
}

impl MergedBuffer {
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Concatenate the batch, recording each segment's inclusive byte range.
pub fn merge_buffer(messages: &[ProcessedRecordingMessage]) -> MergedBuffer {
    let total: usize = messages.iter().map(ProcessedRecordingMessage::size).sum();
    let mut buffer = BytesMut::with_capacity(total);
    let mut rows = Vec::with_capacity(messages.len());
    let mut retention_days = 0;

    for message in messages {
        if message.filedata.is_empty() {
            warn!(key = message.filename, "Skipping empty segment in merged buffer");
            continue;
        }
        let range_start = buffer.len() as u64;
        buffer.extend_from_slice(&message.filedata);
        rows.push(FilePartRow {
            key: message.filename.clone(),
            range_start,
            range_stop: buffer.len() as u64 - 1,
        });
        retention_days = retention_days.max(message.retention_days);
    }

    let buffer = buffer.freeze();
    let remote_key = make_merged_filename(retention_days, &buffer);
    MergedBuffer {
        buffer,
        rows,
        remote_key,
        retention_days,
    }
}

/// One blob per batch plus a file-part row per segment.
pub struct BatchedCommitter {
    context: Arc<CommitContext>,
}

impl BatchedCommitter {
    pub fn new(context: Arc<CommitContext>) -> Self {
        Self { context }
    }

    /// Write the merged blob once, then the rows pointing into it.
    pub async fn commit_merged_buffer(&self, merged: &MergedBuffer) -> Result<(), CommitError> {
        if merged.is_empty() {
            return Ok(());
        }

        self.context
            .blobs
            .set(&merged.remote_key, merged.buffer.clone())
            .await?;
        metrics::histogram!(MERGED_BUFFER_BYTES).record(merged.buffer.len() as f64);

        let parts = merged
            .rows
            .iter()
            .map(|row| FilePart::from_row(row, &merged.remote_key, merged.retention_days))
            .collect();
        self.context.file_parts.bulk_insert(parts).await?;
        Ok(())
    }

    pub async fn bulk_track_initial_segment_events(
        &self,
        messages: &[ProcessedRecordingMessage],
        deliveries: &mut DeliveryBatch,
    ) -> Result<usize, CommitError> {
        let mut billed = 0;
        for message in messages {
            if self
                .context
                .track_initial_segment_event(message, deliveries)
                .await?
            {
                billed += 1;
            }
        }
        Ok(billed)
    }

    /// Publish every actions event, then wait until the broker holds them
    /// (and the batch's billing outcomes) before the batch counts as committed.
    pub async fn bulk_emit_action_events(
        &self,
        messages: &[ProcessedRecordingMessage],
        mut deliveries: DeliveryBatch,
    ) -> Result<usize, CommitError> {
        let mut emitted = 0;
        for message in messages {
            if self
                .context
                .emit_actions_event(message, &mut deliveries)
                .await?
            {
                emitted += 1;
            }
        }
        self.context.wait_for_deliveries(deliveries).await?;
        Ok(emitted)
    }

    async fn run_phases(&self, messages: &[ProcessedRecordingMessage]) -> Result<(), CommitError> {
        let merged = merge_buffer(messages);
        self.commit_merged_buffer(&merged).await?;
        let mut deliveries = DeliveryBatch::new();
        let billed = self
            .bulk_track_initial_segment_events(messages, &mut deliveries)
            .await?;
        let emitted = self.bulk_emit_action_events(messages, deliveries).await?;

        info!(
            segments = merged.rows.len(),
            bytes = merged.buffer.len(),
            remote_key = merged.remote_key,
            billed,
            emitted,
            "Committed merged buffer"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchCommitter for BatchedCommitter {
    async fn commit(&self, messages: &[ProcessedRecordingMessage]) -> Result<(), CommitError> {
        if messages.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        if let Err(e) = self.run_phases(messages).await {
            error!(total = messages.len(), "Batched commit failed: {e:#}");
            metrics::counter!(COMMIT_ERRORS, "strategy" => "batched").increment(1);
            return Err(e);
        }

        for message in messages {
            record_recording_metadata(message);
        }
        metrics::histogram!(COMMIT_DURATION_MS, "strategy" => "batched")
            .record(started.elapsed().as_millis() as f64);
        Ok(())
    }
}
