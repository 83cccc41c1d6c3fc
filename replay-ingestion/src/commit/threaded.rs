use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use tracing::{error, warn};

use crate::commit::{record_recording_metadata, BatchCommitter, CommitContext, CommitError};
use crate::kafka::producer::DeliveryBatch;
use crate::metrics_consts::{COMMIT_DURATION_MS, COMMIT_ERRORS, COMMIT_WORKERS};
use crate::recording::ProcessedRecordingMessage;

/// Concurrency used for a batch of `messages`.
pub fn worker_count(messages: usize, max_workers: usize) -> usize {
    messages.min(max_workers)
}

/// One blob per segment, written concurrently.
pub struct ThreadedCommitter {
    context: Arc<CommitContext>,
    max_workers: usize,
}

impl ThreadedCommitter {
    pub fn new(context: Arc<CommitContext>, max_workers: usize) -> Self {
        Self {
            context,
            max_workers: max_workers.max(1),
        }
    }

    /// Write one segment and wait for the events it produced.
    async fn commit_message(&self, message: &ProcessedRecordingMessage) -> Result<(), CommitError> {
        if message.filedata.is_empty() {
            warn!(key = message.filename, "Skipping blob write for empty segment");
        } else {
            self.context
                .blobs
                .set(&message.filename, message.filedata.clone())
                .await?;
        }

        let mut deliveries = DeliveryBatch::new();
        self.context
            .track_initial_segment_event(message, &mut deliveries)
            .await?;
        self.context
            .emit_actions_event(message, &mut deliveries)
            .await?;
        self.context.wait_for_deliveries(deliveries).await
    }
}

#[async_trait]
impl BatchCommitter for ThreadedCommitter {
    async fn commit(&self, messages: &[ProcessedRecordingMessage]) -> Result<(), CommitError> {
        if messages.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let workers = worker_count(messages.len(), self.max_workers);
        metrics::gauge!(COMMIT_WORKERS).set(workers as f64);

        // Every task runs to completion before a failure is reported
        let tasks: Vec<_> = messages
            .iter()
            .map(|message| self.commit_message(message).boxed())
            .collect();
        let results: Vec<Result<(), CommitError>> = stream::iter(tasks)
            .buffered(workers)
            .collect()
            .await;

        let failures = results.iter().filter(|r| r.is_err()).count();
        if let Some(e) = results.into_iter().find_map(Result::err) {
            error!(failures, total = messages.len(), "Threaded commit failed: {e:#}");
            metrics::counter!(COMMIT_ERRORS, "strategy" => "threaded").increment(1);
            return Err(e);
        }

        for message in messages {
            record_recording_metadata(message);
        }
        metrics::histogram!(COMMIT_DURATION_MS, "strategy" => "threaded")
            .record(started.elapsed().as_millis() as f64);
        Ok(())
    }
}
