use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::commit::BatchCommitter;
use crate::recording::ProcessedRecordingMessage;
use crate::runtime::{BufferedItem, FlushPolicy, Model};

/// Count, size and age limits. Any one of them being reached triggers a flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushThresholds {
    pub max_length: usize,
    pub max_bytes: usize,
    /// Longest time an item may sit in the buffer.
    pub max_wait: Duration,
}

impl FlushThresholds {
    pub fn is_met<T: BufferedItem>(&self, model: &Model<T>) -> bool {
        if model.is_empty() {
            return false;
        }
        model.len() >= self.max_length
            || model.buffer_bytes() >= self.max_bytes
            || model.buffer_age() >= self.max_wait
    }
}

impl BufferedItem for ProcessedRecordingMessage {
    fn byte_size(&self) -> usize {
        self.size()
    }
}

/// Flushes recording segments through a [`BatchCommitter`].
pub struct CommitterFlushPolicy {
    thresholds: FlushThresholds,
    committer: Arc<dyn BatchCommitter>,
}

impl CommitterFlushPolicy {
    pub fn new(thresholds: FlushThresholds, committer: Arc<dyn BatchCommitter>) -> Self {
        Self {
            thresholds,
            committer,
        }
    }
}

#[async_trait]
impl FlushPolicy<ProcessedRecordingMessage> for CommitterFlushPolicy {
    fn can_flush(&self, model: &Model<ProcessedRecordingMessage>) -> bool {
        self.thresholds.is_met(model)
    }

    async fn do_flush(&self, model: &Model<ProcessedRecordingMessage>) -> Result<()> {
        self.committer.commit(model.buffer()).await?;
        Ok(())
    }
}
