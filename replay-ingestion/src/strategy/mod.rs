//! Per-message fan-out with in-order, throttled offset commits.
//!
//! Each submitted message becomes a task on a [`BoundedExecutor`]. Tasks are
//! tracked in submission order and only ever retired from the front of the
//! queue, so an offset is never committed before the offsets of every earlier
//! message, however the tasks finish.

pub mod executor;
pub mod throttle;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::commit::BatchCommitter;
use crate::kafka::consumer::{ConsumerError, OffsetCommitter};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{PartitionOffset, RawMessage};
use crate::metrics_consts::{
    MESSAGES_DROPPED, OFFSET_COMMIT_ERRORS, POOL_IN_FLIGHT, POOL_JOIN_ABANDONED,
    POOL_MESSAGES_REJECTED, POOL_TASK_FAILURES,
};
use crate::recording::parse_recording_message;

pub use executor::BoundedExecutor;
pub use throttle::CommitThrottle;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("strategy is closed")]
    Closed,
    #[error("queue is full ({0} in flight)")]
    MessageRejected(usize),
    #[error("offset commit failed: {0}")]
    Commit(#[from] ConsumerError),
}

/// Work done for one message on the pool.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: RawMessage) -> Result<()>;
}

/// Parses a recording segment and commits it on its own.
pub struct RecordingMessageHandler {
    committer: Arc<dyn BatchCommitter>,
}

impl RecordingMessageHandler {
    pub fn new(committer: Arc<dyn BatchCommitter>) -> Self {
        Self { committer }
    }
}

#[async_trait]
impl MessageHandler for RecordingMessageHandler {
    async fn handle(&self, message: RawMessage) -> Result<()> {
        let processed = match parse_recording_message(&message.payload) {
            Ok(processed) => processed,
            Err(e) => {
                warn!(
                    partition = message.position.partition_number(),
                    offset = message.position.offset(),
                    "Dropping unparseable message: {e:#}"
                );
                metrics::counter!(MESSAGES_DROPPED).increment(1);
                return Ok(());
            }
        };

        self.committer
            .commit(std::slice::from_ref(&processed))
            .await
            .with_context(|| format!("failed to commit segment {}", processed.filename))
    }
}

pub struct ProcessPoolStrategy {
    executor: BoundedExecutor,
    handler: Arc<dyn MessageHandler>,
    committer: Arc<dyn OffsetCommitter>,
    queue: VecDeque<(PartitionOffset, JoinHandle<Result<()>>)>,
    /// Tasks given up on by `join`. Their offsets are never committed, but
    /// teardown still waits for or aborts them.
    abandoned: Vec<(PartitionOffset, JoinHandle<Result<()>>)>,
    max_queue_depth: usize,
    pending: OffsetTracker,
    throttle: CommitThrottle,
    closed: bool,
}

impl ProcessPoolStrategy {
    pub fn new(
        executor: BoundedExecutor,
        handler: Arc<dyn MessageHandler>,
        committer: Arc<dyn OffsetCommitter>,
        max_queue_depth: usize,
        commit_interval: Duration,
    ) -> Self {
        info!(
            workers = executor.workers(),
            max_queue_depth, "Starting process pool strategy"
        );
        Self {
            executor,
            handler,
            committer,
            queue: VecDeque::new(),
            abandoned: Vec::new(),
            max_queue_depth: max_queue_depth.max(1),
            pending: OffsetTracker::default(),
            throttle: CommitThrottle::new(commit_interval),
            closed: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Tasks abandoned by `join` that have not been torn down yet.
    pub fn abandoned(&self) -> usize {
        self.abandoned.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue `message` for processing. When the queue is full the message is
    /// handed back so the caller can poll and retry.
    pub fn submit(&mut self, message: RawMessage) -> Result<(), (StrategyError, RawMessage)> {
        if self.closed {
            return Err((StrategyError::Closed, message));
        }
        if self.queue.len() >= self.max_queue_depth {
            metrics::counter!(POOL_MESSAGES_REJECTED).increment(1);
            return Err((StrategyError::MessageRejected(self.queue.len()), message));
        }

        let position = message.position.clone();
        let handler = self.handler.clone();
        let handle = self
            .executor
            .spawn(async move { handler.handle(message).await });
        self.queue.push_back((position, handle));
        metrics::gauge!(POOL_IN_FLIGHT).set(self.queue.len() as f64);
        Ok(())
    }

    /// Retire finished tasks from the front of the queue and commit their
    /// offsets if the throttle allows. Never waits on a task.
    pub async fn poll(&mut self) -> Result<(), StrategyError> {
        while self
            .queue
            .front()
            .is_some_and(|(_, handle)| handle.is_finished())
        {
            let Some((position, handle)) = self.queue.pop_front() else {
                break;
            };
            match handle.now_or_never() {
                Some(result) => log_task_result(&position, result),
                None => warn!(
                    offset = position.offset(),
                    "Finished task had no result, advancing past it"
                ),
            }
            self.pending.merge(&position);
        }
        metrics::gauge!(POOL_IN_FLIGHT).set(self.queue.len() as f64);

        if self.throttle.should_commit() {
            self.commit_pending().await?;
        }
        Ok(())
    }

    /// Commit everything retired so far, regardless of the throttle.
    pub async fn commit_pending(&mut self) -> Result<(), StrategyError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let offsets = self.pending.take();
        if let Err(e) = self.committer.commit(&offsets).await {
            metrics::counter!(OFFSET_COMMIT_ERRORS).increment(1);
            // Keep the offsets so the next attempt covers them
            self.pending.extend(offsets);
            return Err(e.into());
        }
        self.throttle.mark();
        Ok(())
    }

    /// Drain the queue in order until `timeout`, committing as tasks finish.
    /// Whatever is still running at the deadline is abandoned uncommitted and
    /// will be consumed again after a restart.
    pub async fn join(&mut self, timeout: Duration) -> Result<(), StrategyError> {
        self.commit_pending().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while let Some((position, mut handle)) = self.queue.pop_front() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(result) => {
                    log_task_result(&position, result);
                    self.pending.merge(&position);
                    self.commit_pending().await?;
                }
                Err(_) => {
                    self.abandoned.push((position, handle));
                    self.abandoned.extend(self.queue.drain(..));
                    warn!(
                        abandoned = self.abandoned.len(),
                        first_offset = self.abandoned[0].0.offset(),
                        "Join timed out, abandoning in-flight messages without committing"
                    );
                    metrics::counter!(POOL_JOIN_ABANDONED).increment(self.abandoned.len() as u64);
                    break;
                }
            }
        }
        metrics::gauge!(POOL_IN_FLIGHT).set(self.queue.len() as f64);
        Ok(())
    }

    /// Stop accepting messages and wait for every task, abandoned ones
    /// included, to finish.
    pub async fn close(&mut self) {
        self.closed = true;
        while let Some((position, handle)) = self.queue.pop_front() {
            log_task_result(&position, handle.await);
        }
        for (position, handle) in self.abandoned.drain(..) {
            log_task_result(&position, handle.await);
        }
        info!("Process pool strategy closed");
    }

    /// Like `close`, but aborts every task first.
    pub async fn terminate(&mut self) {
        self.closed = true;
        let tasks: Vec<_> = self.queue.drain(..).chain(self.abandoned.drain(..)).collect();
        for (_, handle) in &tasks {
            handle.abort();
        }
        for (_, handle) in tasks {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Task failed during terminate: {e:#}");
                }
            }
        }
        info!("Process pool strategy terminated");
    }
}

fn log_task_result(position: &PartitionOffset, result: Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(
                partition = position.partition_number(),
                offset = position.offset(),
                "Message processing failed: {e:#}"
            );
            metrics::counter!(POOL_TASK_FAILURES, "reason" => "error").increment(1);
        }
        Err(e) => {
            error!(
                partition = position.partition_number(),
                offset = position.offset(),
                "Message task panicked or was cancelled: {e:#}"
            );
            metrics::counter!(POOL_TASK_FAILURES, "reason" => "join").increment(1);
        }
    }
}
