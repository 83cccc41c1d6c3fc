//! Buffered consumer runtime.
//!
//! A message-driven state machine: the driver feeds every broker message
//! through [`BufferedRuntime::process`], hands the resulting [`Msg`] to
//! [`BufferedRuntime::update`] and executes whatever [`Cmd`] comes back. A
//! periodic [`BufferedRuntime::subscription`] tick bounds flush latency when
//! traffic is low.
//!
//! Offsets only leave the runtime inside a [`Cmd::Commit`], which is produced
//! after the flush policy has durably written the buffer.

pub mod policy;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::kafka::offset_tracker::{OffsetTracker, Offsets};
use crate::kafka::types::{PartitionOffset, RawMessage};
use crate::metrics_consts::{
    BUFFER_FLUSHES, BUFFER_FLUSH_BYTES, BUFFER_FLUSH_DURATION_MS, BUFFER_FLUSH_ITEMS,
    MESSAGES_DROPPED, MESSAGES_RECEIVED,
};

pub use policy::{CommitterFlushPolicy, FlushThresholds};

/// Anything the runtime can buffer.
pub trait BufferedItem: Send + Sync {
    /// Bytes the item holds in memory, used for size-based flushing.
    fn byte_size(&self) -> usize;
}

/// Runtime state. Created once by `init` and mutated in place by `update`.
#[derive(Debug)]
pub struct Model<T> {
    buffer: Vec<T>,
    buffer_bytes: usize,
    offsets: OffsetTracker,
    oldest_item_at: Option<tokio::time::Instant>,
}

impl<T: BufferedItem> Model<T> {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            buffer_bytes: 0,
            offsets: OffsetTracker::default(),
            oldest_item_at: None,
        }
    }

    /// Items in arrival order.
    pub fn buffer(&self) -> &[T] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn offsets(&self) -> &OffsetTracker {
        &self.offsets
    }

    /// How long the oldest buffered item has been waiting.
    pub fn buffer_age(&self) -> std::time::Duration {
        self.oldest_item_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn append(&mut self, item: T, offset: &PartitionOffset) {
        self.oldest_item_at
            .get_or_insert_with(tokio::time::Instant::now);
        self.buffer_bytes += item.byte_size();
        self.buffer.push(item);
        self.offsets.merge(offset);
    }

    /// Clear the buffer and hand back the offsets of everything that was in it.
    fn reset(&mut self) -> Offsets {
        self.buffer.clear();
        self.buffer_bytes = 0;
        self.oldest_item_at = None;
        self.offsets.take()
    }
}

/// Input to `update`.
#[derive(Debug)]
pub enum Msg<T> {
    Append { item: T, offset: PartitionOffset },
    Flush,
    Committed,
}

/// Output of `update`, executed by the driver.
#[derive(Debug)]
pub enum Cmd<T> {
    /// Feed the message straight back into `update`.
    Task(Msg<T>),
    /// Commit `offsets` to the broker, then feed `msg` back into `update`.
    Commit { msg: Msg<T>, offsets: Offsets },
}

/// When to flush and how.
#[async_trait]
pub trait FlushPolicy<T>: Send + Sync {
    fn can_flush(&self, model: &Model<T>) -> bool;

    /// Durably write the buffered items. An error here is fatal for the runtime.
    async fn do_flush(&self, model: &Model<T>) -> Result<()>;
}

pub type ProcessFn<T> = Box<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

pub struct BufferedRuntime<T> {
    policy: Arc<dyn FlushPolicy<T>>,
    process_fn: ProcessFn<T>,
}

impl<T: BufferedItem + 'static> BufferedRuntime<T> {
    pub fn new(policy: Arc<dyn FlushPolicy<T>>, process_fn: ProcessFn<T>) -> Self {
        Self { policy, process_fn }
    }

    pub fn init(&self) -> (Model<T>, Option<Cmd<T>>) {
        (Model::new(), None)
    }

    /// Parse one broker message. Unparseable messages are dropped and their
    /// offset is not recorded.
    pub fn process(&self, message: &RawMessage) -> Option<Msg<T>> {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);
        match (self.process_fn)(&message.payload) {
            Ok(item) => Some(Msg::Append {
                item,
                offset: message.position.clone(),
            }),
            Err(e) => {
                warn!(
                    topic = message.position.topic(),
                    partition = message.position.partition_number(),
                    offset = message.position.offset(),
                    "Dropping unparseable message: {e:#}"
                );
                metrics::counter!(MESSAGES_DROPPED).increment(1);
                None
            }
        }
    }

    pub async fn update(&self, model: &mut Model<T>, msg: Msg<T>) -> Result<Option<Cmd<T>>> {
        match msg {
            Msg::Append { item, offset } => {
                model.append(item, &offset);
                if self.policy.can_flush(model) {
                    Ok(Some(Cmd::Task(Msg::Flush)))
                } else {
                    Ok(None)
                }
            }
            Msg::Flush => {
                let started = Instant::now();
                let items = model.len();
                let bytes = model.buffer_bytes();

                self.policy
                    .do_flush(model)
                    .await
                    .with_context(|| format!("flush of {items} buffered items failed"))?;

                let offsets = model.reset();
                metrics::counter!(BUFFER_FLUSHES).increment(1);
                metrics::histogram!(BUFFER_FLUSH_ITEMS).record(items as f64);
                metrics::histogram!(BUFFER_FLUSH_BYTES).record(bytes as f64);
                metrics::histogram!(BUFFER_FLUSH_DURATION_MS)
                    .record(started.elapsed().as_millis() as f64);
                info!(items, bytes, partitions = offsets.len(), "Flushed buffer");

                Ok(Some(Cmd::Commit {
                    msg: Msg::Committed,
                    offsets,
                }))
            }
            Msg::Committed => Ok(None),
        }
    }

    /// Time-driven flush check.
    pub fn subscription(&self, model: &Model<T>) -> Option<Msg<T>> {
        if self.policy.can_flush(model) {
            Some(Msg::Flush)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;
    use crate::kafka::types::Partition;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(String);

    impl BufferedItem for Item {
        fn byte_size(&self) -> usize {
            self.0.len()
        }
    }

    struct TestPolicy {
        thresholds: FlushThresholds,
        flushed: Mutex<Vec<Vec<Item>>>,
        fail: AtomicBool,
    }

    impl TestPolicy {
        fn new(max_length: usize, max_wait: Duration) -> Arc<Self> {
            Arc::new(Self {
                thresholds: FlushThresholds {
                    max_length,
                    max_bytes: usize::MAX,
                    max_wait,
                },
                flushed: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl FlushPolicy<Item> for TestPolicy {
        fn can_flush(&self, model: &Model<Item>) -> bool {
            self.thresholds.is_met(model)
        }

        async fn do_flush(&self, model: &Model<Item>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("blob store unavailable"));
            }
            self.flushed.lock().unwrap().push(model.buffer().to_vec());
            Ok(())
        }
    }

    fn runtime(policy: Arc<TestPolicy>) -> BufferedRuntime<Item> {
        BufferedRuntime::new(
            policy,
            Box::new(|payload: &[u8]| -> Result<Item> {
                let text = std::str::from_utf8(payload)?;
                if text.is_empty() {
                    return Err(anyhow!("empty message"));
                }
                Ok(Item(text.to_string()))
            }),
        )
    }

    fn raw(payload: &str, partition: i32, offset: i64) -> RawMessage {
        RawMessage::new(
            payload.as_bytes().to_vec(),
            PartitionOffset::new(Partition::new("recordings".to_string(), partition), offset),
        )
    }

    async fn feed(
        runtime: &BufferedRuntime<Item>,
        model: &mut Model<Item>,
        message: RawMessage,
    ) -> Option<Cmd<Item>> {
        let msg = runtime.process(&message)?;
        runtime.update(model, msg).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_preserves_order_and_last_offsets() {
        let runtime = runtime(TestPolicy::new(100, Duration::from_secs(60)));
        let (mut model, cmd) = runtime.init();
        assert!(cmd.is_none());

        for (payload, partition, offset) in [("a", 0, 10), ("b", 1, 3), ("c", 0, 11), ("d", 1, 4)] {
            assert!(feed(&runtime, &mut model, raw(payload, partition, offset)).await.is_none());
        }

        let items: Vec<&str> = model.buffer().iter().map(|i| i.0.as_str()).collect();
        assert_eq!(items, vec!["a", "b", "c", "d"]);

        let offsets = model.offsets();
        assert_eq!(offsets.get(&Partition::new("recordings".to_string(), 0)), Some(12));
        assert_eq!(offsets.get(&Partition::new("recordings".to_string(), 1)), Some(5));
        assert_eq!(model.buffer_bytes(), 4);
    }

    #[tokio::test]
    async fn test_flush_clears_buffer_and_commits_accumulated_offsets() {
        let policy = TestPolicy::new(2, Duration::from_secs(60));
        let runtime = runtime(policy.clone());
        let (mut model, _) = runtime.init();

        assert!(feed(&runtime, &mut model, raw("a", 0, 1)).await.is_none());
        let cmd = feed(&runtime, &mut model, raw("b", 2, 7)).await;
        assert!(matches!(cmd, Some(Cmd::Task(Msg::Flush))));

        let cmd = runtime.update(&mut model, Msg::Flush).await.unwrap();
        let Some(Cmd::Commit { msg, offsets }) = cmd else {
            panic!("expected a commit command");
        };
        assert!(matches!(msg, Msg::Committed));
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[&Partition::new("recordings".to_string(), 0)], 2);
        assert_eq!(offsets[&Partition::new("recordings".to_string(), 2)], 8);

        assert!(model.is_empty());
        assert!(model.offsets().is_empty());
        assert_eq!(model.buffer_bytes(), 0);
        assert_eq!(
            policy.flushed.lock().unwrap().clone(),
            vec![vec![Item("a".to_string()), Item("b".to_string())]]
        );

        assert!(runtime.update(&mut model, msg).await.unwrap().is_none());

        // The next flush only carries what arrived after the previous one
        feed(&runtime, &mut model, raw("c", 0, 2)).await;
        feed(&runtime, &mut model, raw("d", 0, 3)).await;
        let flushed = runtime.update(&mut model, Msg::Flush).await.unwrap();
        let Some(Cmd::Commit { offsets, .. }) = flushed else {
            panic!("expected a commit command");
        };
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[&Partition::new("recordings".to_string(), 0)], 4);
    }

    #[tokio::test]
    async fn test_flush_failure_propagates_and_keeps_buffer() {
        let policy = TestPolicy::new(1, Duration::from_secs(60));
        policy.fail.store(true, Ordering::SeqCst);
        let runtime = runtime(policy.clone());
        let (mut model, _) = runtime.init();

        feed(&runtime, &mut model, raw("a", 0, 1)).await;
        let result = runtime.update(&mut model, Msg::Flush).await;

        assert!(result.is_err());
        assert_eq!(model.len(), 1);
        assert!(!model.offsets().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_message_is_dropped_without_offset() {
        let runtime = runtime(TestPolicy::new(10, Duration::from_secs(60)));
        let (model, _) = runtime.init();

        assert!(runtime.process(&raw("", 0, 5)).is_none());
        assert!(model.is_empty());
        assert!(model.offsets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_flushes_after_max_wait() {
        let runtime = runtime(TestPolicy::new(100, Duration::from_secs(1)));
        let (mut model, _) = runtime.init();

        // Nothing buffered, nothing to flush no matter how long we wait
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(runtime.subscription(&model).is_none());

        feed(&runtime, &mut model, raw("a", 0, 1)).await;
        assert!(runtime.subscription(&model).is_none());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(matches!(runtime.subscription(&model), Some(Msg::Flush)));
    }
}
