//! In-memory collaborators and fixtures shared by unit and integration tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use futures::FutureExt;

use crate::billing::InitialSegmentBilling;
use crate::commit::CommitContext;
use crate::kafka::consumer::{ConsumerError, MessageSource, OffsetCommitter};
use crate::kafka::offset_tracker::Offsets;
use crate::kafka::producer::{Delivery, EventPublisher, PublishError};
use crate::kafka::types::{Partition, RawMessage};
use crate::recording::keys::make_recording_filename;
use crate::recording::message::RECORDING_MESSAGE_TYPE;
use crate::recording::{
    ProcessedRecordingMessage, RecordingEnvelope, ReplayActionsEvent, ReplayClick,
};
use crate::storage::{BlobStore, FilePartStore};

pub use crate::storage::{MemoryBlobStore, MemoryFilePartStore};

pub const TEST_ACTIONS_TOPIC: &str = "replay-actions";
pub const TEST_OUTCOMES_TOPIC: &str = "outcomes";

/// Msgpack-encode a recording segment the way upstream ingestion does.
pub fn encode_recording_envelope(
    replay_id: &str,
    segment_id: u32,
    body: &[u8],
    video: Option<&[u8]>,
) -> Vec<u8> {
    let mut payload = format!("{{\"segment_id\":{segment_id}}}\n").into_bytes();
    payload.extend_from_slice(body);

    let envelope = RecordingEnvelope {
        kind: RECORDING_MESSAGE_TYPE.to_string(),
        replay_id: replay_id.to_string(),
        key_id: Some(3),
        org_id: 1,
        project_id: 42,
        received: 1_700_000_000,
        retention_days: 90,
        payload: Bytes::from(payload),
        replay_video: video.map(Bytes::copy_from_slice),
    };
    rmp_serde::to_vec_named(&envelope).unwrap()
}

/// A parsed segment whose data is `len` copies of the replay id's first byte.
pub fn make_processed_message(
    replay_id: &str,
    segment_id: u32,
    len: usize,
) -> ProcessedRecordingMessage {
    let fill = replay_id.bytes().next().unwrap_or(b'0');
    ProcessedRecordingMessage {
        org_id: 1,
        project_id: 42,
        replay_id: replay_id.to_string(),
        segment_id,
        key_id: Some(3),
        is_replay_video: false,
        retention_days: 90,
        filename: make_recording_filename(90, 42, replay_id, segment_id),
        filedata: Bytes::from(vec![fill; len]),
        received: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        uncompressed_size: len * 4,
        actions_event: None,
    }
}

/// Attach a single dead click to `message`.
pub fn with_click_actions(mut message: ProcessedRecordingMessage) -> ProcessedRecordingMessage {
    message.actions_event = Some(ReplayActionsEvent {
        replay_id: message.replay_id.clone(),
        project_id: message.project_id,
        segment_id: message.segment_id,
        retention_days: message.retention_days,
        clicks: vec![ReplayClick {
            node_id: 1,
            tag: "button".to_string(),
            id: "save".to_string(),
            classes: vec!["primary".to_string()],
            text: "Save".to_string(),
            role: String::new(),
            alt: String::new(),
            testid: String::new(),
            aria_label: String::new(),
            title: String::new(),
            component_name: String::new(),
            timestamp: 1_700_000_000.0,
            is_dead: true,
            is_rage: false,
        }],
    });
    message
}

pub fn test_commit_context(
    blobs: Arc<dyn BlobStore>,
    file_parts: Arc<dyn FilePartStore>,
    publisher: Arc<dyn EventPublisher>,
) -> Arc<CommitContext> {
    Arc::new(CommitContext {
        blobs,
        file_parts,
        publisher,
        billing: Arc::new(InitialSegmentBilling),
        actions_topic: TEST_ACTIONS_TOPIC.to_string(),
        outcomes_topic: TEST_OUTCOMES_TOPIC.to_string(),
        publisher_flush_timeout: Duration::from_secs(5),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Publisher that keeps everything in memory. A message stays
/// unacknowledged until its delivery is awaited.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<PublishedEvent>>,
    unacknowledged: Arc<AtomicUsize>,
    fail: AtomicBool,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Accept messages keyed by `key` but fail their delivery.
    pub fn fail_deliveries_for(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedEvent> {
        self.published()
            .into_iter()
            .filter(|event| event.topic == topic)
            .collect()
    }

    pub fn unacknowledged(&self) -> usize {
        self.unacknowledged.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<Delivery, PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        let fails = key.is_some_and(|k| self.failing_keys.lock().unwrap().contains(k));
        self.published.lock().unwrap().push(PublishedEvent {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
        });
        self.unacknowledged.fetch_add(1, Ordering::SeqCst);

        let unacknowledged = self.unacknowledged.clone();
        Ok(async move {
            unacknowledged.fetch_sub(1, Ordering::SeqCst);
            if fails {
                Err(PublishError::Canceled)
            } else {
                Ok(())
            }
        }
        .boxed())
    }
}

/// Offset committer that records every successful commit.
#[derive(Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<Offsets>>,
    fail: AtomicBool,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn commits(&self) -> Vec<Offsets> {
        self.commits.lock().unwrap().clone()
    }

    /// Highest offset committed for `partition` across all commits.
    pub fn last_offset(&self, partition: &Partition) -> Option<i64> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .filter_map(|offsets| offsets.get(partition).copied())
            .max()
    }
}

#[async_trait]
impl OffsetCommitter for RecordingCommitter {
    async fn commit(&self, offsets: &Offsets) -> Result<(), ConsumerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConsumerError::Closed);
        }
        self.commits.lock().unwrap().push(offsets.clone());
        Ok(())
    }
}

/// Yields a fixed list of messages, then reports the source as closed.
pub struct VecSource {
    messages: Mutex<VecDeque<RawMessage>>,
}

impl VecSource {
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages: Mutex::new(messages.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn recv(&self) -> Result<RawMessage, ConsumerError> {
        let next = self.messages.lock().unwrap().pop_front();
        next.ok_or(ConsumerError::Closed)
    }
}
