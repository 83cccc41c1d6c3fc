use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use assert_json_diff::assert_json_include;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use replay_ingestion::commit::{BatchCommitter, BatchedCommitter, ThreadedCommitter};
use replay_ingestion::kafka::driver::{run_buffered, run_process_pool};
use replay_ingestion::kafka::types::{Partition, PartitionOffset, RawMessage};
use replay_ingestion::recording::{parse_recording_message, ProcessedRecordingMessage};
use replay_ingestion::runtime::{BufferedRuntime, CommitterFlushPolicy, FlushThresholds};
use replay_ingestion::storage::{SegmentLocation, SegmentReader};
use replay_ingestion::strategy::{BoundedExecutor, ProcessPoolStrategy, RecordingMessageHandler};
use replay_ingestion::test_utils::{
    encode_recording_envelope, test_commit_context, MemoryBlobStore, MemoryFilePartStore,
    MemoryPublisher, RecordingCommitter, VecSource, TEST_ACTIONS_TOPIC, TEST_OUTCOMES_TOPIC,
};

const TOPIC: &str = "ingest-replay-recordings";
const REPLAY_A: &str = "6a3bb3a8-1f0e-4c38-8a4f-4f1c3e0b1d2e";
const REPLAY_B: &str = "0d5c6a2e-52b4-4a3b-9d5e-3c1f0e8a7b61";

struct Harness {
    blobs: Arc<MemoryBlobStore>,
    parts: Arc<MemoryFilePartStore>,
    publisher: Arc<MemoryPublisher>,
}

impl Harness {
    fn new() -> Self {
        Self {
            blobs: Arc::new(MemoryBlobStore::new()),
            parts: Arc::new(MemoryFilePartStore::new()),
            publisher: Arc::new(MemoryPublisher::new()),
        }
    }

    fn batched(&self) -> Arc<dyn BatchCommitter> {
        Arc::new(BatchedCommitter::new(test_commit_context(
            self.blobs.clone(),
            self.parts.clone(),
            self.publisher.clone(),
        )))
    }

    fn threaded(&self) -> Arc<dyn BatchCommitter> {
        Arc::new(ThreadedCommitter::new(
            test_commit_context(self.blobs.clone(), self.parts.clone(), self.publisher.clone()),
            4,
        ))
    }

    fn reader(&self) -> SegmentReader {
        SegmentReader::new(self.blobs.clone(), self.parts.clone())
    }
}

fn body(segment_id: u32, with_click: bool) -> Vec<u8> {
    let mut events = vec![json!({"type": 3, "data": {"source": 2, "segment": segment_id}})];
    if with_click {
        events.push(json!({
            "type": 5,
            "timestamp": 1_700_000_000_000i64,
            "data": {
                "tag": "breadcrumb",
                "payload": {
                    "category": "ui.click",
                    "timestamp": 1_700_000_000.0,
                    "data": {"node": {"id": 7, "tagName": "button", "attributes": {}}}
                }
            }
        }));
    }
    serde_json::to_vec(&events).unwrap()
}

fn raw(offset: i64, payload: Vec<u8>) -> RawMessage {
    RawMessage::new(
        payload,
        PartitionOffset::new(Partition::new(TOPIC.to_string(), 0), offset),
    )
}

/// Three segments across two replays plus one message that is not a recording.
fn messages() -> Vec<RawMessage> {
    vec![
        raw(10, encode_recording_envelope(REPLAY_A, 0, &body(0, true), None)),
        raw(11, encode_recording_envelope(REPLAY_A, 1, &body(1, false), None)),
        raw(12, b"garbage".to_vec()),
        raw(13, encode_recording_envelope(REPLAY_B, 0, &body(0, false), None)),
    ]
}

fn location(replay_id: &str, segment_id: u32) -> SegmentLocation {
    SegmentLocation {
        retention_days: 90,
        project_id: 42,
        replay_id: replay_id.replace('-', ""),
        segment_id,
        video: false,
    }
}

async fn run_buffered_pipeline(committer: Arc<dyn BatchCommitter>) -> RecordingCommitter {
    let thresholds = FlushThresholds {
        max_length: 2,
        max_bytes: usize::MAX,
        max_wait: Duration::from_secs(3600),
    };
    let runtime = BufferedRuntime::new(
        Arc::new(CommitterFlushPolicy::new(thresholds, committer)),
        Box::new(|payload: &[u8]| -> Result<ProcessedRecordingMessage> {
            Ok(parse_recording_message(payload)?)
        }),
    );
    let source = VecSource::new(messages());
    let offsets = RecordingCommitter::new();

    run_buffered(
        &runtime,
        &source,
        &offsets,
        Duration::from_secs(3600),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(source.remaining(), 0);
    offsets
}

async fn assert_segments_readable(harness: &Harness) {
    let reader = harness.reader();
    for (replay_id, segment_id, with_click) in
        [(REPLAY_A, 0, true), (REPLAY_A, 1, false), (REPLAY_B, 0, false)]
    {
        let events = reader
            .read_events(&location(replay_id, segment_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events, body(segment_id, with_click));
    }

    assert!(reader
        .read(&location(REPLAY_B, 1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_buffered_pipeline_with_batched_committer() {
    let harness = Harness::new();
    let offsets = run_buffered_pipeline(harness.batched()).await;

    let partition = Partition::new(TOPIC.to_string(), 0);
    let committed: Vec<i64> = offsets
        .commits()
        .iter()
        .map(|offsets| offsets[&partition])
        .collect();
    // The garbage message is dropped and never advances the offsets on its own
    assert_eq!(committed, vec![12, 14]);

    // One merged blob per flush
    assert_eq!(harness.blobs.writes().len(), 2);
    assert!(harness.blobs.keys().iter().all(|k| k.starts_with("90/merged/")));
    assert_eq!(harness.parts.len(), 3);

    assert_segments_readable(&harness).await;

    let outcomes = harness.publisher.published_to(TEST_OUTCOMES_TOPIC);
    assert_eq!(outcomes.len(), 2);
    let outcome: serde_json::Value = serde_json::from_slice(&outcomes[0].payload).unwrap();
    assert_json_include!(
        actual: outcome,
        expected: json!({
            "org_id": 1,
            "project_id": 42,
            "key_id": 3,
            "outcome": 0,
            "category": 7,
            "quantity": 1,
            "event_id": REPLAY_A.replace('-', ""),
        })
    );

    let actions = harness.publisher.published_to(TEST_ACTIONS_TOPIC);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].key.as_deref(), Some(REPLAY_A.replace('-', "").as_str()));
    assert_eq!(harness.publisher.unacknowledged(), 0);
}

#[tokio::test]
async fn test_buffered_pipeline_with_threaded_committer() {
    let harness = Harness::new();
    let offsets = run_buffered_pipeline(harness.threaded()).await;

    let partition = Partition::new(TOPIC.to_string(), 0);
    assert_eq!(offsets.last_offset(&partition), Some(14));

    // One blob per segment and no file parts
    assert_eq!(harness.blobs.writes().len(), 3);
    assert!(harness.parts.is_empty());

    assert_segments_readable(&harness).await;
    assert_eq!(harness.publisher.published_to(TEST_OUTCOMES_TOPIC).len(), 2);
}

#[tokio::test]
async fn test_process_pool_pipeline_commits_every_offset() {
    let harness = Harness::new();
    let offsets = Arc::new(RecordingCommitter::new());
    let mut strategy = ProcessPoolStrategy::new(
        BoundedExecutor::new(2),
        Arc::new(RecordingMessageHandler::new(harness.threaded())),
        offsets.clone(),
        4,
        Duration::from_millis(1),
    );
    let source = VecSource::new(messages());

    run_process_pool(
        &mut strategy,
        &source,
        Duration::from_millis(5),
        Duration::from_secs(5),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let partition = Partition::new(TOPIC.to_string(), 0);
    assert_eq!(offsets.last_offset(&partition), Some(14));
    assert!(strategy.is_closed());

    assert_segments_readable(&harness).await;
    assert_eq!(harness.publisher.published_to(TEST_ACTIONS_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_deleting_segments_removes_rows_and_blobs() {
    let harness = Harness::new();
    run_buffered_pipeline(harness.batched()).await;
    let reader = harness.reader();

    reader
        .delete(&[location(REPLAY_A, 0), location(REPLAY_A, 1)])
        .await
        .unwrap();

    assert!(reader.read(&location(REPLAY_A, 0)).await.unwrap().is_none());
    assert!(reader.read(&location(REPLAY_A, 1)).await.unwrap().is_none());
    assert!(reader.read(&location(REPLAY_B, 0)).await.unwrap().is_some());
}
