use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recording::actions::ReplayActionsEvent;

pub const RECORDING_MESSAGE_TYPE: &str = "replay_recording_not_chunked";

/// Msgpack envelope of a recording segment as produced upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub replay_id: String,
    #[serde(default)]
    pub key_id: Option<i64>,
    pub org_id: i64,
    pub project_id: i64,
    /// Unix seconds at which the segment was received upstream.
    pub received: i64,
    pub retention_days: i64,
    /// `{"segment_id": N}` header line, a newline, then the (optionally zlib
    /// compressed) rrweb event list.
    pub payload: Bytes,
    #[serde(default)]
    pub replay_video: Option<Bytes>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SegmentHeader {
    pub segment_id: u32,
}

/// One recording segment ready to be committed. Built once by the parser and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecordingMessage {
    pub org_id: i64,
    pub project_id: i64,
    pub replay_id: String,
    pub segment_id: u32,
    pub key_id: Option<i64>,
    pub is_replay_video: bool,
    pub retention_days: i64,
    pub filename: String,
    pub filedata: Bytes,
    pub received: DateTime<Utc>,
    /// Size of the decoded recording events; zero when they could not be decoded.
    pub uncompressed_size: usize,
    pub actions_event: Option<ReplayActionsEvent>,
}

impl ProcessedRecordingMessage {
    pub fn size(&self) -> usize {
        self.filedata.len()
    }
}
