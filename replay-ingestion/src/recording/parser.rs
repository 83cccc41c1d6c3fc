use std::io::{Read, Write};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::recording::actions::parse_replay_actions;
use crate::recording::keys::{make_recording_filename, make_video_filename};
use crate::recording::message::{
    ProcessedRecordingMessage, RecordingEnvelope, SegmentHeader, RECORDING_MESSAGE_TYPE,
};

/// First byte of a zlib stream with the default window size.
const ZLIB_MAGIC: u8 = 0x78;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to decode msgpack envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unsupported message type: {0}")]
    UnsupportedType(String),
    #[error("recording payload has no segment header")]
    MissingHeader,
    #[error("invalid segment header: {0}")]
    InvalidHeader(#[source] serde_json::Error),
    #[error("failed to (de)compress recording: {0}")]
    Compression(#[from] std::io::Error),
    #[error("invalid received timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("invalid replay id: {0}")]
    InvalidReplayId(String),
}

/// Decode one broker message into a recording segment.
///
/// The stored `filedata` is always zlib compressed. A body that fails to
/// decode as rrweb JSON is still stored; it just yields no actions.
pub fn parse_recording_message(payload: &[u8]) -> Result<ProcessedRecordingMessage, ParseError> {
    let envelope: RecordingEnvelope = rmp_serde::from_slice(payload)?;
    if envelope.kind != RECORDING_MESSAGE_TYPE {
        return Err(ParseError::UnsupportedType(envelope.kind));
    }

    let replay_id = Uuid::parse_str(&envelope.replay_id)
        .map_err(|_| ParseError::InvalidReplayId(envelope.replay_id.clone()))?
        .simple()
        .to_string();

    let received = DateTime::<Utc>::from_timestamp(envelope.received, 0)
        .ok_or(ParseError::InvalidTimestamp(envelope.received))?;

    let (header, body) = split_header(&envelope.payload)?;
    let (compressed, decompressed) = if body.first() == Some(&ZLIB_MAGIC) {
        (Bytes::copy_from_slice(body), decompress(body)?)
    } else {
        (Bytes::from(compress(body)?), body.to_vec())
    };

    let actions_event = match serde_json::from_slice::<Vec<Value>>(&decompressed) {
        Ok(events) => parse_replay_actions(
            &replay_id,
            envelope.project_id,
            header.segment_id,
            envelope.retention_days,
            &events,
        ),
        Err(e) => {
            debug!(
                replay_id = %replay_id,
                segment_id = header.segment_id,
                "Recording body is not rrweb JSON: {e:#}"
            );
            None
        }
    };

    let (filename, filedata, is_replay_video) = match envelope.replay_video {
        Some(video) => (
            make_video_filename(
                envelope.retention_days,
                envelope.project_id,
                &replay_id,
                header.segment_id,
            ),
            video,
            true,
        ),
        None => (
            make_recording_filename(
                envelope.retention_days,
                envelope.project_id,
                &replay_id,
                header.segment_id,
            ),
            compressed,
            false,
        ),
    };

    Ok(ProcessedRecordingMessage {
        org_id: envelope.org_id,
        project_id: envelope.project_id,
        replay_id,
        segment_id: header.segment_id,
        key_id: envelope.key_id,
        is_replay_video,
        retention_days: envelope.retention_days,
        filename,
        filedata,
        received,
        uncompressed_size: decompressed.len(),
        actions_event,
    })
}

fn split_header(payload: &[u8]) -> Result<(SegmentHeader, &[u8]), ParseError> {
    let newline = payload
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(ParseError::MissingHeader)?;
    let header: SegmentHeader =
        serde_json::from_slice(&payload[..newline]).map_err(ParseError::InvalidHeader)?;
    Ok((header, &payload[newline + 1..]))
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::encode_recording_envelope;

    const REPLAY_ID: &str = "6A3BB3A8-1F0E-4C38-8A4F-4F1C3E0B1D2E";

    fn click_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!([
            {"type": 3, "data": {"source": 2}},
            {
                "type": 5,
                "timestamp": 1_700_000_000_000i64,
                "data": {
                    "tag": "breadcrumb",
                    "payload": {
                        "category": "ui.click",
                        "timestamp": 1_700_000_000.0,
                        "data": {"node": {"id": 3, "tagName": "a", "attributes": {}}}
                    }
                }
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_parses_uncompressed_body() {
        let body = click_body();
        let raw = encode_recording_envelope(REPLAY_ID, 4, &body, None);

        let message = parse_recording_message(&raw).unwrap();

        assert_eq!(message.replay_id, "6a3bb3a81f0e4c388a4f4f1c3e0b1d2e");
        assert_eq!(message.segment_id, 4);
        assert_eq!(message.org_id, 1);
        assert_eq!(message.project_id, 42);
        assert_eq!(message.filename, "90/42/6a3bb3a81f0e4c388a4f4f1c3e0b1d2e/4");
        assert!(!message.is_replay_video);
        assert_eq!(message.uncompressed_size, body.len());
        assert_eq!(decompress(&message.filedata).unwrap(), body);
        assert_eq!(message.actions_event.unwrap().clicks.len(), 1);
    }

    #[test]
    fn test_compressed_body_is_stored_as_is() {
        let body = click_body();
        let compressed = compress(&body).unwrap();
        let raw = encode_recording_envelope(REPLAY_ID, 0, &compressed, None);

        let message = parse_recording_message(&raw).unwrap();

        assert_eq!(message.filedata.as_ref(), compressed.as_slice());
        assert_eq!(message.uncompressed_size, body.len());
        assert!(message.actions_event.is_some());
    }

    #[test]
    fn test_video_segment_stores_video_bytes() {
        let raw = encode_recording_envelope(REPLAY_ID, 1, b"[]", Some(b"mp4-bytes"));

        let message = parse_recording_message(&raw).unwrap();

        assert!(message.is_replay_video);
        assert!(message.filename.ends_with("/1/video"));
        assert_eq!(message.filedata.as_ref(), b"mp4-bytes");
        assert!(message.actions_event.is_none());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            parse_recording_message(b"not msgpack"),
            Err(ParseError::Decode(_))
        ));

        let raw = encode_recording_envelope("not-a-uuid", 0, b"[]", None);
        assert!(matches!(
            parse_recording_message(&raw),
            Err(ParseError::InvalidReplayId(_))
        ));
    }

    #[test]
    fn test_rejects_missing_header() {
        let envelope = RecordingEnvelope {
            kind: RECORDING_MESSAGE_TYPE.to_string(),
            replay_id: REPLAY_ID.to_string(),
            key_id: None,
            org_id: 1,
            project_id: 1,
            received: 1_700_000_000,
            retention_days: 30,
            payload: Bytes::from_static(b"no newline here"),
            replay_video: None,
        };
        let raw = rmp_serde::to_vec_named(&envelope).unwrap();

        assert!(matches!(
            parse_recording_message(&raw),
            Err(ParseError::MissingHeader)
        ));
    }

    #[test]
    fn test_rejects_other_message_types() {
        let envelope = RecordingEnvelope {
            kind: "replay_event".to_string(),
            replay_id: REPLAY_ID.to_string(),
            key_id: None,
            org_id: 1,
            project_id: 1,
            received: 1_700_000_000,
            retention_days: 30,
            payload: Bytes::from_static(b"{\"segment_id\":0}\n[]"),
            replay_video: None,
        };
        let raw = rmp_serde::to_vec_named(&envelope).unwrap();

        assert!(matches!(
            parse_recording_message(&raw),
            Err(ParseError::UnsupportedType(kind)) if kind == "replay_event"
        ));
    }
}
