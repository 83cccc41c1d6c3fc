use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::recording::ProcessedRecordingMessage;

/// Outcome kind for an accepted item.
const OUTCOME_ACCEPTED: u8 = 0;
const CATEGORY_REPLAY: u8 = 7;
const CATEGORY_REPLAY_VIDEO: u8 = 20;

/// The identifying fields of a segment a billing decision is based on.
#[derive(Debug, Clone, Copy)]
pub struct BillableSegment<'a> {
    pub org_id: i64,
    pub project_id: i64,
    pub replay_id: &'a str,
    pub segment_id: u32,
    pub key_id: Option<i64>,
    pub received: DateTime<Utc>,
    pub is_video: bool,
}

impl<'a> From<&'a ProcessedRecordingMessage> for BillableSegment<'a> {
    fn from(message: &'a ProcessedRecordingMessage) -> Self {
        Self {
            org_id: message.org_id,
            project_id: message.project_id,
            replay_id: &message.replay_id,
            segment_id: message.segment_id,
            key_id: message.key_id,
            received: message.received,
            is_video: message.is_replay_video,
        }
    }
}

pub trait BillingDecider: Send + Sync {
    fn is_billable_segment(&self, segment: &BillableSegment<'_>) -> bool;
}

/// A replay is billed once, when its first segment arrives.
#[derive(Debug, Default, Clone, Copy)]
pub struct InitialSegmentBilling;

impl BillingDecider for InitialSegmentBilling {
    fn is_billable_segment(&self, segment: &BillableSegment<'_>) -> bool {
        segment.segment_id == 0
    }
}

/// Accepted outcome written to the outcomes topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingOutcome {
    pub timestamp: String,
    pub org_id: i64,
    pub project_id: i64,
    pub key_id: Option<i64>,
    pub outcome: u8,
    pub category: u8,
    pub quantity: u32,
    pub event_id: String,
}

impl BillingOutcome {
    pub fn accepted(segment: &BillableSegment<'_>) -> Self {
        Self {
            timestamp: segment
                .received
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            org_id: segment.org_id,
            project_id: segment.project_id,
            key_id: segment.key_id,
            outcome: OUTCOME_ACCEPTED,
            category: if segment.is_video {
                CATEGORY_REPLAY_VIDEO
            } else {
                CATEGORY_REPLAY
            },
            quantity: 1,
            event_id: segment.replay_id.to_string(),
        }
    }
}
