//! Content-addressed storage keys.
//!
//! Segment keys are derived from the segment's identity, so re-processing the
//! same message after a restart overwrites the same object. Merged buffers are
//! keyed by a digest of their bytes for the same reason.

use sha2::{Digest, Sha256};

pub fn make_recording_filename(
    retention_days: i64,
    project_id: i64,
    replay_id: &str,
    segment_id: u32,
) -> String {
    format!("{retention_days}/{project_id}/{replay_id}/{segment_id}")
}

pub fn make_video_filename(
    retention_days: i64,
    project_id: i64,
    replay_id: &str,
    segment_id: u32,
) -> String {
    format!(
        "{}/video",
        make_recording_filename(retention_days, project_id, replay_id, segment_id)
    )
}

/// Key for a merged buffer. Identical batches map to the same key.
pub fn make_merged_filename(retention_days: i64, buffer: &[u8]) -> String {
    let digest = Sha256::digest(buffer);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{retention_days}/merged/{hex}")
}

/// Prefix shared by every segment key of one replay.
pub fn replay_key_prefix(retention_days: i64, project_id: i64, replay_id: &str) -> String {
    format!("{retention_days}/{project_id}/{replay_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_filename_layout() {
        assert_eq!(
            make_recording_filename(90, 42, "a1b2", 3),
            "90/42/a1b2/3".to_string()
        );
        assert_eq!(make_video_filename(30, 1, "ff", 0), "30/1/ff/0/video");
        assert!(make_recording_filename(90, 42, "a1b2", 3)
            .starts_with(&replay_key_prefix(90, 42, "a1b2")));
    }

    #[test]
    fn test_merged_filename_is_content_addressed() {
        let first = make_merged_filename(90, b"hello world");
        let second = make_merged_filename(90, b"hello world");
        let other = make_merged_filename(90, b"hello there");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.starts_with("90/merged/"));
        assert_eq!(first.len(), "90/merged/".len() + 64);
    }
}
