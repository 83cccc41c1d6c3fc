use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::recording::keys::{make_recording_filename, make_video_filename};
use crate::recording::parser::decompress;
use crate::storage::blob::{BlobStore, BlobStoreError};
use crate::storage::file_parts::{FilePartStore, FilePartStoreError};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    FileParts(#[from] FilePartStoreError),
    #[error("failed to decompress segment: {0}")]
    Decompress(#[from] std::io::Error),
}

/// Identity of a stored segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    pub retention_days: i64,
    pub project_id: i64,
    pub replay_id: String,
    pub segment_id: u32,
    /// Video segments live under their own key and are stored uncompressed.
    pub video: bool,
}

impl SegmentLocation {
    pub fn key(&self) -> String {
        let make_filename = if self.video {
            make_video_filename
        } else {
            make_recording_filename
        };
        make_filename(
            self.retention_days,
            self.project_id,
            &self.replay_id,
            self.segment_id,
        )
    }
}

/// Reads segments back whichever committer wrote them: a file-part row means
/// a ranged read of the merged blob, otherwise the segment has its own blob.
pub struct SegmentReader {
    blobs: Arc<dyn BlobStore>,
    file_parts: Arc<dyn FilePartStore>,
}

impl SegmentReader {
    pub fn new(blobs: Arc<dyn BlobStore>, file_parts: Arc<dyn FilePartStore>) -> Self {
        Self { blobs, file_parts }
    }

    /// Stored bytes of the segment, `None` if it was never written.
    pub async fn read(&self, location: &SegmentLocation) -> Result<Option<Bytes>, ReadError> {
        let key = location.key();

        if let Some(part) = self.file_parts.find_by_key(&key).await? {
            debug!(key, filename = part.filename, "Reading segment from merged blob");
            let data = self
                .blobs
                .get_range(&part.filename, part.range_start, part.length())
                .await?;
            return Ok(Some(data));
        }

        match self.blobs.get(&key).await {
            Ok(data) => Ok(Some(data)),
            Err(BlobStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Decompressed rrweb payload of the segment, or the raw video bytes.
    pub async fn read_events(
        &self,
        location: &SegmentLocation,
    ) -> Result<Option<Vec<u8>>, ReadError> {
        match self.read(location).await? {
            Some(data) if location.video => Ok(Some(data.to_vec())),
            Some(data) => Ok(Some(decompress(&data)?)),
            None => Ok(None),
        }
    }

    /// Remove the segments. A merged blob is deleted once none of its rows remain.
    pub async fn delete(&self, locations: &[SegmentLocation]) -> Result<(), ReadError> {
        let mut part_keys = Vec::new();
        let mut merged = BTreeSet::new();
        for location in locations {
            let key = location.key();
            if let Some(part) = self.file_parts.find_by_key(&key).await? {
                merged.insert(part.filename);
                part_keys.push(key);
            } else {
                self.blobs.delete(&key).await?;
            }
        }

        let removed = self.file_parts.delete_by_keys(&part_keys).await?;
        debug!(removed, "Deleted segment file parts");

        for filename in merged {
            let remaining = self.file_parts.count_by_filename(&filename).await?;
            if remaining == 0 {
                self.blobs.delete(&filename).await?;
                debug!(filename, "Deleted merged blob");
            } else {
                debug!(filename, remaining, "Merged blob still referenced");
            }
        }
        Ok(())
    }
}
