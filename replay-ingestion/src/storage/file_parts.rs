use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilePartStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid file part for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Placement of one segment inside a merged buffer. `range_stop` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePartRow {
    pub key: String,
    pub range_start: u64,
    pub range_stop: u64,
}

impl FilePartRow {
    pub fn len(&self) -> u64 {
        self.range_stop - self.range_start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.range_stop < self.range_start
    }
}

/// Persisted file part: a row plus the merged blob it points into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub key: String,
    pub range_start: u64,
    pub range_stop: u64,
    pub filename: String,
    pub retention_days: i64,
}

impl FilePart {
    pub fn from_row(row: &FilePartRow, filename: &str, retention_days: i64) -> Self {
        Self {
            key: row.key.clone(),
            range_start: row.range_start,
            range_stop: row.range_stop,
            filename: filename.to_string(),
            retention_days,
        }
    }

    pub fn length(&self) -> u64 {
        self.range_stop - self.range_start + 1
    }
}

/// Metadata store for file parts, keyed by the segment's own key.
#[async_trait]
pub trait FilePartStore: Send + Sync {
    async fn bulk_insert(&self, parts: Vec<FilePart>) -> Result<(), FilePartStoreError>;

    async fn find_by_key(&self, key: &str) -> Result<Option<FilePart>, FilePartStoreError>;

    /// Rows still pointing into the merged blob `filename`.
    async fn count_by_filename(&self, filename: &str) -> Result<u64, FilePartStoreError>;

    /// Returns the number of rows removed.
    async fn delete_by_keys(&self, keys: &[String]) -> Result<u64, FilePartStoreError>;

    /// Returns the number of rows updated.
    async fn update_retention(
        &self,
        keys: &[String],
        retention_days: i64,
    ) -> Result<u64, FilePartStoreError>;
}
