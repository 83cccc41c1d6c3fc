use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::storage::file_parts::{FilePart, FilePartStore, FilePartStoreError};

/// File-part rows in Postgres.
#[derive(Clone)]
pub struct PgFilePartStore {
    pool: PgPool,
}

impl PgFilePartStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, FilePartStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to file part database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), FilePartStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| FilePartStoreError::Database(e.into()))
    }
}

fn to_i64(key: &str, value: u64) -> Result<i64, FilePartStoreError> {
    i64::try_from(value).map_err(|_| FilePartStoreError::Invalid {
        key: key.to_string(),
        reason: format!("offset {value} does not fit in BIGINT"),
    })
}

fn to_u64(key: &str, value: i64) -> Result<u64, FilePartStoreError> {
    u64::try_from(value).map_err(|_| FilePartStoreError::Invalid {
        key: key.to_string(),
        reason: format!("negative offset {value}"),
    })
}

#[async_trait]
impl FilePartStore for PgFilePartStore {
    async fn bulk_insert(&self, parts: Vec<FilePart>) -> Result<(), FilePartStoreError> {
        if parts.is_empty() {
            return Ok(());
        }

        let mut keys = Vec::with_capacity(parts.len());
        let mut range_starts = Vec::with_capacity(parts.len());
        let mut range_stops = Vec::with_capacity(parts.len());
        let mut filenames = Vec::with_capacity(parts.len());
        let mut retentions = Vec::with_capacity(parts.len());

        for part in parts {
            range_starts.push(to_i64(&part.key, part.range_start)?);
            range_stops.push(to_i64(&part.key, part.range_stop)?);
            filenames.push(part.filename);
            retentions.push(part.retention_days);
            keys.push(part.key);
        }

        // Reprocessing a batch rewrites the same keys, so conflicts overwrite
        let result = sqlx::query(
            r#"
INSERT INTO replay_file_parts (key, range_start, range_stop, filename, retention_days)
SELECT * FROM UNNEST($1::text[], $2::bigint[], $3::bigint[], $4::text[], $5::bigint[])
ON CONFLICT (key) DO UPDATE SET
    range_start = EXCLUDED.range_start,
    range_stop = EXCLUDED.range_stop,
    filename = EXCLUDED.filename,
    retention_days = EXCLUDED.retention_days
"#,
        )
        .bind(&keys)
        .bind(&range_starts)
        .bind(&range_stops)
        .bind(&filenames)
        .bind(&retentions)
        .execute(&self.pool)
        .await?;

        debug!(rows = result.rows_affected(), "Inserted file parts");
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<FilePart>, FilePartStoreError> {
        let row = sqlx::query(
            "SELECT key, range_start, range_stop, filename, retention_days \
             FROM replay_file_parts WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let key: String = row.try_get("key")?;
        let range_start: i64 = row.try_get("range_start")?;
        let range_stop: i64 = row.try_get("range_stop")?;
        Ok(Some(FilePart {
            range_start: to_u64(&key, range_start)?,
            range_stop: to_u64(&key, range_stop)?,
            filename: row.try_get("filename")?,
            retention_days: row.try_get("retention_days")?,
            key,
        }))
    }

    async fn count_by_filename(&self, filename: &str) -> Result<u64, FilePartStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM replay_file_parts WHERE filename = $1")
                .bind(filename)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_by_keys(&self, keys: &[String]) -> Result<u64, FilePartStoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM replay_file_parts WHERE key = ANY($1)")
            .bind(keys)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_retention(
        &self,
        keys: &[String],
        retention_days: i64,
    ) -> Result<u64, FilePartStoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result =
            sqlx::query("UPDATE replay_file_parts SET retention_days = $1 WHERE key = ANY($2)")
                .bind(retention_days)
                .bind(keys)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
