use std::time::Instant;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{error, info};

use crate::config::Config;
use crate::metrics_consts::{BLOB_STORE_DURATION_MS, BLOB_STORE_OPERATIONS};
use crate::storage::blob::{BlobStore, BlobStoreError};

fn error_reason<E: std::fmt::Debug>(err: &SdkError<E>) -> String {
    match err {
        SdkError::ConstructionFailure(_) => "construction_failure".to_string(),
        SdkError::TimeoutError(_) => "timeout".to_string(),
        SdkError::DispatchFailure(_) => "connection_error".to_string(),
        SdkError::ResponseError(err) => {
            format!("response_error_{}", err.raw().status().as_u16())
        }
        SdkError::ServiceError(err) => {
            format!("status_{}", err.raw().status().as_u16())
        }
        _ => "unknown".to_string(),
    }
}

fn record(operation: &'static str, status: &'static str, started: Instant) {
    metrics::counter!(BLOB_STORE_OPERATIONS, "operation" => operation, "status" => status)
        .increment(1);
    metrics::histogram!(BLOB_STORE_DURATION_MS, "operation" => operation)
        .record(started.elapsed().as_millis() as f64);
}

/// S3 (or MinIO) backed blob store.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Uses the default AWS credential chain unless explicit credentials are configured.
    pub async fn new(config: &Config) -> Self {
        let region = Region::new(config.s3_region.clone());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .region(region)
            .force_path_style(true); // MinIO/localstack

        if let Some(endpoint) = &config.s3_endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) =
            (&config.s3_access_key_id, &config.s3_secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "env");
            builder = builder.credentials_provider(credentials);
        }

        info!(
            bucket = config.s3_bucket,
            endpoint = config.s3_endpoint,
            "S3 blob store initialized"
        );

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.s3_bucket.clone(),
        }
    }

    async fn fetch(
        &self,
        operation: &'static str,
        key: &str,
        range: Option<String>,
    ) -> Result<Bytes, BlobStoreError> {
        let started = Instant::now();
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                record(operation, "not_found", started);
                return Err(BlobStoreError::NotFound(key.to_string()));
            }
            Err(e) => {
                record(operation, "error", started);
                error!(key, "S3 {operation} failed: {:?}", e);
                return Err(BlobStoreError::Backend {
                    operation,
                    reason: error_reason(&e),
                });
            }
        };

        let body = output.body.collect().await.map_err(|e| {
            record(operation, "error", started);
            BlobStoreError::Backend {
                operation,
                reason: e.to_string(),
            }
        })?;

        record(operation, "ok", started);
        Ok(body.into_bytes())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &str) -> Result<Bytes, BlobStoreError> {
        self.fetch("get", key, None).await
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<(), BlobStoreError> {
        let started = Instant::now();
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/octet-stream")
            .send()
            .await;

        match result {
            Ok(_) => {
                record("set", "ok", started);
                Ok(())
            }
            Err(e) => {
                record("set", "error", started);
                error!(key, "S3 upload failed: {:?}", e);
                Err(BlobStoreError::Backend {
                    operation: "set",
                    reason: error_reason(&e),
                })
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let started = Instant::now();
        let result = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => {
                record("delete", "ok", started);
                Ok(())
            }
            Err(e) => {
                record("delete", "error", started);
                Err(BlobStoreError::Backend {
                    operation: "delete",
                    reason: error_reason(&e),
                })
            }
        }
    }

    async fn get_range(
        &self,
        key: &str,
        start: u64,
        length: u64,
    ) -> Result<Bytes, BlobStoreError> {
        if length == 0 {
            return Err(BlobStoreError::InvalidRange {
                key: key.to_string(),
                start,
                length,
            });
        }
        // HTTP ranges are inclusive
        let range = format!("bytes={}-{}", start, start + length - 1);
        self.fetch("get_range", key, Some(range)).await
    }
}
