//! S3 storage backend
//!
//! Provides async S3-compatible storage with:
//! - Streaming multipart uploads for large objects
//! - Exponential backoff retry logic
//! - Native delimiter listings
//! - Custom endpoint support (for MinIO, LocalStack, etc.)

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    error::DisplayErrorContext,
    primitives::{ByteStream, DateTime as S3DateTime},
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use cloudstore_core::{Error, ListPage, ListRequest, ObjectMeta, Result};
use tracing::{debug, instrument, warn};

use crate::backend::{BlobReader, BlobSink, StorageBackend};

/// Part size for multipart uploads (5 MB minimum required by S3)
const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest page S3 hands out per list call
const MAX_KEYS: usize = 1000;

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
const BASE_RETRY_DELAY_MS: u64 = 100;

const BACKEND: &str = "s3";

/// S3-compatible storage backend
///
/// Supports Amazon S3 and S3-compatible services like MinIO. Listings come
/// back in key order across pages.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

/// Configuration for S3Storage
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Optional prefix for all keys (e.g., "datasets/")
    pub prefix: Option<String>,
    /// Optional custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// AWS region (default: "us-east-1")
    pub region: Option<String>,
    /// Force path-style addressing (required for MinIO)
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: None,
            endpoint_url: None,
            region: Some("us-east-1".to_string()),
            force_path_style: false,
        }
    }
}

impl S3Storage {
    /// Create a new S3Storage with default AWS configuration
    ///
    /// Uses environment variables or instance profile for credentials.
    pub async fn new(bucket: impl Into<String>) -> Self {
        Self::with_config(S3Config {
            bucket: bucket.into(),
            ..Default::default()
        })
        .await
    }

    /// Create a new S3Storage with custom configuration
    pub async fn with_config(config: S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(
                config.region.unwrap_or_else(|| "us-east-1".to_string()),
            ))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Self {
            client,
            bucket: config.bucket,
            prefix: normalize_prefix(config.prefix.as_deref().unwrap_or_default()),
        }
    }

    /// Full S3 key for an object name
    fn s3_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Object name for a full S3 key
    fn relative<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    /// Execute an async operation with exponential backoff retry
    async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }

                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * (1 << attempt));
                    warn!(
                        %operation,
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::remote(
                BACKEND,
                format!("{} failed after {} retries", operation, MAX_RETRIES),
            )
        }))
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn lists_sorted(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn head(&self, name: &str) -> Result<ObjectMeta> {
        let key = self.s3_key(name);

        self.with_retry("head", || async {
            let output = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    let missing = e
                        .as_service_error()
                        .map(|se| se.is_not_found())
                        .unwrap_or(false);
                    if missing {
                        Error::not_found(name)
                    } else {
                        Error::remote(
                            BACKEND,
                            format!("S3 head_object failed: {}", DisplayErrorContext(&e)),
                        )
                    }
                })?;

            Ok(ObjectMeta {
                name: name.to_string(),
                size: output.content_length().unwrap_or_default().max(0) as u64,
                updated: to_chrono(output.last_modified()),
            })
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn open_read(&self, name: &str) -> Result<BlobReader> {
        let key = self.s3_key(name);
        debug!(%key, "Reading from S3");

        let output = self
            .with_retry("get", || async {
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| {
                        let missing = e
                            .as_service_error()
                            .map(|se| se.is_no_such_key())
                            .unwrap_or(false);
                        if missing {
                            Error::not_found(name)
                        } else {
                            Error::remote(
                                BACKEND,
                                format!("S3 get_object failed: {}", DisplayErrorContext(&e)),
                            )
                        }
                    })
            })
            .await?;

        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn open_write(&self, name: &str) -> Result<Box<dyn BlobSink>> {
        Ok(Box::new(S3Sink {
            storage: self.clone(),
            name: name.to_string(),
            key: self.s3_key(name),
            buffer: BytesMut::new(),
            multipart: None,
            size: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, name: &str) -> Result<()> {
        // S3 deletes of missing keys succeed silently
        self.head(name).await?;

        let key = self.s3_key(name);
        debug!(%key, "Deleting from S3");

        self.with_retry("delete", || async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    Error::remote(
                        BACKEND,
                        format!("S3 delete_object failed: {}", DisplayErrorContext(&e)),
                    )
                })?;

            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let s3_prefix = self.s3_key(&request.prefix);
        let max_keys = request.page_size.clamp(1, MAX_KEYS) as i32;

        let response = self
            .with_retry("list", || async {
                let mut call = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&s3_prefix)
                    .max_keys(max_keys);

                if let Some(delimiter) = &request.delimiter {
                    call = call.delimiter(delimiter);
                }
                if let Some(token) = &request.cursor {
                    call = call.continuation_token(token);
                }

                call.send().await.map_err(|e| {
                    Error::remote(
                        BACKEND,
                        format!("S3 list_objects_v2 failed: {}", DisplayErrorContext(&e)),
                    )
                })
            })
            .await?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                Some(ObjectMeta {
                    name: self.relative(key).to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    updated: to_chrono(object.last_modified()),
                })
            })
            .collect::<Vec<_>>();

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|cp| cp.prefix())
            .map(|p| self.relative(p).to_string())
            .collect::<Vec<_>>();

        let next_cursor = if response.is_truncated() == Some(true) {
            response.next_continuation_token().map(String::from)
        } else {
            None
        };

        debug!(
            objects = objects.len(),
            prefixes = common_prefixes.len(),
            more = next_cursor.is_some(),
            "Listed S3 page"
        );
        Ok(ListPage {
            objects,
            common_prefixes,
            next_cursor,
        })
    }
}

struct Multipart {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

/// Upload that switches to multipart once a full part has been buffered
struct S3Sink {
    storage: S3Storage,
    name: String,
    key: String,
    buffer: BytesMut,
    multipart: Option<Multipart>,
    size: u64,
}

impl S3Sink {
    async fn start_multipart(&self) -> Result<Multipart> {
        let s3 = &self.storage;
        let output = s3
            .client
            .create_multipart_upload()
            .bucket(&s3.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| {
                Error::remote(
                    BACKEND,
                    format!(
                        "Failed to initiate multipart upload: {}",
                        DisplayErrorContext(&e)
                    ),
                )
            })?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| Error::remote(BACKEND, "No upload_id returned"))?
            .to_string();

        debug!(key = %self.key, %upload_id, "Started multipart upload");
        Ok(Multipart {
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn upload_part(&mut self, data: Bytes) -> Result<()> {
        if self.multipart.is_none() {
            self.multipart = Some(self.start_multipart().await?);
        }
        let (upload_id, part_number) = match &self.multipart {
            Some(multipart) => (multipart.upload_id.clone(), multipart.parts.len() as i32 + 1),
            None => {
                return Err(Error::Internal {
                    message: "multipart upload missing after start".to_string(),
                })
            }
        };

        let len = data.len();
        let s3 = &self.storage;
        let key = self.key.as_str();
        let upload_id = upload_id.as_str();
        let output = s3
            .with_retry("upload_part", || {
                let data = data.clone();
                async move {
                    s3.client
                        .upload_part()
                        .bucket(&s3.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(data))
                        .send()
                        .await
                        .map_err(|e| {
                            Error::remote(
                                BACKEND,
                                format!(
                                    "Failed to upload part {}: {}",
                                    part_number,
                                    DisplayErrorContext(&e)
                                ),
                            )
                        })
                }
            })
            .await?;

        let part = CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(output.e_tag().map(String::from))
            .build();
        if let Some(multipart) = self.multipart.as_mut() {
            multipart.parts.push(part);
        }
        debug!(part_number, len, "Uploaded part");
        Ok(())
    }

    async fn put_whole(&self, data: Bytes) -> Result<()> {
        let s3 = &self.storage;
        let key = self.key.as_str();
        s3.with_retry("put", || {
            let data = data.clone();
            async move {
                s3.client
                    .put_object()
                    .bucket(&s3.bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| {
                        Error::remote(
                            BACKEND,
                            format!("S3 put_object failed: {}", DisplayErrorContext(&e)),
                        )
                    })?;
                Ok(())
            }
        })
        .await
    }

    async fn complete(&self, multipart: &Multipart) -> Result<()> {
        let s3 = &self.storage;
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(multipart.parts.clone()))
            .build();

        s3.client
            .complete_multipart_upload()
            .bucket(&s3.bucket)
            .key(&self.key)
            .upload_id(&multipart.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                Error::remote(
                    BACKEND,
                    format!(
                        "Failed to complete multipart upload: {}",
                        DisplayErrorContext(&e)
                    ),
                )
            })?;
        Ok(())
    }
}

#[async_trait]
impl BlobSink for S3Sink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.size += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= MULTIPART_PART_SIZE {
            let part = self.buffer.split_to(MULTIPART_PART_SIZE).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<ObjectMeta> {
        let rest = std::mem::take(&mut self.buffer).freeze();

        if self.multipart.is_none() {
            self.put_whole(rest).await?;
        } else {
            if !rest.is_empty() {
                self.upload_part(rest).await?;
            }
            if let Some(multipart) = self.multipart.take() {
                if let Err(e) = self.complete(&multipart).await {
                    self.multipart = Some(multipart);
                    return Err(e);
                }
            }
        }

        debug!(key = %self.key, size = self.size, "Committed S3 upload");
        self.storage.head(&self.name).await
    }
}

impl Drop for S3Sink {
    fn drop(&mut self) {
        let Some(multipart) = self.multipart.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "No runtime to abort abandoned multipart upload");
            return;
        };

        // Best effort, for cleanup
        let client = self.storage.client.clone();
        let bucket = self.storage.bucket.clone();
        let key = self.key.clone();
        runtime.spawn(async move {
            let _ = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&multipart.upload_id)
                .send()
                .await;
        });
    }
}

/// Store prefixes always end in '/' unless empty
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn to_chrono(ts: Option<&S3DateTime>) -> DateTime<Utc> {
    ts.and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("training/"), "training/");
        assert_eq!(normalize_prefix("training"), "training/");
        assert_eq!(normalize_prefix("/a/b/"), "a/b/");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
    }

    #[test]
    fn test_to_chrono() {
        let ts = S3DateTime::from_secs_and_nanos(1_700_000_000, 500);
        let converted = to_chrono(Some(&ts));
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 500);

        assert_eq!(to_chrono(None), DateTime::<Utc>::default());
    }

    #[test]
    fn test_s3_config_default() {
        let config = S3Config::default();
        assert!(config.bucket.is_empty());
        assert!(config.prefix.is_none());
        assert!(config.endpoint_url.is_none());
        assert_eq!(config.region, Some("us-east-1".to_string()));
        assert!(!config.force_path_style);
    }

    #[tokio::test]
    async fn test_keys_round_trip_through_prefix() {
        let storage = S3Storage::with_config(S3Config {
            bucket: "bucket".to_string(),
            prefix: Some("datasets".to_string()),
            endpoint_url: Some("http://localhost:9000".to_string()),
            force_path_style: true,
            ..Default::default()
        })
        .await;

        let key = storage.s3_key("a/b.csv");
        assert_eq!(key, "datasets/a/b.csv");
        assert_eq!(storage.relative(&key), "a/b.csv");
        assert_eq!(storage.location(), "s3://bucket/datasets/");
        assert!(storage.lists_sorted());
    }
}
