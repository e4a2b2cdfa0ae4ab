use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
    LifecycleRuleFilter,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use futures::Stream;
use tokio_util::io::ReaderStream;

use crate::config::S3Settings;
use crate::models::{Result, ThumbnailError};

/// User-metadata key carrying the source etag of a derivative. On the wire
/// the store prefixes it as `x-amz-meta-parent-etag`.
pub const KEY_PARENT_ETAG: &str = "parent-etag";

const TTL_RULE_ID: &str = "thumbnailTtlRule";

/// Stat information of one stored object. Etags are kept in their canonical
/// unquoted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFileItem {
    pub bucket: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    pub etag: String,
    /// Source etag this object was derived from, if any.
    pub parent_etag: Option<String>,
}

pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

/// An open read stream from the store. Dropping it releases the underlying
/// connection, whether the body was consumed or not.
pub struct StorageResponse {
    pub content_length: u64,
    pub content_type: String,
    pub etag: String,
    body: BodyStream,
}

impl StorageResponse {
    pub fn new(content_length: u64, content_type: String, etag: String, body: BodyStream) -> Self {
        Self {
            content_length,
            content_type,
            etag,
            body,
        }
    }

    pub fn into_body(self) -> BodyStream {
        self.body
    }
}

impl fmt::Debug for StorageResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageResponse")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Object-store operations used by the thumbnail pipeline. Implementations
/// must be safe to share across request handlers.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Object stat, or `None` when the object (or its bucket) doesn't exist.
    async fn get_file_stat(&self, bucket: &str, file_name: &str)
        -> Result<Option<StorageFileItem>>;

    /// Opens a lazy byte stream, or `None` when the object doesn't exist.
    async fn open_stream(&self, bucket: &str, file_name: &str)
        -> Result<Option<StorageResponse>>;

    /// Eagerly downloads the whole object into memory.
    async fn load_file(&self, bucket: &str, file_name: &str) -> Result<Option<Bytes>>;

    /// Uploads `content`, recording `parent_etag` as object metadata when
    /// given. The buffer stays owned by the caller from position zero.
    async fn put_file(
        &self,
        bucket: &str,
        file_name: &str,
        content: Bytes,
        content_type: &str,
        parent_etag: Option<&str>,
    ) -> Result<StorageFileItem>;

    /// Creates the bucket unless it already exists; returns false in that
    /// case. A positive `life_time_days` installs an expiration rule over
    /// the whole bucket.
    async fn try_create_bucket(&self, bucket: &str, life_time_days: u32) -> Result<bool>;
}

fn unquote_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

/// Transport and construction failures are the only ones surfaced to
/// callers; service-level errors map to absence at the call sites.
fn storage_error<E>(op: &str, bucket: &str, file_name: &str, err: SdkError<E>) -> ThumbnailError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ThumbnailError::Storage(format!(
        "{} {}/{} failed: {}",
        op,
        bucket,
        file_name,
        aws_sdk_s3::error::DisplayErrorContext(err)
    ))
}

/// S3-backed implementation over the AWS SDK client.
#[derive(Clone)]
pub struct S3StorageClient {
    client: S3Client,
}

impl S3StorageClient {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    /// Builds the SDK client for a MinIO-style endpoint: static credentials,
    /// explicit endpoint URL and path-style addressing.
    pub async fn from_settings(settings: &S3Settings) -> Self {
        let scheme = if settings.use_tls { "https" } else { "http" };
        let credentials = aws_sdk_s3::config::Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "thumbnail-service",
        );

        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .endpoint_url(format!("{}://{}", scheme, settings.endpoint))
            .force_path_style(true)
            .build();

        Self::new(S3Client::from_conf(s3_config))
    }
}

#[async_trait]
impl StorageClient for S3StorageClient {
    async fn get_file_stat(
        &self,
        bucket: &str,
        file_name: &str,
    ) -> Result<Option<StorageFileItem>> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(file_name)
            .send()
            .await
        {
            Ok(head) => {
                let parent_etag = head
                    .metadata()
                    .and_then(|m| m.get(KEY_PARENT_ETAG))
                    .cloned();
                Ok(Some(StorageFileItem {
                    bucket: bucket.to_string(),
                    file_name: file_name.to_string(),
                    size: head.content_length().unwrap_or(0).max(0) as u64,
                    content_type: head
                        .content_type()
                        .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
                        .to_string(),
                    etag: unquote_etag(head.e_tag()),
                    parent_etag,
                }))
            }
            Err(SdkError::ServiceError(e)) => {
                tracing::debug!(bucket = %bucket, file_name = %file_name, error = ?e.err(), "stat: object not available");
                Ok(None)
            }
            Err(e) => Err(storage_error("stat", bucket, file_name, e)),
        }
    }

    async fn open_stream(
        &self,
        bucket: &str,
        file_name: &str,
    ) -> Result<Option<StorageResponse>> {
        match self
            .client
            .get_object()
            .bucket(bucket)
            .key(file_name)
            .send()
            .await
        {
            Ok(object) => {
                let content_length = object.content_length().unwrap_or(0).max(0) as u64;
                let content_type = object
                    .content_type()
                    .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
                    .to_string();
                let etag = unquote_etag(object.e_tag());
                let body: BodyStream =
                    Box::pin(ReaderStream::new(object.body.into_async_read()));
                Ok(Some(StorageResponse::new(
                    content_length,
                    content_type,
                    etag,
                    body,
                )))
            }
            Err(SdkError::ServiceError(e)) => {
                tracing::debug!(bucket = %bucket, file_name = %file_name, error = ?e.err(), "open_stream: object not available");
                Ok(None)
            }
            Err(e) => Err(storage_error("open_stream", bucket, file_name, e)),
        }
    }

    async fn load_file(&self, bucket: &str, file_name: &str) -> Result<Option<Bytes>> {
        match self
            .client
            .get_object()
            .bucket(bucket)
            .key(file_name)
            .send()
            .await
        {
            Ok(object) => {
                let data = object.body.collect().await.map_err(|e| {
                    ThumbnailError::Storage(format!(
                        "load {}/{} failed mid-stream: {}",
                        bucket, file_name, e
                    ))
                })?;
                Ok(Some(data.into_bytes()))
            }
            Err(SdkError::ServiceError(e)) => {
                tracing::debug!(bucket = %bucket, file_name = %file_name, error = ?e.err(), "load: object not available");
                Ok(None)
            }
            Err(e) => Err(storage_error("load", bucket, file_name, e)),
        }
    }

    async fn put_file(
        &self,
        bucket: &str,
        file_name: &str,
        content: Bytes,
        content_type: &str,
        parent_etag: Option<&str>,
    ) -> Result<StorageFileItem> {
        let size = content.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(file_name)
            .body(ByteStream::from(content))
            .content_type(content_type);
        if let Some(parent_etag) = parent_etag {
            request = request.metadata(KEY_PARENT_ETAG, parent_etag);
        }

        let result = request
            .send()
            .await
            .map_err(|e| storage_error("put", bucket, file_name, e))?;

        tracing::debug!(bucket = %bucket, file_name = %file_name, size_bytes = size, "Uploaded object");
        Ok(StorageFileItem {
            bucket: bucket.to_string(),
            file_name: file_name.to_string(),
            size,
            content_type: content_type.to_string(),
            etag: unquote_etag(result.e_tag()),
            parent_etag: parent_etag.map(str::to_string),
        })
    }

    async fn try_create_bucket(&self, bucket: &str, life_time_days: u32) -> Result<bool> {
        if self
            .client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(false);
        }

        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {}
            Err(SdkError::ServiceError(e))
                if e.err().is_bucket_already_exists()
                    || e.err().is_bucket_already_owned_by_you() =>
            {
                return Ok(false);
            }
            Err(e) => {
                return Err(ThumbnailError::Storage(format!(
                    "create bucket {} failed: {}",
                    bucket,
                    aws_sdk_s3::error::DisplayErrorContext(e)
                )))
            }
        }

        if life_time_days > 0 {
            let rule = LifecycleRule::builder()
                .id(TTL_RULE_ID)
                .status(ExpirationStatus::Enabled)
                .expiration(
                    LifecycleExpiration::builder()
                        .days(life_time_days as i32)
                        .build(),
                )
                .filter(LifecycleRuleFilter::builder().prefix("").build())
                .build()
                .map_err(|e| {
                    ThumbnailError::Storage(format!("invalid lifecycle rule: {}", e))
                })?;
            let lifecycle = BucketLifecycleConfiguration::builder()
                .rules(rule)
                .build()
                .map_err(|e| {
                    ThumbnailError::Storage(format!("invalid lifecycle configuration: {}", e))
                })?;

            self.client
                .put_bucket_lifecycle_configuration()
                .bucket(bucket)
                .lifecycle_configuration(lifecycle)
                .send()
                .await
                .map_err(|e| {
                    ThumbnailError::Storage(format!(
                        "set lifecycle on bucket {} failed: {}",
                        bucket,
                        aws_sdk_s3::error::DisplayErrorContext(e)
                    ))
                })?;
        }

        Ok(true)
    }
}
