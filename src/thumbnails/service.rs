use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::config::{BucketSettings, BucketsMap};
use crate::processing::resize_image_async;
use crate::storage::{StorageClient, StorageFileItem};
use crate::thumbnails::scanner::{ScanOutcome, StorageScanner};

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({"detail": "File not found"})),
    )
        .into_response()
}

/// Resolves thumbnail requests into HTTP responses. Never propagates errors
/// to the framework: misses become 404, unexpected storage failures 500.
pub struct ThumbnailService {
    storage_client: Arc<dyn StorageClient>,
    scanner: StorageScanner,
}

impl ThumbnailService {
    pub fn new(storage_client: Arc<dyn StorageClient>, buckets_map: Arc<BucketsMap>) -> Self {
        let scanner = StorageScanner::new(storage_client.clone(), buckets_map);
        Self {
            storage_client,
            scanner,
        }
    }

    pub async fn get_thumbnail(
        &self,
        bucket: &str,
        file_name: &str,
        if_none_match: Option<&str>,
    ) -> Response {
        let outcome = match self.scanner.scan_file(bucket, file_name).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(bucket = %bucket, file_name = %file_name, error = %e, "Scan failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        match outcome {
            ScanOutcome::BucketNotFound => {
                tracing::debug!(bucket = %bucket, "Bucket is not configured");
                not_found()
            }
            ScanOutcome::SourceFileNotFound => {
                tracing::debug!(bucket = %bucket, file_name = %file_name, "Source file was not found");
                not_found()
            }
            ScanOutcome::UseSourceFile(source_stat) => {
                self.serve_existing(source_stat, if_none_match).await
            }
            ScanOutcome::FileFound(_, thumbnail_stat) => {
                tracing::debug!(bucket = %bucket, file_name = %file_name, "Found thumbnail file");
                self.serve_existing(thumbnail_stat, if_none_match).await
            }
            ScanOutcome::CreateNew(source_stat, bucket_settings) => {
                self.create_and_upload(source_stat, bucket_settings, bucket)
                    .await
            }
        }
    }

    pub async fn get_thumbnail_by_alias(
        &self,
        source_bucket: &str,
        file_name: &str,
        alias: &str,
        if_none_match: Option<&str>,
    ) -> Response {
        match self.scanner.find_bucket_by_alias(source_bucket, alias) {
            Some(bucket) => self.get_thumbnail(&bucket, file_name, if_none_match).await,
            None => {
                tracing::debug!(source_bucket = %source_bucket, "Source bucket was not found");
                not_found()
            }
        }
    }

    /// Serves an object that already exists in the store: 304 when the
    /// client's etag still matches, a lazy byte stream otherwise.
    async fn serve_existing(
        &self,
        file_stat: StorageFileItem,
        if_none_match: Option<&str>,
    ) -> Response {
        if let Some(etag) = if_none_match {
            if etag == file_stat.etag {
                tracing::debug!(etag = %etag, "Requested file has the same etag");
                return (StatusCode::NOT_MODIFIED, [(header::ETAG, file_stat.etag)])
                    .into_response();
            }
        }

        let stream = match self
            .storage_client
            .open_stream(&file_stat.bucket, &file_stat.file_name)
            .await
        {
            Ok(Some(stream)) => stream,
            Ok(None) => return not_found(),
            Err(e) => {
                tracing::error!(bucket = %file_stat.bucket, file_name = %file_stat.file_name, error = %e, "Failed to open stream");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let etag = stream.etag.clone();
        let content_length = stream.content_length;
        let content_type = stream.content_type.clone();
        (
            StatusCode::OK,
            [
                (header::ETAG, etag),
                (header::CONTENT_LENGTH, content_length.to_string()),
                (header::CONTENT_TYPE, content_type),
            ],
            Body::from_stream(stream.into_body()),
        )
            .into_response()
    }

    /// Materializes a missing or stale derivative: load the source, resize
    /// off the event loop, upload bound to the source etag, stream back the
    /// in-memory result. Resize failures persist nothing.
    async fn create_and_upload(
        &self,
        source_stat: StorageFileItem,
        bucket_settings: BucketSettings,
        bucket: &str,
    ) -> Response {
        let source = match self
            .storage_client
            .load_file(&source_stat.bucket, &source_stat.file_name)
            .await
        {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::debug!(bucket = %source_stat.bucket, file_name = %source_stat.file_name, "Source file was not found");
                return not_found();
            }
            Err(e) => {
                tracing::error!(bucket = %source_stat.bucket, file_name = %source_stat.file_name, error = %e, "Failed to load source file");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        tracing::debug!(size_bytes = source.len(), "Source file was loaded into memory");

        let thumbnail = resize_image_async(
            source,
            bucket_settings.size.w,
            bucket_settings.size.h,
            bucket_settings.format,
            bucket_settings.format_args,
        )
        .await;

        let data = match (thumbnail.data, thumbnail.error) {
            (Some(data), None) => data,
            (_, error) => {
                tracing::warn!(bucket = %bucket, file_name = %source_stat.file_name, error = ?error, "Failed to create thumbnail");
                return not_found();
            }
        };

        let put_result = match self
            .storage_client
            .put_file(
                bucket,
                &source_stat.file_name,
                data.clone(),
                &thumbnail.content_type,
                Some(&source_stat.etag),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(bucket = %bucket, file_name = %source_stat.file_name, error = %e, "Failed to upload thumbnail");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        tracing::debug!(bucket = %bucket, file_name = %put_result.file_name, etag = %put_result.etag, "Thumbnail was uploaded to storage");

        (
            StatusCode::OK,
            [
                (header::ETAG, put_result.etag),
                (header::CONTENT_LENGTH, put_result.size.to_string()),
                (header::CONTENT_TYPE, thumbnail.content_type),
            ],
            Body::from_stream(futures::stream::once(async move {
                Ok::<_, std::io::Error>(data)
            })),
        )
            .into_response()
    }
}
