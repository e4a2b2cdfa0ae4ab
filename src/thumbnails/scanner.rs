use std::sync::Arc;

use crate::config::{BucketSettings, BucketsMap};
use crate::models::Result;
use crate::storage::{StorageClient, StorageFileItem};

/// Classification of a `(bucket, file)` request against the store. Variants
/// carry the stats the response path needs, so no call is repeated later.
#[derive(Debug)]
pub enum ScanOutcome {
    /// The bucket is not configured.
    BucketNotFound,
    /// The source object doesn't exist.
    SourceFileNotFound,
    /// The request targets the source bucket itself.
    UseSourceFile(StorageFileItem),
    /// A derivative exists and is still bound to the current source etag.
    FileFound(StorageFileItem, StorageFileItem),
    /// No valid derivative; one has to be materialized.
    CreateNew(StorageFileItem, BucketSettings),
}

pub struct StorageScanner {
    storage_client: Arc<dyn StorageClient>,
    buckets_map: Arc<BucketsMap>,
}

impl StorageScanner {
    pub fn new(storage_client: Arc<dyn StorageClient>, buckets_map: Arc<BucketsMap>) -> Self {
        Self {
            storage_client,
            buckets_map,
        }
    }

    pub async fn scan_file(&self, bucket: &str, file_name: &str) -> Result<ScanOutcome> {
        let Some(settings) = self.buckets_map.buckets.get(bucket) else {
            return Ok(ScanOutcome::BucketNotFound);
        };

        let source_stat = self
            .storage_client
            .get_file_stat(&settings.source_bucket, file_name)
            .await?;
        let Some(source_stat) = source_stat else {
            return Ok(ScanOutcome::SourceFileNotFound);
        };

        if bucket == settings.source_bucket {
            return Ok(ScanOutcome::UseSourceFile(source_stat));
        }

        // A derivative counts only while its parent etag still matches the
        // source; anything else is re-materialized.
        if let Some(thumbnail_stat) = self.storage_client.get_file_stat(bucket, file_name).await? {
            if thumbnail_stat.parent_etag.as_deref() == Some(source_stat.etag.as_str()) {
                return Ok(ScanOutcome::FileFound(source_stat, thumbnail_stat));
            }
        }

        Ok(ScanOutcome::CreateNew(source_stat, settings.clone()))
    }

    /// Resolves an alias route: known aliases map to their bucket, unknown
    /// ones degrade to the source bucket itself. `None` when `source_bucket`
    /// isn't a source at all.
    pub fn find_bucket_by_alias(&self, source_bucket: &str, alias: &str) -> Option<String> {
        if !self.buckets_map.all_source_buckets.contains(source_bucket) {
            return None;
        }

        Some(
            self.buckets_map
                .alias_map
                .get(alias)
                .cloned()
                .unwrap_or_else(|| source_bucket.to_string()),
        )
    }
}
