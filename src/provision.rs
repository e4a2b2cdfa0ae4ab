use std::sync::Arc;

use crate::config::BucketsMap;
use crate::models::{BucketStatus, BucketsInfo};
use crate::storage::StorageClient;

/// One-shot startup provisioning: thumbnail buckets get their configured
/// TTL, source buckets never expire. Best-effort and never retried; the
/// outcome is published to the health endpoint instead.
pub struct BucketsService {
    storage_client: Arc<dyn StorageClient>,
    buckets_map: Arc<BucketsMap>,
}

impl BucketsService {
    pub fn new(storage_client: Arc<dyn StorageClient>, buckets_map: Arc<BucketsMap>) -> Self {
        Self {
            storage_client,
            buckets_map,
        }
    }

    pub async fn create_buckets(&self) -> BucketsInfo {
        let mut result = BucketsInfo::new();

        for (name, settings) in &self.buckets_map.buckets {
            if *name == self.buckets_map.source_bucket {
                continue;
            }
            result
                .thumbnail_buckets
                .insert(name.clone(), self.create_bucket(name, settings.life_time_days).await);
        }

        for source in &self.buckets_map.all_source_buckets {
            if *source == self.buckets_map.source_bucket {
                continue;
            }
            result
                .source_buckets
                .insert(source.clone(), self.create_bucket(source, 0).await);
        }

        let default_source = self.buckets_map.source_bucket.clone();
        let status = self.create_bucket(&default_source, 0).await;
        result.source_buckets.insert(default_source, status);

        result.error = result.has_errors();
        result
    }

    async fn create_bucket(&self, bucket: &str, life_time_days: u32) -> BucketStatus {
        match self
            .storage_client
            .try_create_bucket(bucket, life_time_days)
            .await
        {
            Ok(true) => {
                tracing::info!(bucket = %bucket, life_time_days, "Bucket was created (zero days means infinity)");
                BucketStatus::Created
            }
            Ok(false) => {
                tracing::info!(bucket = %bucket, "Bucket already exists, skip it");
                BucketStatus::Exists
            }
            Err(e) => {
                tracing::warn!(bucket = %bucket, error = %e, "Failed to create bucket");
                BucketStatus::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppSettings, BucketsMap, ImageSize, S3Settings, ServerSettings};
    use crate::thumbnails::testing::{buckets_map_fixture, MemoryStorage};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn creates_thumbnail_and_source_buckets() {
        let storage = Arc::new(MemoryStorage::new());
        let service = BucketsService::new(storage.clone(), Arc::new(buckets_map_fixture()));

        let info = service.create_buckets().await;
        assert!(!info.error);
        assert_eq!(
            info.thumbnail_buckets.get("thumbs"),
            Some(&BucketStatus::Created)
        );
        assert_eq!(
            info.source_buckets.get("images"),
            Some(&BucketStatus::Created)
        );

        // thumbnail buckets carry their TTL, sources never expire
        assert_eq!(storage.created_ttl("thumbs"), Some(30));
        assert_eq!(storage.created_ttl("images"), Some(0));
    }

    #[tokio::test]
    async fn existing_buckets_are_reported_as_such() {
        let storage = Arc::new(MemoryStorage::new());
        storage.mark_existing("images");
        let service = BucketsService::new(storage, Arc::new(buckets_map_fixture()));

        let info = service.create_buckets().await;
        assert!(!info.error);
        assert_eq!(
            info.source_buckets.get("images"),
            Some(&BucketStatus::Exists)
        );
    }

    #[tokio::test]
    async fn failures_set_the_error_flag() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_bucket("thumbs");
        let service = BucketsService::new(storage, Arc::new(buckets_map_fixture()));

        let info = service.create_buckets().await;
        assert!(info.error);
        assert_eq!(
            info.thumbnail_buckets.get("thumbs"),
            Some(&BucketStatus::Error)
        );
        assert_eq!(
            info.source_buckets.get("images"),
            Some(&BucketStatus::Created)
        );
    }

    #[tokio::test]
    async fn default_source_alone_is_provisioned() {
        let settings = AppSettings {
            s3: S3Settings::default(),
            buckets: BTreeMap::new(),
            source_bucket: Some("images".to_string()),
            size: ImageSize::default(),
            log_level: "info".to_string(),
            log_fmt: "text".to_string(),
            sqlite: "sqlite::memory:".to_string(),
            server: ServerSettings::default(),
        };
        let map = BucketsMap::derive(&settings).unwrap();

        let storage = Arc::new(MemoryStorage::new());
        let service = BucketsService::new(storage.clone(), Arc::new(map));

        let info = service.create_buckets().await;
        assert!(!info.error);
        assert!(info.thumbnail_buckets.is_empty());
        assert_eq!(
            info.source_buckets.get("images"),
            Some(&BucketStatus::Created)
        );
        assert_eq!(storage.created_ttl("images"), Some(0));
    }
}
