//! In-memory storage fake shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::config::{
    AppSettings, BucketSettings, BucketsMap, ImageSize, S3Settings, ServerSettings,
};
use crate::models::{Result, ThumbnailError};
use crate::storage::{BodyStream, StorageClient, StorageFileItem, StorageResponse};

/// One thumbnail bucket `thumbs` (100x100, alias `small`) over the default
/// source `images`.
pub(crate) fn buckets_map_fixture() -> BucketsMap {
    let mut buckets = BTreeMap::new();
    buckets.insert(
        "thumbs".to_string(),
        BucketSettings {
            size: ImageSize { w: 100, h: 100 },
            life_time_days: 30,
            source_bucket: "images".to_string(),
            alias: Some("small".to_string()),
            format: None,
            format_args: None,
        },
    );

    let settings = AppSettings {
        s3: S3Settings::default(),
        buckets,
        source_bucket: Some("images".to_string()),
        size: ImageSize::default(),
        log_level: "info".to_string(),
        log_fmt: "text".to_string(),
        sqlite: "sqlite::memory:".to_string(),
        server: ServerSettings::default(),
    };
    BucketsMap::derive(&settings).unwrap()
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    etag: String,
    parent_etag: Option<String>,
}

/// Counts live streams via `open_streams` so tests can assert that every
/// code path releases what it opened.
pub(crate) struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    buckets: Mutex<HashMap<String, u32>>,
    fail_create: Mutex<HashSet<String>>,
    pub(crate) open_streams: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            fail_create: Mutex::new(HashSet::new()),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn seed(
        &self,
        bucket: &str,
        file_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> String {
        self.insert(bucket, file_name, data, content_type, None)
    }

    pub(crate) fn seed_derived(
        &self,
        bucket: &str,
        file_name: &str,
        data: Bytes,
        content_type: &str,
        parent_etag: &str,
    ) -> String {
        self.insert(
            bucket,
            file_name,
            data,
            content_type,
            Some(parent_etag.to_string()),
        )
    }

    fn insert(
        &self,
        bucket: &str,
        file_name: &str,
        data: Bytes,
        content_type: &str,
        parent_etag: Option<String>,
    ) -> String {
        let etag = compute_etag(&data);
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), file_name.to_string()),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                etag: etag.clone(),
                parent_etag,
            },
        );
        etag
    }

    /// Stored bytes and parent etag, for assertions on persisted derivatives.
    pub(crate) fn object(&self, bucket: &str, file_name: &str) -> Option<(Bytes, Option<String>)> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), file_name.to_string()))
            .map(|o| (o.data.clone(), o.parent_etag.clone()))
    }

    pub(crate) fn mark_existing(&self, bucket: &str) {
        self.buckets.lock().unwrap().insert(bucket.to_string(), 0);
    }

    pub(crate) fn fail_bucket(&self, bucket: &str) {
        self.fail_create.lock().unwrap().insert(bucket.to_string());
    }

    /// TTL a bucket was created with, `None` when it was never created here.
    pub(crate) fn created_ttl(&self, bucket: &str) -> Option<u32> {
        self.buckets.lock().unwrap().get(bucket).copied()
    }

    fn stat(&self, bucket: &str, file_name: &str, object: &StoredObject) -> StorageFileItem {
        StorageFileItem {
            bucket: bucket.to_string(),
            file_name: file_name.to_string(),
            size: object.data.len() as u64,
            content_type: object.content_type.clone(),
            etag: object.etag.clone(),
            parent_etag: object.parent_etag.clone(),
        }
    }
}

fn compute_etag(data: &[u8]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

struct GuardedStream {
    chunks: std::vec::IntoIter<Bytes>,
    open_streams: Arc<AtomicUsize>,
}

impl Stream for GuardedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.chunks.next().map(Ok))
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn get_file_stat(
        &self,
        bucket: &str,
        file_name: &str,
    ) -> Result<Option<StorageFileItem>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&(bucket.to_string(), file_name.to_string()))
            .map(|o| self.stat(bucket, file_name, o)))
    }

    async fn open_stream(&self, bucket: &str, file_name: &str) -> Result<Option<StorageResponse>> {
        let object = {
            let objects = self.objects.lock().unwrap();
            objects
                .get(&(bucket.to_string(), file_name.to_string()))
                .cloned()
        };
        let Some(object) = object else {
            return Ok(None);
        };

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Bytes> = (0..object.data.len())
            .step_by(1024)
            .map(|start| {
                object
                    .data
                    .slice(start..(start + 1024).min(object.data.len()))
            })
            .collect();
        let body: BodyStream = Box::pin(GuardedStream {
            chunks: chunks.into_iter(),
            open_streams: self.open_streams.clone(),
        });

        Ok(Some(StorageResponse::new(
            object.data.len() as u64,
            object.content_type,
            object.etag,
            body,
        )))
    }

    async fn load_file(&self, bucket: &str, file_name: &str) -> Result<Option<Bytes>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&(bucket.to_string(), file_name.to_string()))
            .map(|o| o.data.clone()))
    }

    async fn put_file(
        &self,
        bucket: &str,
        file_name: &str,
        content: Bytes,
        content_type: &str,
        parent_etag: Option<&str>,
    ) -> Result<StorageFileItem> {
        let etag = self.insert(
            bucket,
            file_name,
            content.clone(),
            content_type,
            parent_etag.map(str::to_string),
        );
        Ok(StorageFileItem {
            bucket: bucket.to_string(),
            file_name: file_name.to_string(),
            size: content.len() as u64,
            content_type: content_type.to_string(),
            etag,
            parent_etag: parent_etag.map(str::to_string),
        })
    }

    async fn try_create_bucket(&self, bucket: &str, life_time_days: u32) -> Result<bool> {
        if self.fail_create.lock().unwrap().contains(bucket) {
            return Err(ThumbnailError::Storage(format!(
                "injected failure creating bucket {}",
                bucket
            )));
        }

        let mut buckets = self.buckets.lock().unwrap();
        if buckets.contains_key(bucket) {
            return Ok(false);
        }
        buckets.insert(bucket.to_string(), life_time_days);
        Ok(true)
    }
}
