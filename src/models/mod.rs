use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, ThumbnailError>;

/// Target encoding for derived images. Buckets without an explicit format
/// keep the source encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = ThumbnailError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            other => Err(ThumbnailError::Configuration(format!(
                "Unknown image format '{}', expected 'png' or 'jpeg'",
                other
            ))),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Png => write!(f, "png"),
            ImageFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

/// Outcome of a single bucket-creation attempt during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStatus {
    Created,
    Exists,
    Error,
}

/// Summary of the one-shot startup provisioning pass, published to the
/// health endpoint. Written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketsInfo {
    pub thumbnail_buckets: HashMap<String, BucketStatus>,
    pub source_buckets: HashMap<String, BucketStatus>,
    pub error: bool,
}

impl BucketsInfo {
    pub fn new() -> Self {
        Self {
            thumbnail_buckets: HashMap::new(),
            source_buckets: HashMap::new(),
            error: false,
        }
    }

    /// True iff any recorded bucket attempt failed.
    pub fn has_errors(&self) -> bool {
        self.thumbnail_buckets
            .values()
            .chain(self.source_buckets.values())
            .any(|s| *s == BucketStatus::Error)
    }
}

impl Default for BucketsInfo {
    fn default() -> Self {
        Self::new()
    }
}
