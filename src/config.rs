use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use config::{Config, Environment, File, FileFormat};
use serde::de::value::MapAccessDeserializer;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::models::{ImageFormat, Result, ThumbnailError};

/// Thumbnail dimensions. Accepts either a structured `{w, h}` value or the
/// compact `"{W}x{H}"` string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub w: u32,
    pub h: u32,
}

impl Default for ImageSize {
    fn default() -> Self {
        Self { w: 200, h: 200 }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

impl FromStr for ImageSize {
    type Err = ThumbnailError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('x').filter(|p| !p.is_empty()).collect();
        if parts.len() == 2 {
            if let (Ok(w), Ok(h)) = (parts[0].parse::<u32>(), parts[1].parse::<u32>()) {
                if w > 0 && h > 0 {
                    return Ok(ImageSize { w, h });
                }
            }
        }

        Err(ThumbnailError::Configuration(format!(
            "Couldn't parse '{}' into an image size, expected '{{W}}x{{H}}'",
            s
        )))
    }
}

impl<'de> Deserialize<'de> for ImageSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SizeVisitor;

        impl<'de> Visitor<'de> for SizeVisitor {
            type Value = ImageSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an image size map {w, h} or a '{W}x{H}' string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ImageSize, E> {
                v.parse().map_err(de::Error::custom)
            }

            fn visit_map<M: MapAccess<'de>>(
                self,
                map: M,
            ) -> std::result::Result<ImageSize, M::Error> {
                #[derive(Deserialize)]
                struct Fields {
                    w: u32,
                    h: u32,
                }

                let fields = Fields::deserialize(MapAccessDeserializer::new(map))?;
                if fields.w == 0 || fields.h == 0 {
                    return Err(de::Error::custom("image size must be greater than 0x0"));
                }
                Ok(ImageSize {
                    w: fields.w,
                    h: fields.h,
                })
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

/// S3 / MinIO connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    /// Host and port, without a scheme.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Storage region, eu-west-1 by default.
    pub region: String,
    /// Use a secure connection, false by default.
    pub use_tls: bool,
    /// Trust the server certificate without validating it, true by default.
    pub trust_cert: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: "MINIO_AK".to_string(),
            secret_key: "MINIO_SK".to_string(),
            region: "eu-west-1".to_string(),
            use_tls: false,
            trust_cert: true,
        }
    }
}

/// Parses an S3 connection URL of the form
/// `scheme://ak:sk@host:port/region[/bucket]`. The optional trailing bucket
/// becomes the default source bucket when none is configured explicitly.
fn parse_s3_url(value: &str) -> Result<(S3Settings, Option<String>)> {
    let url = Url::parse(value).map_err(|e| {
        ThumbnailError::Configuration(format!("Invalid S3 connection string '{}': {}", value, e))
    })?;

    let host = url.host_str().ok_or_else(|| {
        ThumbnailError::Configuration(format!("S3 connection string '{}' has no host", value))
    })?;

    let mut segments = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string))
        .into_iter()
        .flatten();
    let region = segments.next().ok_or_else(|| {
        ThumbnailError::Configuration(format!(
            "S3 connection string '{}' doesn't contain a region path segment",
            value
        ))
    })?;
    let source_bucket = segments.next();

    let secure = url.scheme() == "https";
    let endpoint = match url.port_or_known_default() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let settings = S3Settings {
        endpoint,
        access_key: url.username().to_string(),
        secret_key: url.password().unwrap_or_default().to_string(),
        region,
        use_tls: secure,
        trust_cert: secure,
    };
    Ok((settings, source_bucket))
}

/// Raw `s3` node: either structured settings or a connection URL string.
#[derive(Debug, Clone)]
enum S3Source {
    Url(String),
    Settings(S3Settings),
}

impl<'de> Deserialize<'de> for S3Source {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SourceVisitor;

        impl<'de> Visitor<'de> for SourceVisitor {
            type Value = S3Source;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an S3 settings map or a connection URL string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<S3Source, E> {
                Ok(S3Source::Url(v.to_string()))
            }

            fn visit_map<M: MapAccess<'de>>(
                self,
                map: M,
            ) -> std::result::Result<S3Source, M::Error> {
                S3Settings::deserialize(MapAccessDeserializer::new(map)).map(S3Source::Settings)
            }
        }

        deserializer.deserialize_any(SourceVisitor)
    }
}

/// Codec parameters forwarded to the image encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CodecParams {
    /// JPEG quality, 85 when unset.
    pub quality: Option<u8>,
    /// Spend extra effort on a smaller encoding.
    pub optimize: bool,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            quality: None,
            optimize: true,
        }
    }
}

/// Per-bucket thumbnail settings as found in the raw configuration. Accepts
/// either a structured map or a query-string form
/// `size=WxH&source_bucket=..&life_time_days=N&alias=..&format=..`.
#[derive(Debug, Clone, Default)]
struct RawBucketSettings {
    size: Option<ImageSize>,
    life_time_days: Option<u32>,
    source_bucket: Option<String>,
    alias: Option<String>,
    format: Option<ImageFormat>,
    format_args: Option<CodecParams>,
}

fn parse_bucket_query(s: &str) -> Result<RawBucketSettings> {
    let mut result = RawBucketSettings::default();
    for (key, value) in url::form_urlencoded::parse(s.as_bytes()) {
        match key.as_ref() {
            "size" if result.size.is_none() => result.size = Some(value.parse()?),
            "life_time_days" if result.life_time_days.is_none() => {
                let days = value.parse::<u32>().map_err(|_| {
                    ThumbnailError::Configuration(format!(
                        "Couldn't parse life_time_days '{}' as a number of days",
                        value
                    ))
                })?;
                result.life_time_days = Some(days);
            }
            "source_bucket" if result.source_bucket.is_none() => {
                result.source_bucket = Some(value.into_owned());
            }
            "alias" if result.alias.is_none() => result.alias = Some(value.into_owned()),
            "format" if result.format.is_none() => result.format = Some(value.parse()?),
            _ => {}
        }
    }
    Ok(result)
}

impl<'de> Deserialize<'de> for RawBucketSettings {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BucketVisitor;

        impl<'de> Visitor<'de> for BucketVisitor {
            type Value = RawBucketSettings;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a bucket settings map or a query string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                parse_bucket_query(v).map_err(de::Error::custom)
            }

            fn visit_map<M: MapAccess<'de>>(
                self,
                map: M,
            ) -> std::result::Result<Self::Value, M::Error> {
                #[derive(Deserialize, Default)]
                #[serde(default)]
                struct Fields {
                    size: Option<ImageSize>,
                    life_time_days: Option<u32>,
                    source_bucket: Option<String>,
                    alias: Option<String>,
                    format: Option<ImageFormat>,
                    format_args: Option<CodecParams>,
                }

                let fields = Fields::deserialize(MapAccessDeserializer::new(map))?;
                Ok(RawBucketSettings {
                    size: fields.size,
                    life_time_days: fields.life_time_days,
                    source_bucket: fields.source_bucket,
                    alias: fields.alias,
                    format: fields.format,
                    format_args: fields.format_args,
                })
            }
        }

        deserializer.deserialize_any(BucketVisitor)
    }
}

/// Fully-resolved settings of one thumbnail bucket. `source_bucket` is always
/// non-empty after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub size: ImageSize,
    /// How many days objects in the bucket live. Zero means never expire.
    pub life_time_days: u32,
    pub source_bucket: String,
    /// Optional label for the alias route.
    pub alias: Option<String>,
    /// Target encoding for derivatives; None keeps the source format.
    pub format: Option<ImageFormat>,
    pub format_args: Option<CodecParams>,
}

const DEFAULT_LIFE_TIME_DAYS: u32 = 30;

/// HTTP transport options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawAppSettings {
    s3: Option<S3Source>,
    buckets: BTreeMap<String, RawBucketSettings>,
    source_bucket: Option<String>,
    size: Option<ImageSize>,
    log_level: Option<String>,
    log_fmt: Option<String>,
    sqlite: Option<String>,
    server: Option<ServerSettings>,
}

/// Immutable application settings, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSettings {
    pub s3: S3Settings,
    pub buckets: BTreeMap<String, BucketSettings>,
    /// Default bucket with source images; individual buckets may override it.
    pub source_bucket: Option<String>,
    /// Default thumbnail size for buckets without an explicit one.
    pub size: ImageSize,
    pub log_level: String,
    /// Log output format, `text` or `json`.
    pub log_fmt: String,
    /// Connection string of the request-stats database.
    pub sqlite: String,
    pub server: ServerSettings,
}

impl AppSettings {
    /// Loads settings from the default locations: `config.json`, process
    /// environment (after `.env` has been applied by the caller) and an
    /// optional secrets directory from `SECRETS_DIR`.
    pub fn load() -> Result<AppSettings> {
        ConfigLoader::default().load()
    }

    fn resolve(raw: RawAppSettings) -> Result<AppSettings> {
        let mut source_bucket = raw.source_bucket.filter(|s| !s.is_empty());
        let s3 = match raw.s3 {
            None => S3Settings::default(),
            Some(S3Source::Settings(settings)) => settings,
            Some(S3Source::Url(url)) => {
                let (settings, url_bucket) = parse_s3_url(&url)?;
                source_bucket = source_bucket.or(url_bucket);
                settings
            }
        };

        let default_size = raw.size.unwrap_or_default();
        let mut buckets = BTreeMap::new();
        for (name, raw_bucket) in raw.buckets {
            let bucket_source = raw_bucket
                .source_bucket
                .filter(|s| !s.is_empty())
                .or_else(|| source_bucket.clone())
                .ok_or_else(|| {
                    ThumbnailError::Configuration(format!(
                        "For bucket '{}' source_bucket was not set, check configuration or \
                         set root 'source_bucket' as a fallback value",
                        name
                    ))
                })?;

            buckets.insert(
                name,
                BucketSettings {
                    size: raw_bucket.size.unwrap_or(default_size),
                    life_time_days: raw_bucket.life_time_days.unwrap_or(DEFAULT_LIFE_TIME_DAYS),
                    source_bucket: bucket_source,
                    alias: raw_bucket.alias.filter(|a| !a.is_empty()),
                    format: raw_bucket.format,
                    format_args: raw_bucket.format_args,
                },
            );
        }

        Ok(AppSettings {
            s3,
            buckets,
            source_bucket,
            size: default_size,
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
            log_fmt: raw.log_fmt.unwrap_or_else(|| "text".to_string()),
            sqlite: raw
                .sqlite
                .unwrap_or_else(|| "sqlite://request_stats.db?mode=rwc".to_string()),
            server: raw.server.unwrap_or_default(),
        })
    }
}

/// Layered configuration reader. Precedence, lowest first: file-backed
/// secrets, the `.env` file, the JSON config file, environment variables,
/// explicit overrides. The `.env` file is read directly instead of being
/// exported into the process environment, so a real environment variable
/// always beats it.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub config_file: PathBuf,
    pub env_file: PathBuf,
    pub secrets_dir: Option<PathBuf>,
    pub overrides: Vec<(String, String)>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("config.json"),
            env_file: PathBuf::from(".env"),
            secrets_dir: std::env::var_os("SECRETS_DIR").map(PathBuf::from),
            overrides: Vec::new(),
        }
    }
}

impl ConfigLoader {
    pub fn load(&self) -> Result<AppSettings> {
        let mut builder = Config::builder();

        if let Some(dir) = &self.secrets_dir {
            for (key, value) in read_secrets_dir(dir)? {
                builder = builder
                    .set_default(key.as_str(), value)
                    .map_err(|e| ThumbnailError::Configuration(e.to_string()))?;
            }
        }

        if let Ok(entries) = dotenvy::from_path_iter(&self.env_file) {
            for entry in entries {
                let (key, value) = entry.map_err(|e| {
                    ThumbnailError::Configuration(format!(
                        "Can't read env file {}: {}",
                        self.env_file.display(),
                        e
                    ))
                })?;
                let key = key.to_lowercase().replace("__", ".");
                builder = builder
                    .set_default(key.as_str(), value)
                    .map_err(|e| ThumbnailError::Configuration(e.to_string()))?;
            }
        }

        builder = builder
            .add_source(
                File::from(self.config_file.clone())
                    .format(FileFormat::Json)
                    .required(false),
            )
            .add_source(Environment::default().separator("__"));

        for (key, value) in &self.overrides {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .map_err(|e| ThumbnailError::Configuration(e.to_string()))?;
        }

        let raw: RawAppSettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ThumbnailError::Configuration(e.to_string()))?;

        AppSettings::resolve(raw)
    }
}

/// Reads a secrets directory: each file name is a (nested, `__`-delimited)
/// key, its trimmed content the value.
fn read_secrets_dir(dir: &std::path::Path) -> Result<Vec<(String, String)>> {
    let mut result = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ThumbnailError::Configuration(format!("Can't read secrets dir {}: {}", dir.display(), e))
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ThumbnailError::Configuration(e.to_string()))?;
        if !entry.path().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_lowercase) else {
            continue;
        };
        let content = std::fs::read_to_string(entry.path())
            .map_err(|e| ThumbnailError::Configuration(e.to_string()))?;
        result.push((name.replace("__", "."), content.trim().to_string()));
    }

    result.sort();
    Ok(result)
}

/// Routing view over the configured buckets, derived once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketsMap {
    /// The canonical default source bucket.
    pub source_bucket: String,
    /// Every configured bucket plus a synthetic entry for the default source.
    pub buckets: BTreeMap<String, BucketSettings>,
    /// Every bucket that acts as a source for some derived bucket.
    pub all_source_buckets: BTreeSet<String>,
    /// Alias label to derived bucket name.
    pub alias_map: BTreeMap<String, String>,
}

impl BucketsMap {
    /// Deterministic derivation from resolved settings. Fails when no source
    /// bucket can be established at all.
    pub fn derive(settings: &AppSettings) -> Result<BucketsMap> {
        let source_bucket = settings
            .source_bucket
            .clone()
            .or_else(|| {
                settings
                    .buckets
                    .values()
                    .map(|b| b.source_bucket.clone())
                    .next()
            })
            .ok_or_else(|| {
                ThumbnailError::Configuration(
                    "No source bucket is configured: set root 'source_bucket' or configure \
                     at least one bucket with its own"
                        .to_string(),
                )
            })?;

        let mut alias_map = BTreeMap::new();
        let mut all_source_buckets = BTreeSet::new();
        let mut buckets = BTreeMap::new();
        for (name, cfg) in &settings.buckets {
            if let Some(alias) = &cfg.alias {
                alias_map.insert(alias.clone(), name.clone());
            }
            all_source_buckets.insert(cfg.source_bucket.clone());
            buckets.insert(name.clone(), cfg.clone());
        }

        all_source_buckets.insert(source_bucket.clone());
        buckets.insert(
            source_bucket.clone(),
            BucketSettings {
                size: settings.size,
                life_time_days: 0,
                source_bucket: source_bucket.clone(),
                alias: None,
                format: None,
                format_args: None,
            },
        );

        Ok(BucketsMap {
            source_bucket,
            buckets,
            all_source_buckets,
            alias_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader_with_json(json: &str) -> (tempfile::TempDir, ConfigLoader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let loader = ConfigLoader {
            config_file: path,
            env_file: dir.path().join(".env"),
            secrets_dir: None,
            overrides: Vec::new(),
        };
        (dir, loader)
    }

    #[test]
    fn image_size_parses_string_form() {
        let size: ImageSize = "120x80".parse().unwrap();
        assert_eq!(size, ImageSize { w: 120, h: 80 });

        assert!("120".parse::<ImageSize>().is_err());
        assert!("axb".parse::<ImageSize>().is_err());
        assert!("0x10".parse::<ImageSize>().is_err());
        assert!("".parse::<ImageSize>().is_err());
    }

    #[test]
    fn image_size_display_round_trips() {
        let size = ImageSize { w: 64, h: 48 };
        assert_eq!(size.to_string().parse::<ImageSize>().unwrap(), size);
    }

    #[test]
    fn s3_url_maps_to_settings() {
        let (s3, bucket) =
            parse_s3_url("https://ak:sk@minio.local:9000/eu-central-1/images").unwrap();
        assert_eq!(s3.endpoint, "minio.local:9000");
        assert_eq!(s3.access_key, "ak");
        assert_eq!(s3.secret_key, "sk");
        assert_eq!(s3.region, "eu-central-1");
        assert!(s3.use_tls);
        assert!(s3.trust_cert);
        assert_eq!(bucket.as_deref(), Some("images"));
    }

    #[test]
    fn s3_url_without_bucket_or_port() {
        let (s3, bucket) = parse_s3_url("http://ak:sk@localhost/eu-west-1").unwrap();
        assert_eq!(s3.endpoint, "localhost:80");
        assert!(!s3.use_tls);
        assert!(!s3.trust_cert);
        assert_eq!(bucket, None);
    }

    #[test]
    fn s3_url_requires_region() {
        assert!(parse_s3_url("http://ak:sk@localhost:9000").is_err());
        assert!(parse_s3_url("not a url").is_err());
    }

    #[test]
    fn bucket_query_string_parses() {
        let raw =
            parse_bucket_query("size=100x100&source_bucket=images&life_time_days=7&alias=small")
                .unwrap();
        assert_eq!(raw.size, Some(ImageSize { w: 100, h: 100 }));
        assert_eq!(raw.source_bucket.as_deref(), Some("images"));
        assert_eq!(raw.life_time_days, Some(7));
        assert_eq!(raw.alias.as_deref(), Some("small"));
        assert_eq!(raw.format, None);
    }

    #[test]
    fn bucket_query_string_rejects_bad_size() {
        assert!(parse_bucket_query("size=wide").is_err());
        assert!(parse_bucket_query("life_time_days=sometimes").is_err());
    }

    #[test]
    fn loads_structured_config_with_defaults() {
        let (_dir, loader) = loader_with_json(
            r#"{
                "s3": {"endpoint": "s3.local:9000", "access_key": "ak", "secret_key": "sk"},
                "source_bucket": "images",
                "size": "150x150",
                "buckets": {
                    "thumbs": {"alias": "small"},
                    "banners": "size=600x200&life_time_days=0"
                }
            }"#,
        );

        let settings = loader.load().unwrap();
        assert_eq!(settings.s3.endpoint, "s3.local:9000");
        assert_eq!(settings.s3.region, "eu-west-1");
        assert_eq!(settings.source_bucket.as_deref(), Some("images"));

        let thumbs = &settings.buckets["thumbs"];
        assert_eq!(thumbs.size, ImageSize { w: 150, h: 150 });
        assert_eq!(thumbs.life_time_days, 30);
        assert_eq!(thumbs.source_bucket, "images");
        assert_eq!(thumbs.alias.as_deref(), Some("small"));

        let banners = &settings.buckets["banners"];
        assert_eq!(banners.size, ImageSize { w: 600, h: 200 });
        assert_eq!(banners.life_time_days, 0);
        assert_eq!(banners.source_bucket, "images");
    }

    #[test]
    fn s3_url_supplies_default_source_bucket() {
        let (_dir, loader) = loader_with_json(
            r#"{
                "s3": "http://ak:sk@localhost:9000/eu-west-1/originals",
                "buckets": {"thumbs": {}}
            }"#,
        );

        let settings = loader.load().unwrap();
        assert_eq!(settings.source_bucket.as_deref(), Some("originals"));
        assert_eq!(settings.buckets["thumbs"].source_bucket, "originals");
    }

    #[test]
    fn explicit_source_bucket_wins_over_url_bucket() {
        let (_dir, loader) = loader_with_json(
            r#"{
                "s3": "http://ak:sk@localhost:9000/eu-west-1/originals",
                "source_bucket": "images",
                "buckets": {}
            }"#,
        );

        let settings = loader.load().unwrap();
        assert_eq!(settings.source_bucket.as_deref(), Some("images"));
    }

    #[test]
    fn bucket_without_any_source_fails() {
        let (_dir, loader) = loader_with_json(r#"{"buckets": {"thumbs": {}}}"#);
        let err = loader.load().unwrap_err();
        assert!(err.to_string().contains("thumbs"), "got: {}", err);
    }

    #[test]
    fn malformed_size_fails_at_load() {
        let (_dir, loader) =
            loader_with_json(r#"{"source_bucket": "images", "size": "200by200"}"#);
        assert!(loader.load().is_err());
    }

    #[test]
    fn overrides_win_over_file() {
        let (_dir, mut loader) = loader_with_json(r#"{"source_bucket": "images"}"#);
        loader
            .overrides
            .push(("source_bucket".to_string(), "photos".to_string()));

        let settings = loader.load().unwrap();
        assert_eq!(settings.source_bucket.as_deref(), Some("photos"));
    }

    #[test]
    fn env_file_sits_below_the_config_file() {
        let (dir, loader) = loader_with_json(r#"{"source_bucket": "images"}"#);
        std::fs::write(
            dir.path().join(".env"),
            "SOURCE_BUCKET=from-dotenv\nSIZE=64x64\n",
        )
        .unwrap();

        let settings = loader.load().unwrap();
        // config.json wins over .env, .env still fills what the file omits
        assert_eq!(settings.source_bucket.as_deref(), Some("images"));
        assert_eq!(settings.size, ImageSize { w: 64, h: 64 });
    }

    #[test]
    fn secrets_are_the_weakest_source() {
        let (dir, mut loader) = loader_with_json(r#"{"source_bucket": "images"}"#);
        let secrets = dir.path().join("secrets");
        std::fs::create_dir(&secrets).unwrap();
        std::fs::write(secrets.join("source_bucket"), "from-secret\n").unwrap();
        std::fs::write(secrets.join("s3__access_key"), "secret-ak\n").unwrap();
        loader.secrets_dir = Some(secrets);

        let settings = loader.load().unwrap();
        // file beats the secret for source_bucket, the secret fills the rest
        assert_eq!(settings.source_bucket.as_deref(), Some("images"));
        assert_eq!(settings.s3.access_key, "secret-ak");
    }

    #[test]
    fn derive_builds_buckets_map() {
        let (_dir, loader) = loader_with_json(
            r#"{
                "source_bucket": "images",
                "size": "100x100",
                "buckets": {
                    "thumbs": {"alias": "small"},
                    "previews": {"source_bucket": "raw-images", "alias": "preview"}
                }
            }"#,
        );

        let settings = loader.load().unwrap();
        let map = BucketsMap::derive(&settings).unwrap();

        assert_eq!(map.source_bucket, "images");
        assert_eq!(map.alias_map["small"], "thumbs");
        assert_eq!(map.alias_map["preview"], "previews");
        assert!(map.all_source_buckets.contains("images"));
        assert!(map.all_source_buckets.contains("raw-images"));
        assert_eq!(map.all_source_buckets.len(), 2);

        // synthetic entry for the default source serves the source directly
        let source_entry = &map.buckets["images"];
        assert_eq!(source_entry.source_bucket, "images");
        assert_eq!(source_entry.size, ImageSize { w: 100, h: 100 });
        assert_eq!(source_entry.life_time_days, 0);

        for bucket in map.buckets.values() {
            assert!(
                map.all_source_buckets.contains(&bucket.source_bucket)
                    || bucket.source_bucket == map.source_bucket
            );
        }
    }

    #[test]
    fn derive_falls_back_to_first_bucket_source() {
        let (_dir, loader) = loader_with_json(
            r#"{"buckets": {"thumbs": {"source_bucket": "images"}}}"#,
        );

        let settings = loader.load().unwrap();
        let map = BucketsMap::derive(&settings).unwrap();
        assert_eq!(map.source_bucket, "images");
        assert!(map.all_source_buckets.contains("images"));
        assert!(map.buckets.contains_key("images"));
    }

    #[test]
    fn derive_without_any_source_fails() {
        let settings = AppSettings::resolve(RawAppSettings::default()).unwrap();
        assert!(BucketsMap::derive(&settings).is_err());
    }

    #[test]
    fn derive_is_deterministic() {
        let (_dir, loader) = loader_with_json(
            r#"{
                "source_bucket": "images",
                "buckets": {
                    "a": {"alias": "one"},
                    "b": {"alias": "two", "source_bucket": "other"},
                    "c": "size=32x32"
                }
            }"#,
        );

        let settings = loader.load().unwrap();
        assert_eq!(
            BucketsMap::derive(&settings).unwrap(),
            BucketsMap::derive(&settings).unwrap()
        );
    }
}
