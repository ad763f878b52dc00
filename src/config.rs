use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MediaError, MediaResult};

pub const DEFAULT_BOOTSTRAP_PATH: &str = "media-pipeline.json";

/// Top-level bootstrap configuration, deserialized once at startup and
/// immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub s3: S3Config,
    pub rabbit: RabbitConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub temp: Option<TempConfig>,
    pub profiles: IndexMap<String, ProfileConfig>,
    #[serde(default)]
    pub entities: EntityConfig,
    /// Optional process memory budget for the image engine, e.g. "512M".
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// Database connection; falls back to `DATABASE_URL` when absent.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_cache_seconds")]
    pub cache_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitConfig {
    pub host: String,
    #[serde(default = "default_rabbit_port")]
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default)]
    pub dlq: Option<String>,
}

impl RabbitConfig {
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.pass,
            self.host,
            self.port,
            urlencode_vhost(&self.vhost)
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_bytes: default_max_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempConfig {
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    pub prefix: String,
    #[serde(default)]
    pub keep_original: bool,
    #[serde(default = "default_max_original_long_edge")]
    pub max_original_long_edge: u32,
    #[serde(default)]
    pub codecs: Vec<String>,
    #[serde(default)]
    pub variants: IndexMap<String, VariantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantConfig {
    pub w: u32,
    pub h: u32,
    #[serde(default = "default_fit")]
    pub fit: String,
}

/// Overrides for the persistence table names.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConfig {
    #[serde(default = "default_asset_table")]
    pub asset_table: String,
    #[serde(default = "default_variant_table")]
    pub variant_table: String,
    #[serde(default = "default_link_table")]
    pub link_table: String,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            asset_table: default_asset_table(),
            variant_table: default_variant_table(),
            link_table: default_link_table(),
        }
    }
}

impl AppConfig {
    /// Resolve the bootstrap file path: explicit argument, then the
    /// `BOOTSTRAP_PATH` environment variable, then the built-in default.
    pub fn resolve_path(arg: Option<&str>) -> PathBuf {
        if let Some(p) = arg {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("BOOTSTRAP_PATH") {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        PathBuf::from(DEFAULT_BOOTSTRAP_PATH)
    }

    pub fn load(path: &Path) -> MediaResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| MediaError::ValidationFailed {
            reason: format!("cannot read bootstrap config {}: {e}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| MediaError::ValidationFailed {
            reason: format!("invalid bootstrap config {}: {e}", path.display()),
        })
    }
}

/// Parse a memory budget string with optional K/M/G suffix (factors of 1024).
pub fn parse_memory_limit(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-1" {
        return None;
    }
    let (digits, factor) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * factor)
}

fn urlencode_vhost(vhost: &str) -> String {
    // "/" is the default vhost and must appear percent-encoded in the URI.
    vhost.replace('/', "%2f")
}

fn default_cache_seconds() -> u64 {
    31_536_000
}

fn default_rabbit_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_queue() -> String {
    "media.process".to_string()
}

fn default_prefetch() -> u16 {
    10
}

fn default_retry_max() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    15
}

fn default_max_bytes() -> usize {
    15_000_000
}

fn default_user_agent() -> String {
    format!("media-pipeline/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_original_long_edge() -> u32 {
    2048
}

fn default_fit() -> String {
    "cover".to_string()
}

fn default_asset_table() -> String {
    "media_asset".to_string()
}

fn default_variant_table() -> String {
    "media_variant".to_string()
}

fn default_link_table() -> String {
    "media_owner_link".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let raw = r#"{
            "s3": {
                "endpoint": "http://127.0.0.1:9000",
                "region": "us-east-1",
                "bucket": "media",
                "accessKey": "minio",
                "secretKey": "minio123",
                "publicBaseUrl": "https://cdn.example.com"
            },
            "rabbit": {
                "host": "localhost",
                "user": "guest",
                "pass": "guest",
                "dlq": "media.process.dead"
            },
            "temp": { "uploadDir": "/tmp/media-spool" },
            "profiles": {
                "gallery": {
                    "prefix": "img/gallery",
                    "keepOriginal": true,
                    "codecs": ["jpeg", "webp"],
                    "variants": {
                        "thumb": { "w": 160, "h": 160, "fit": "cover" },
                        "large": { "w": 1600, "h": 1200, "fit": "contain" }
                    }
                }
            }
        }"#;
        let cfg: AppConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.s3.cache_seconds, 31_536_000);
        assert_eq!(cfg.rabbit.queue, "media.process");
        assert_eq!(cfg.rabbit.prefetch, 10);
        assert_eq!(cfg.rabbit.retry_max, 3);
        assert_eq!(cfg.http.timeout_seconds, 15);
        assert_eq!(cfg.http.max_bytes, 15_000_000);
        assert_eq!(cfg.entities.asset_table, "media_asset");
        let gallery = &cfg.profiles["gallery"];
        assert!(gallery.keep_original);
        // IndexMap keeps the order the file declared.
        let names: Vec<_> = gallery.variants.keys().cloned().collect();
        assert_eq!(names, vec!["thumb", "large"]);
    }

    #[test]
    fn amqp_uri_encodes_default_vhost() {
        let raw = r#"{ "host": "mq", "user": "u", "pass": "p" }"#;
        let cfg: RabbitConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.amqp_uri(), "amqp://u:p@mq:5672/%2f");
    }

    #[test]
    fn memory_limit_suffixes() {
        assert_eq!(parse_memory_limit("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("64k"), Some(64 * 1024));
        assert_eq!(parse_memory_limit("1048576"), Some(1_048_576));
        assert_eq!(parse_memory_limit("-1"), None);
        assert_eq!(parse_memory_limit(""), None);
    }

    #[test]
    fn bootstrap_path_resolution_prefers_argument() {
        let p = AppConfig::resolve_path(Some("/etc/media.json"));
        assert_eq!(p, PathBuf::from("/etc/media.json"));
    }
}
