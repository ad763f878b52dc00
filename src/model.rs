use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profiles::Codec;

/// Lifecycle state of an asset. Stored as the lowercase string.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Upload,
    Remote,
}

/// One logical image and the root of its rendition aggregate.
#[derive(Debug, Clone)]
pub struct Asset {
    pub id: i64,
    pub profile: String,
    pub source: SourceKind,
    pub source_url: Option<String>,
    pub original_jpg_key: Option<String>,
    pub original_webp_key: Option<String>,
    pub original_width: Option<u32>,
    pub original_height: Option<u32>,
    pub checksum_sha1: Option<String>,
    pub status: AssetStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(profile: &str, source: SourceKind, source_url: Option<String>, status: AssetStatus) -> Self {
        let now = Utc::now();
        Asset {
            id: 0,
            profile: profile.to_string(),
            source,
            source_url,
            original_jpg_key: None,
            original_webp_key: None,
            original_width: None,
            original_height: None,
            checksum_sha1: None,
            status,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_original(
        &mut self,
        jpg_key: Option<String>,
        webp_key: Option<String>,
        width: u32,
        height: u32,
    ) {
        self.original_jpg_key = jpg_key;
        self.original_webp_key = webp_key;
        self.original_width = Some(width);
        self.original_height = Some(height);
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = AssetStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Object keys the originals may live under. The JPEG and WebP keys are
    /// recorded on the row; AVIF/PNG originals share the same stem, so their
    /// keys are derived by swapping the extension.
    pub fn original_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(jpg) = &self.original_jpg_key {
            keys.push(jpg.clone());
            if let Some(stem) = jpg.strip_suffix(".jpg") {
                keys.push(format!("{stem}.avif"));
                keys.push(format!("{stem}.png"));
            }
        }
        if let Some(webp) = &self.original_webp_key {
            keys.push(webp.clone());
        }
        keys
    }
}

/// A concrete resized, recoded output of an asset. `(asset_id, variant, codec)`
/// is unique; rows are inserted once and never mutated.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub id: i64,
    pub asset_id: i64,
    pub variant: String,
    pub codec: Codec,
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Polymorphic reference from an external entity to an asset.
#[derive(Debug, Clone)]
pub struct OwnerLink {
    pub id: i64,
    pub owner_type: String,
    pub owner_id: i64,
    pub asset_id: i64,
    pub role: String,
    pub sort: i32,
    pub created_at: DateTime<Utc>,
}

/// Structured result of one `process_asset` cycle, consumed by the worker's
/// ack/nack/DLQ decision.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub success: bool,
    pub exceeded_retries: bool,
    pub error: Option<String>,
    pub attempts: u32,
}

impl ProcessOutcome {
    pub fn ok(attempts: u32) -> Self {
        ProcessOutcome {
            success: true,
            exceeded_retries: false,
            error: None,
            attempts,
        }
    }

    pub fn failed(error: String, attempts: u32, retry_max: u32) -> Self {
        ProcessOutcome {
            success: false,
            exceeded_retries: attempts >= retry_max,
            error: Some(error),
            attempts,
        }
    }
}
