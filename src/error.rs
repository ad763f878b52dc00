use strum::EnumIter;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Clone, EnumIter, thiserror::Error)]
pub enum MediaError {
    #[error("VAL_001: Validation failed - {reason}")]
    ValidationFailed { reason: String },

    #[error("DWN_001: Download failed - status {status}: {reason}")]
    DownloadFailed { status: u16, reason: String },

    #[error("DWN_002: Download too large - transfer exceeded {limit} bytes")]
    DownloadTooLarge { limit: usize },

    #[error("IMG_001: Image decode failed - {reason}")]
    ImageDecodeFailed { reason: String },

    #[error("IMG_002: Insufficient memory - need {required} bytes, {available} available")]
    InsufficientMemory { required: u64, available: u64 },

    #[error("OBJ_001: Object store operation failed - {reason}")]
    ObjectStoreFailed { reason: String },

    #[error("OBJ_002: Batch upload failed at index {index} - {reason}")]
    ObjectStoreBatchFailed { index: usize, reason: String },

    #[error("DB_001: Persistence failed - {reason}")]
    PersistenceFailed { reason: String },

    #[error("BUS_001: Message bus unavailable - {reason}")]
    BusUnavailable { reason: String },

    #[error("PRF_001: Unknown profile '{name}'")]
    ProfileUnknown { name: String },

    #[error("SPL_001: Temp spool operation failed - {reason}")]
    SpoolFailed { reason: String },
}

impl MediaError {
    pub fn error_code(&self) -> &'static str {
        match self {
            MediaError::ValidationFailed { .. } => "VAL_001",
            MediaError::DownloadFailed { .. } => "DWN_001",
            MediaError::DownloadTooLarge { .. } => "DWN_002",
            MediaError::ImageDecodeFailed { .. } => "IMG_001",
            MediaError::InsufficientMemory { .. } => "IMG_002",
            MediaError::ObjectStoreFailed { .. } => "OBJ_001",
            MediaError::ObjectStoreBatchFailed { .. } => "OBJ_002",
            MediaError::PersistenceFailed { .. } => "DB_001",
            MediaError::BusUnavailable { .. } => "BUS_001",
            MediaError::ProfileUnknown { .. } => "PRF_001",
            MediaError::SpoolFailed { .. } => "SPL_001",
        }
    }

    /// Whether the worker should let the generic retry discipline run another
    /// attempt. Validation and profile lookups fail the same way every time;
    /// everything else is either transient or treated as such to keep the
    /// retry policy uniform.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            MediaError::ValidationFailed { .. } | MediaError::ProfileUnknown { .. }
        )
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        MediaError::ValidationFailed {
            reason: reason.into(),
        }
    }

    pub fn list_all_errors() -> Vec<String> {
        use strum::IntoEnumIterator;
        MediaError::iter()
            .map(|e| format!("{}: {}", e.error_code(), e))
            .collect()
    }
}

impl From<reqwest::Error> for MediaError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
        MediaError::DownloadFailed {
            status,
            reason: err.to_string(),
        }
    }
}

impl From<image::ImageError> for MediaError {
    fn from(err: image::ImageError) -> Self {
        MediaError::ImageDecodeFailed {
            reason: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for MediaError {
    fn from(err: sqlx::Error) -> Self {
        MediaError::PersistenceFailed {
            reason: err.to_string(),
        }
    }
}

impl From<lapin::Error> for MediaError {
    fn from(err: lapin::Error) -> Self {
        MediaError::BusUnavailable {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for MediaError {
    fn from(err: std::io::Error) -> Self {
        MediaError::SpoolFailed {
            reason: err.to_string(),
        }
    }
}
