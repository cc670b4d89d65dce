//! Error types for the cardcache core library.

/// Top-level error enum for the cardcache core library.
///
/// A missing or empty cached artifact is deliberately *not* represented here:
/// validation reports it as a cache miss (see
/// [`ValidationReport`](crate::artifacts::ValidationReport)).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown catalog entry: {entry_id}")]
    Referential { entry_id: String },

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{routine} routine failed: {message}")]
    Collaborator {
        routine: &'static str,
        message: String,
    },
}

impl CacheError {
    /// True for failures of the metadata store itself (open, lock, SQL).
    pub fn is_storage(&self) -> bool {
        matches!(self, CacheError::Storage(_) | CacheError::Sqlite(_))
    }

    /// Message safe to show an end user.
    ///
    /// Referential errors only happen when processing state is out of sync
    /// with the catalog, so the raw entry id is never shown.
    pub fn user_message(&self) -> String {
        match self {
            CacheError::Referential { .. } => {
                "Processing state corrupted, please re-upload.".to_string()
            }
            CacheError::Storage(_) | CacheError::Sqlite(_) => {
                "The processing cache is unavailable; the upload was processed without caching."
                    .to_string()
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn collaborator(routine: &'static str, message: impl Into<String>) -> Self {
        CacheError::Collaborator {
            routine,
            message: message.into(),
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referential_error_hides_entry_id_from_users() {
        let err = CacheError::Referential {
            entry_id: "0b7c-dead".to_string(),
        };
        assert!(err.to_string().contains("0b7c-dead"));
        let msg = err.user_message();
        assert!(msg.contains("re-upload"));
        assert!(!msg.contains("0b7c-dead"));
    }

    #[test]
    fn sqlite_errors_count_as_storage() {
        let err = CacheError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_storage());
        assert!(!CacheError::Config("x".into()).is_storage());
    }
}
