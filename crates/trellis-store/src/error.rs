//! Error types for the store

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Referenced source type is not known
    #[error("Unknown source type '{0}'")]
    UnknownSourceType(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for trellis_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => trellis_core::Error::NotFound(what),
            StoreError::UnknownSourceType(t) => trellis_core::Error::UnknownSourceType(t),
            StoreError::Serialization(e) => trellis_core::Error::Serialization(e),
            StoreError::Sqlite(e) => trellis_core::Error::Database(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_conversion() {
        let err: trellis_core::Error = StoreError::NotFound("source 'x'".to_string()).into();
        assert!(matches!(err, trellis_core::Error::NotFound(_)));

        let err: trellis_core::Error =
            StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).into();
        assert!(matches!(err, trellis_core::Error::Database(_)));
    }
}
