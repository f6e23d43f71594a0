//! Error types shared by every rowsync crate

use thiserror::Error;

/// Result type alias for rowsync operations
pub type Result<T> = std::result::Result<T, RowsyncError>;

/// Main error type for rowsync
#[derive(Error, Debug)]
pub enum RowsyncError {
    #[error("Invalid file reference: {0}")]
    InvalidFileRef(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RowsyncError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = RowsyncError::config("ROWSYNC_CHUNK_SIZE must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Configuration error: ROWSYNC_CHUNK_SIZE must be greater than 0"
        );
    }

    #[test]
    fn test_invalid_file_ref_display() {
        let err: RowsyncError = "csv_files".parse::<crate::FileRef>().unwrap_err();
        assert!(matches!(err, RowsyncError::InvalidFileRef(_)));
        assert_eq!(err.to_string(), "Invalid file reference: missing '#' in 'csv_files'");
    }
}
