//! Error types for metric storage, live tailing and delivery

use crate::store::BackendKind;

/// Result type for entrenar-live operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the storage and streaming engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// No record file, WAL or archive exists for the run
    #[error("No metrics found for {0}")]
    NotFound(String),

    #[error("Invalid metric point: {0}")]
    InvalidPoint(String),

    #[error("Run {run} already uses the {existing} backend, cannot open it as {requested}")]
    BackendMismatch {
        run: String,
        existing: BackendKind,
        requested: BackendKind,
    },

    #[error("Store is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if this error means the run has no data yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let not_found = Error::NotFound("mnist/run-1".to_string());
        assert!(not_found.to_string().contains("mnist/run-1"));
        assert!(not_found.is_not_found());

        let mismatch = Error::BackendMismatch {
            run: "mnist/run-1".to_string(),
            existing: BackendKind::Archive,
            requested: BackendKind::Jsonl,
        };
        let msg = mismatch.to_string();
        assert!(msg.contains("archive"));
        assert!(msg.contains("jsonl"));
        assert!(!mismatch.is_not_found());

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(io.to_string().contains("disk full"));
    }
}
