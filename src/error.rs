use std::path::PathBuf;

/// Errors that abort a pass. Malformed meta values never end up here; they are
/// skipped as "not affected" by the detector.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FixerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database not found: {}", .0.display())]
    DatabaseNotFound(PathBuf),
    #[error("invalid table prefix {0:?}: only ASCII letters, digits and '_' are allowed")]
    InvalidPrefix(String),
    #[error("config: {0}")]
    Config(String),
}

pub(crate) type Result<T, E = FixerError> = std::result::Result<T, E>;
