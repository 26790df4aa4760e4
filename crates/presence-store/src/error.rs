use presence_core::LedgerError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write embedding file {path}: {source}")]
    VectorWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read embedding file {path}: {source}")]
    VectorRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("embedding file {path} is invalid: {message}")]
    CorruptVector { path: PathBuf, message: String },

    #[error("invalid identity key '{key}': {message}")]
    InvalidIdentity { key: String, message: String },

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Gallery(#[from] presence_core::gallery::StoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Unavailable(err.to_string())
    }
}
