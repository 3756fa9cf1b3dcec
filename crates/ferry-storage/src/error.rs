use ferry_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("evidence file {path} exists with different content (expected {expected}, found {actual})")]
    EvidenceCorruption {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("data error: {0}")]
    Data(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EvidenceCorruption { .. } => ErrorKind::EvidenceCorruption,
            _ => ErrorKind::EvidenceIo,
        }
    }
}
