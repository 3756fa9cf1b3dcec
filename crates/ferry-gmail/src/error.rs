use ferry_core::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GmailError {
    #[error("gmail request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gmail authentication failed: {0}")]
    Auth(String),
    #[error("gmail quota exceeded (retry after {retry_after_secs:?}s)")]
    Quota { retry_after_secs: Option<u64> },
    #[error("gmail server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("gmail rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("oauth token error: {0}")]
    Token(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected gmail response: {0}")]
    Unexpected(String),
}

impl GmailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) | Self::Server { .. } => ErrorKind::NetworkTransient,
            Self::Quota { .. } => ErrorKind::QuotaExceeded,
            Self::Auth(_) | Self::Token(_) => ErrorKind::AuthFailed,
            Self::Rejected { .. } => ErrorKind::RemoteRejected,
            Self::Json(_) | Self::Unexpected(_) => ErrorKind::ParseError,
            Self::Io(_) => ErrorKind::EvidenceIo,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-hinted delay from a `Retry-After` header, when present.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Quota {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}
