use ferry_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("imap authentication failed: {0}")]
    Auth(String),
    #[error("imap connection error: {0}")]
    Network(String),
    #[error("imap protocol error: {0}")]
    Protocol(String),
    #[error("imap response missing data: {0}")]
    MissingData(String),
    #[error("imap blocking task failed: {0}")]
    Task(String),
}

impl ImapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::AuthFailed,
            Self::Network(_) => ErrorKind::NetworkTransient,
            Self::Protocol(_) | Self::Task(_) => ErrorKind::ImapProtocol,
            Self::MissingData(_) => ErrorKind::ParseError,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<imap::Error> for ImapError {
    fn from(err: imap::Error) -> Self {
        match &err {
            imap::Error::Io(_) | imap::Error::ConnectionLost => Self::Network(err.to_string()),
            _ => Self::Protocol(err.to_string()),
        }
    }
}
