use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] ferry_storage::StorageError),
    #[error(transparent)]
    Imap(#[from] ferry_imap::ImapError),
    #[error(transparent)]
    Gmail(#[from] ferry_gmail::GmailError),
    #[error(transparent)]
    Mail(#[from] ferry_mail::MailError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("run aborted: {0}")]
    Aborted(String),
}
