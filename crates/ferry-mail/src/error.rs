use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("header parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
