mod auth;
mod client;
mod error;
mod labels;

pub use auth::{run_authorization_flow, ClientSecrets, StoredToken, TokenManager, GMAIL_SCOPES};
pub use client::{GmailClient, GmailIngestor, GmailLabel, GmailProfile, IngestResult, MessageIngestor};
pub use error::GmailError;
pub use labels::LabelCache;
