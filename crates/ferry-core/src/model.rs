use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Discovered,
    Downloaded,
    Skipped,
    Imported,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Downloaded => "downloaded",
            Self::Skipped => "skipped",
            Self::Imported => "imported",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovered" => Some(Self::Discovered),
            "downloaded" => Some(Self::Downloaded),
            "skipped" => Some(Self::Skipped),
            "imported" => Some(Self::Imported),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FolderScanStatus {
    Scanning,
    Done,
    Error,
}

impl FolderScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scanning" => Some(Self::Scanning),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Filtered,
    Duplicate,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filtered => "filtered",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Failure classification carried alongside every failure record. Transient
/// kinds may be retried; the rest are surfaced to the pipeline and recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    AuthFailed,
    NetworkTransient,
    QuotaExceeded,
    ImapProtocol,
    ParseError,
    EvidenceIo,
    EvidenceCorruption,
    RemoteRejected,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigInvalid => "config_invalid",
            Self::AuthFailed => "auth_failed",
            Self::NetworkTransient => "network_transient",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ImapProtocol => "imap_protocol",
            Self::ParseError => "parse_error",
            Self::EvidenceIo => "evidence_io",
            Self::EvidenceCorruption => "evidence_corruption",
            Self::RemoteRejected => "remote_rejected",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkTransient | Self::QuotaExceeded | Self::ImapProtocol
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Import,
    Insert,
}

impl IngestMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "import" => Some(Self::Import),
            "insert" => Some(Self::Insert),
            _ => None,
        }
    }
}

/// Source for Gmail's `internalDate` when ingesting a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InternalDateSource {
    DateHeader,
    ReceivedTime,
}

impl InternalDateSource {
    /// Value accepted by the Gmail API's `internalDateSource` parameter.
    pub fn api_value(self) -> &'static str {
        match self {
            Self::DateHeader => "dateHeader",
            Self::ReceivedTime => "receivedTime",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dateHeader" => Some(Self::DateHeader),
            "receivedTime" => Some(Self::ReceivedTime),
            _ => None,
        }
    }
}

/// Gmail system labels applied from the folder mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SystemLabel {
    Inbox,
    Sent,
    Trash,
    Spam,
    Draft,
}

impl SystemLabel {
    /// Gmail label id (system labels use their name as id).
    pub fn id(self) -> &'static str {
        match self {
            Self::Inbox => "INBOX",
            Self::Sent => "SENT",
            Self::Trash => "TRASH",
            Self::Spam => "SPAM",
            Self::Draft => "DRAFT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    /// Dedupe key; NULL only for duplicate reference rows.
    pub fingerprint: Option<String>,
    pub message_id_norm: Option<String>,
    pub folder: String,
    pub uid: u32,
    pub uidvalidity: u32,
    pub subject: Option<String>,
    pub from_addr: Option<String>,
    pub to_addrs: Option<String>,
    pub cc_addrs: Option<String>,
    pub bcc_addrs: Option<String>,
    pub date_header: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub evidence_path: Option<String>,
    pub evidence_sha256: Option<String>,
    pub size_bytes: Option<i64>,
    pub status: MessageStatus,
    pub attempts: i64,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
    pub notes: Option<String>,
    pub gmail_message_id: Option<String>,
    pub gmail_thread_id: Option<String>,
    pub labels_json: Option<String>,
    pub duplicate_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn label_ids(&self) -> Vec<String> {
        self.labels_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderCheckpoint {
    pub folder: String,
    pub uidvalidity: u32,
    pub highest_uid_done: u32,
    pub message_count: Option<i64>,
    pub status: FolderScanStatus,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelRow {
    pub path: String,
    pub gmail_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Minimal header set used for fingerprinting and address filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinimalHeaders {
    pub message_id_norm: Option<String>,
    pub date_raw: Option<String>,
    pub date_epoch: Option<i64>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub delivered_to: Option<String>,
    pub x_original_to: Option<String>,
    pub envelope_to: Option<String>,
    pub subject: Option<String>,
}
