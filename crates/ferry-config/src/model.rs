use ferry_core::{IngestMode, InternalDateSource};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub imap: Option<ImapConfig>,
    pub gmail: Option<GmailConfig>,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub username: String,
    pub app_password: String,
    #[serde(default = "default_imap_host")]
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_search_query")]
    pub search_query: String,
    #[serde(default, deserialize_with = "de_string_list")]
    pub folder_include: Vec<String>,
    #[serde(default, deserialize_with = "de_string_list")]
    pub folder_exclude: Vec<String>,
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("username", &self.username)
            .field("app_password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ssl", &self.ssl)
            .field("connections", &self.connections)
            .field("batch_size", &self.batch_size)
            .field("search_query", &self.search_query)
            .field("folder_include", &self.folder_include)
            .field("folder_exclude", &self.folder_exclude)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    pub target_user_email: String,
    pub credentials_file: PathBuf,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_ingest_mode")]
    pub mode: IngestMode,
    #[serde(default = "default_internal_date_source")]
    pub internal_date_source: InternalDateSource,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default, deserialize_with = "de_string_list")]
    pub target_addresses: Vec<String>,
    #[serde(default = "default_true")]
    pub include_sender: bool,
    #[serde(default = "default_true")]
    pub include_recipients: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            target_addresses: Vec::new(),
            include_sender: true,
            include_recipients: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub evidence_dir_override: Option<PathBuf>,
    #[serde(default)]
    pub reports_dir_override: Option<PathBuf>,
    #[serde(default)]
    pub sqlite_path_override: Option<PathBuf>,
    #[serde(default = "default_fingerprint_body_bytes")]
    pub fingerprint_body_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            evidence_dir_override: None,
            reports_dir_override: None,
            sqlite_path_override: None,
            fingerprint_body_bytes: default_fingerprint_body_bytes(),
        }
    }
}

impl StorageConfig {
    pub fn evidence_dir(&self) -> PathBuf {
        self.evidence_dir_override
            .clone()
            .unwrap_or_else(|| self.root_dir.join("evidence"))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.reports_dir_override
            .clone()
            .unwrap_or_else(|| self.root_dir.join("reports"))
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.sqlite_path_override
            .clone()
            .unwrap_or_else(|| self.root_dir.join("state.sqlite3"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_gmail_workers")]
    pub gmail_workers: usize,
    #[serde(default = "default_imap_fetch_concurrency")]
    pub imap_fetch_concurrency: usize,
    #[serde(default = "default_queue_maxsize")]
    pub queue_maxsize: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            gmail_workers: default_gmail_workers(),
            imap_fetch_concurrency: default_imap_fetch_concurrency(),
            queue_maxsize: default_queue_maxsize(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_imap_host() -> String {
    "imap.mail.me.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_connections() -> usize {
    2
}

fn default_batch_size() -> usize {
    50
}

fn default_search_query() -> String {
    "ALL".to_string()
}

fn default_token_file() -> PathBuf {
    PathBuf::from(".secrets/gmail-token.json")
}

fn default_ingest_mode() -> IngestMode {
    IngestMode::Import
}

fn default_internal_date_source() -> InternalDateSource {
    InternalDateSource::DateHeader
}

fn default_label_prefix() -> String {
    "iCloud".to_string()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_fingerprint_body_bytes() -> usize {
    4096
}

fn default_gmail_workers() -> usize {
    10
}

fn default_imap_fetch_concurrency() -> usize {
    5
}

fn default_queue_maxsize() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Accepts a real sequence, a JSON array string, or a comma-separated
/// string, since env vars can only carry the latter two.
fn de_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seq(Vec<String>),
        Str(String),
    }

    let parsed = match Raw::deserialize(deserializer)? {
        Raw::Seq(items) => items,
        Raw::Str(raw) => parse_list_str(&raw).map_err(serde::de::Error::custom)?,
    };

    Ok(parsed
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

pub(crate) fn parse_list_str(raw: &str) -> Result<Vec<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|err| format!("invalid JSON list {trimmed:?}: {err}"));
    }
    Ok(trimmed.split(',').map(str::to_string).collect())
}

pub(crate) fn check_range(
    name: &str,
    value: usize,
    min: usize,
    max: usize,
) -> Result<(), String> {
    if value < min || value > max {
        return Err(format!("{name} must be in {min}..={max}, got {value}"));
    }
    Ok(())
}

pub(crate) fn file_must_exist(name: &str, path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("{name} does not exist: {}", path.display()));
    }
    if !path.is_file() {
        return Err(format!("{name} is not a file: {}", path.display()));
    }
    Ok(())
}
