use crate::{GmailError, TokenManager};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ferry_core::{IngestMode, InternalDateSource};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Deserialize)]
pub struct GmailProfile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "messagesTotal")]
    pub messages_total: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailLabel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct LabelListResponse {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub gmail_message_id: String,
    pub gmail_thread_id: Option<String>,
    pub label_ids: Vec<String>,
}

/// Thin wrapper over the Gmail REST surface the migration needs:
/// `users.getProfile`, `users.labels.*`, and `users.messages.import|insert`.
/// A 401 triggers exactly one forced token refresh before the call fails.
pub struct GmailClient {
    http: reqwest::Client,
    tokens: TokenManager,
    user_id: String,
}

impl GmailClient {
    pub fn new(tokens: TokenManager, user_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            user_id: user_id.into(),
        }
    }

    pub async fn get_profile(&self) -> Result<GmailProfile, GmailError> {
        let url = format!("{GMAIL_API_BASE}/users/{}/profile", self.user_id);
        let response = self.send_with_refresh(|token| self.http.get(&url).bearer_auth(token)).await?;
        Ok(check_status(response).await?.json().await?)
    }

    pub async fn list_labels(&self) -> Result<Vec<GmailLabel>, GmailError> {
        let url = format!("{GMAIL_API_BASE}/users/{}/labels", self.user_id);
        let response = self.send_with_refresh(|token| self.http.get(&url).bearer_auth(token)).await?;
        let parsed: LabelListResponse = check_status(response).await?.json().await?;
        Ok(parsed.labels.unwrap_or_default())
    }

    pub async fn create_label(&self, name: &str) -> Result<GmailLabel, GmailError> {
        let url = format!("{GMAIL_API_BASE}/users/{}/labels", self.user_id);
        let body = json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let response = self
            .send_with_refresh(|token| self.http.post(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Ingest raw RFC 5322 bytes. `import` bypasses Gmail's filters and spam
    /// classification, which is what an archival migration wants; `insert`
    /// is the byte-exact variant without any rewriting.
    pub async fn ingest(
        &self,
        mode: IngestMode,
        internal_date_source: InternalDateSource,
        raw: &[u8],
        label_ids: &[String],
    ) -> Result<IngestResult, GmailError> {
        let endpoint = match mode {
            IngestMode::Import => "import",
            IngestMode::Insert => "insert",
        };
        let mut url = format!(
            "{GMAIL_API_BASE}/users/{}/messages/{endpoint}?internalDateSource={}",
            self.user_id,
            internal_date_source.api_value()
        );
        if mode == IngestMode::Import {
            url.push_str("&neverMarkSpam=true&processForCalendar=false");
        }

        let body = json!({
            "raw": URL_SAFE_NO_PAD.encode(raw),
            "labelIds": label_ids,
        });

        let response = self
            .send_with_refresh(|token| self.http.post(&url).bearer_auth(token).json(&body))
            .await?;
        let parsed: IngestResponse = check_status(response).await?.json().await?;
        debug!(id = %parsed.id, endpoint, "gmail ingest ok");

        Ok(IngestResult {
            gmail_message_id: parsed.id,
            gmail_thread_id: parsed.thread_id,
            label_ids: parsed.label_ids.unwrap_or_default(),
        })
    }

    async fn send_with_refresh<'a, F>(&'a self, build: F) -> Result<Response, GmailError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("gmail returned 401, forcing one token refresh");
        let token = self.tokens.force_refresh().await?;
        Ok(build(&token).send().await?)
    }
}

/// Map non-success statuses onto the retryable/permanent error split.
async fn check_status(response: Response) -> Result<Response, GmailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        return Err(GmailError::Auth(
            "gmail rejected credentials after refresh".to_string(),
        ));
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        return Err(GmailError::Quota { retry_after_secs });
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        return Err(GmailError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Err(GmailError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Seam between the pipeline workers and the Gmail API, so ingestion can be
/// stubbed in tests. The date source is per call: a message without a
/// parseable `Date:` header falls back to `receivedTime`.
#[async_trait]
pub trait MessageIngestor: Send + Sync {
    async fn ingest(
        &self,
        raw: &[u8],
        label_ids: &[String],
        internal_date_source: InternalDateSource,
    ) -> Result<IngestResult, GmailError>;
}

/// Production ingestor: a Gmail client plus the run's ingest mode.
pub struct GmailIngestor {
    pub client: Arc<GmailClient>,
    pub mode: IngestMode,
}

#[async_trait]
impl MessageIngestor for GmailIngestor {
    async fn ingest(
        &self,
        raw: &[u8],
        label_ids: &[String],
        internal_date_source: InternalDateSource,
    ) -> Result<IngestResult, GmailError> {
        self.client
            .ingest(self.mode, internal_date_source, raw, label_ids)
            .await
    }
}
