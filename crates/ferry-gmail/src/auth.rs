use crate::GmailError;
use chrono::Utc;
use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.insert",
];

/// Refresh the access token this many seconds before its recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// OAuth client material from a Google Cloud "Desktop app" credentials file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ClientSecrets {
    /// Parse a downloaded OAuth client JSON. Web-application clients are
    /// rejected with a pointer at the fix, since the loopback flow needs an
    /// installed (desktop) client.
    pub fn from_file(path: &Path) -> Result<Self, GmailError> {
        let raw = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;

        if value.get("installed").is_none() && value.get("web").is_some() {
            return Err(GmailError::Auth(
                "OAuth client JSON is a 'Web application' client; create a 'Desktop app' \
                 client in Google Cloud Console and point the credentials file at its JSON"
                    .to_string(),
            ));
        }

        let installed = value.get("installed").unwrap_or(&value);
        Ok(serde_json::from_value(installed.clone())?)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp after which the access token is stale.
    pub expires_at: Option<i64>,
}

impl std::fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl StoredToken {
    pub fn is_stale(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Utc::now().timestamp() < EXPIRY_SKEW_SECS,
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Owns the token file: loads it, refreshes the access token when stale,
/// and persists every update.
pub struct TokenManager {
    http: reqwest::Client,
    secrets: ClientSecrets,
    token_file: PathBuf,
    cached: Mutex<Option<StoredToken>>,
}

impl TokenManager {
    pub fn new(secrets: ClientSecrets, token_file: PathBuf) -> Self {
        Self {
            http: reqwest::Client::new(),
            secrets,
            token_file,
            cached: Mutex::new(None),
        }
    }

    /// Current access token, refreshing through the token endpoint if the
    /// stored one is stale.
    pub async fn access_token(&self) -> Result<String, GmailError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = load_token_file(&self.token_file)?;
        }

        let Some(token) = cached.as_ref() else {
            return Err(GmailError::Token(format!(
                "no stored token at {}; run `mailferry gmail-auth` first",
                self.token_file.display()
            )));
        };

        if !token.is_stale() {
            return Ok(token.access_token.clone());
        }

        let refreshed = self.refresh(token).await?;
        let access = refreshed.access_token.clone();
        write_token_file(&self.token_file, &refreshed)?;
        *cached = Some(refreshed);
        Ok(access)
    }

    /// Drop the cached access token and fetch a fresh one. Used once after
    /// an HTTP 401 before the call is deemed failed.
    pub async fn force_refresh(&self) -> Result<String, GmailError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = load_token_file(&self.token_file)?;
        }
        let Some(token) = cached.as_ref() else {
            return Err(GmailError::Token("no stored token to refresh".to_string()));
        };

        let refreshed = self.refresh(token).await?;
        let access = refreshed.access_token.clone();
        write_token_file(&self.token_file, &refreshed)?;
        *cached = Some(refreshed);
        Ok(access)
    }

    async fn refresh(&self, token: &StoredToken) -> Result<StoredToken, GmailError> {
        let Some(refresh_token) = token.refresh_token.as_deref() else {
            return Err(GmailError::Token(
                "stored token has no refresh token; re-run `mailferry gmail-auth`".to_string(),
            ));
        };

        debug!("refreshing gmail access token");
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.secrets.client_id.as_str()),
        ];
        if let Some(secret) = self.secrets.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&self.secrets.token_uri)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GmailError::Token(format!("token refresh failed: {body}")));
        }

        let parsed: TokenEndpointResponse = response.json().await?;
        Ok(StoredToken {
            access_token: parsed.access_token,
            // Google omits the refresh token on refresh responses.
            refresh_token: parsed
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: parsed
                .expires_in
                .map(|secs| Utc::now().timestamp() + secs as i64),
        })
    }
}

/// Complete the PKCE loopback flow: print the consent URL, catch the
/// redirect on an ephemeral localhost port, exchange the code, and persist
/// the token file.
pub async fn run_authorization_flow(
    secrets: &ClientSecrets,
    token_file: &Path,
) -> Result<StoredToken, GmailError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = format!("http://127.0.0.1:{port}");

    let client = BasicClient::new(ClientId::new(secrets.client_id.clone()))
        .set_auth_uri(
            AuthUrl::new(secrets.auth_uri.clone())
                .map_err(|err| GmailError::Auth(err.to_string()))?,
        )
        .set_token_uri(
            TokenUrl::new(secrets.token_uri.clone())
                .map_err(|err| GmailError::Auth(err.to_string()))?,
        )
        .set_redirect_uri(
            RedirectUrl::new(redirect_uri.clone())
                .map_err(|err| GmailError::Auth(err.to_string()))?,
        );

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let mut request = client
        .authorize_url(CsrfToken::new_random)
        .set_pkce_challenge(pkce_challenge)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent");
    for scope in GMAIL_SCOPES {
        request = request.add_scope(Scope::new((*scope).to_string()));
    }
    let (auth_url, csrf_state) = request.url();

    println!("Open this URL in a browser to authorize Gmail access:\n\n{auth_url}\n");
    info!(port, "waiting for oauth redirect on loopback");

    let (code, state) = wait_for_redirect(&listener).await?;
    if state.as_deref() != Some(csrf_state.secret().as_str()) {
        return Err(GmailError::Auth("oauth state mismatch".to_string()));
    }

    let http = reqwest::Client::new();
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", redirect_uri.as_str()),
        ("client_id", secrets.client_id.as_str()),
        ("code_verifier", pkce_verifier.secret().as_str()),
    ];
    if let Some(secret) = secrets.client_secret.as_deref() {
        params.push(("client_secret", secret));
    }

    let response = http.post(&secrets.token_uri).form(&params).send().await?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GmailError::Auth(format!("code exchange failed: {body}")));
    }

    let parsed: TokenEndpointResponse = response.json().await?;
    let token = StoredToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_at: parsed
            .expires_in
            .map(|secs| Utc::now().timestamp() + secs as i64),
    };

    write_token_file(token_file, &token)?;
    info!(path = %token_file.display(), "gmail token persisted");
    Ok(token)
}

async fn wait_for_redirect(
    listener: &TcpListener,
) -> Result<(String, Option<String>), GmailError> {
    let (mut stream, _) = listener.accept().await?;
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]).into_owned();

    let reply = "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n\
                 <html><body>Authorization complete. You can close this tab.</body></html>";
    let _ = stream.write_all(reply.as_bytes()).await;

    parse_redirect_request(&request)
}

fn parse_redirect_request(request: &str) -> Result<(String, Option<String>), GmailError> {
    let line = request
        .lines()
        .next()
        .ok_or_else(|| GmailError::Auth("empty oauth redirect request".to_string()))?;
    let path = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| GmailError::Auth("malformed oauth redirect request".to_string()))?;

    let url = url::Url::parse(&format!("http://localhost{path}"))
        .map_err(|err| GmailError::Auth(format!("bad oauth redirect url: {err}")))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => {
                return Err(GmailError::Auth(format!(
                    "authorization denied: {value}"
                )))
            }
            _ => {}
        }
    }

    let code = code.ok_or_else(|| GmailError::Auth("redirect carried no code".to_string()))?;
    Ok((code, state))
}

fn load_token_file(path: &Path) -> Result<Option<StoredToken>, GmailError> {
    if !path.exists() {
        return Ok(None);
    }
    if path.is_dir() {
        return Err(GmailError::Token(format!(
            "token file is a directory: {}",
            path.display()
        )));
    }

    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        warn!(path = %path.display(), "token file is empty, re-auth required");
        return Ok(None);
    }
    match serde_json::from_str(&raw) {
        Ok(token) => Ok(Some(token)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable token file, re-auth required");
            Ok(None)
        }
    }
}

fn write_token_file(path: &Path, token: &StoredToken) -> Result<(), GmailError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(token)?)?;
    restrict_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_installed_client_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"installed":{"client_id":"abc.apps.googleusercontent.com","client_secret":"s3cret"}}"#,
        )
        .unwrap();

        let secrets = ClientSecrets::from_file(&path).unwrap();
        assert_eq!(secrets.client_id, "abc.apps.googleusercontent.com");
        assert_eq!(secrets.token_uri, "https://oauth2.googleapis.com/token");
    }

    #[test]
    fn rejects_web_application_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"web":{"client_id":"abc"}}"#).unwrap();

        let err = ClientSecrets::from_file(&path).unwrap_err();
        assert!(matches!(err, GmailError::Auth(_)));
    }

    #[test]
    fn parses_redirect_query() {
        let request = "GET /?state=xyz&code=4%2FP7abc HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (code, state) = parse_redirect_request(request).unwrap();
        assert_eq!(code, "4/P7abc");
        assert_eq!(state.as_deref(), Some("xyz"));
    }

    #[test]
    fn redirect_error_param_fails_the_flow() {
        let request = "GET /?error=access_denied HTTP/1.1\r\n\r\n";
        assert!(parse_redirect_request(request).is_err());
    }

    #[test]
    fn token_file_round_trips_and_handles_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        assert!(load_token_file(&path).unwrap().is_none());

        let token = StoredToken {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(0),
        };
        write_token_file(&path, &token).unwrap();
        let loaded = load_token_file(&path).unwrap().unwrap();
        assert_eq!(loaded.access_token, "at");
        assert!(loaded.is_stale());

        std::fs::write(&path, "not json").unwrap();
        assert!(load_token_file(&path).unwrap().is_none());
    }
}
