use crate::ImapError;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task;
use tracing::{debug, warn};

const CONNECT_ATTEMPTS: usize = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub app_password: String,
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("app_password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub name: String,
    pub delimiter: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectInfo {
    pub uidvalidity: u32,
    pub exists: u32,
}

#[derive(Debug, Clone)]
pub struct HeaderFetch {
    pub uid: u32,
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<Utc>>,
    pub header: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct BodyFetch {
    pub uid: u32,
    pub internal_date: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

type Session = imap::Session<imap::Connection>;

struct PooledSession {
    session: Session,
    selected: Option<String>,
}

/// Bounded pool of authenticated TLS IMAP sessions. A session is checked out
/// for one selection plus a SEARCH or FETCH, then returned; sessions that
/// hit a network fault are discarded instead of returned.
#[derive(Clone)]
pub struct ImapPool {
    settings: Arc<ImapSettings>,
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<PooledSession>>>,
}

impl ImapPool {
    pub fn new(settings: ImapSettings, size: usize) -> Self {
        Self {
            settings: Arc::new(settings),
            permits: Arc::new(Semaphore::new(size.max(1))),
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Check out a session, connecting and logging in a fresh one when the
    /// idle list is empty. Transient connect failures are retried with
    /// jittered exponential backoff; authentication failures are permanent.
    pub async fn acquire(&self) -> Result<ImapHandle, ImapError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ImapError::Task("imap pool closed".to_string()))?;

        let existing = self.idle.lock().expect("imap pool lock").pop();
        let inner = match existing {
            Some(session) => session,
            None => self.connect_with_retry().await?,
        };

        Ok(ImapHandle {
            inner: Some(inner),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Log out and drop every idle session.
    pub async fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.idle.lock().expect("imap pool lock"));
        for mut pooled in sessions {
            let _ = task::spawn_blocking(move || pooled.session.logout()).await;
        }
    }

    async fn connect_with_retry(&self) -> Result<PooledSession, ImapError> {
        let mut delay = BACKOFF_BASE;
        let mut last_err = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connect_once().await {
                Ok(session) => return Ok(session),
                Err(err @ ImapError::Auth(_)) => return Err(err),
                Err(err) if err.is_transient() && attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %err, "imap connect failed, backing off");
                    tokio::time::sleep(jittered(delay)).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| ImapError::Network("imap connect failed".to_string())))
    }

    async fn connect_once(&self) -> Result<PooledSession, ImapError> {
        let settings = Arc::clone(&self.settings);
        task::spawn_blocking(move || {
            let client = imap::ClientBuilder::new(&settings.host, settings.port)
                .connect()
                .map_err(ImapError::from)?;
            let session = client
                .login(&settings.username, &settings.app_password)
                .map_err(|(err, _)| ImapError::Auth(err.to_string()))?;
            debug!(host = %settings.host, "imap session established");
            Ok(PooledSession {
                session,
                selected: None,
            })
        })
        .await
        .map_err(|err| ImapError::Task(err.to_string()))?
    }
}

/// Checked-out IMAP session. All protocol work runs on the blocking pool;
/// the session is returned to the pool on drop unless it faulted.
pub struct ImapHandle {
    inner: Option<PooledSession>,
    idle: Arc<Mutex<Vec<PooledSession>>>,
    _permit: OwnedSemaphorePermit,
}

impl ImapHandle {
    pub async fn list_folders(&mut self) -> Result<Vec<Folder>, ImapError> {
        self.with_session(|pooled| {
            let names = pooled.session.list(None, Some("*"))?;
            Ok(names
                .iter()
                .map(|name| Folder {
                    name: name.name().to_string(),
                    delimiter: name.delimiter().map(str::to_string),
                })
                .collect())
        })
        .await
    }

    /// Select a mailbox, always issuing the command so the returned
    /// UIDVALIDITY is fresh from the server.
    pub async fn select(&mut self, mailbox: &str) -> Result<SelectInfo, ImapError> {
        let mailbox = mailbox.to_string();
        self.with_session(move |pooled| select_mailbox(pooled, &mailbox))
            .await
    }

    pub async fn uid_search(
        &mut self,
        mailbox: &str,
        query: &str,
    ) -> Result<Vec<u32>, ImapError> {
        let mailbox = mailbox.to_string();
        let query = query.to_string();
        self.with_session(move |pooled| {
            ensure_selected(pooled, &mailbox)?;
            let uids = pooled.session.uid_search(&query)?;
            let mut uids: Vec<u32> = uids.into_iter().collect();
            uids.sort_unstable();
            Ok(uids)
        })
        .await
    }

    /// One UID FETCH for a batch, requesting only what filter evaluation
    /// needs: size, INTERNALDATE, and the header block.
    pub async fn fetch_headers(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> Result<Vec<HeaderFetch>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let mailbox = mailbox.to_string();
        let set = uid_set(uids);
        self.with_session(move |pooled| {
            ensure_selected(pooled, &mailbox)?;
            let fetches = pooled
                .session
                .uid_fetch(&set, "(UID RFC822.SIZE INTERNALDATE BODY.PEEK[HEADER])")?;

            let mut out = Vec::new();
            for fetch in fetches.iter() {
                let Some(uid) = fetch.uid else { continue };
                let Some(header) = fetch.header() else {
                    continue;
                };
                out.push(HeaderFetch {
                    uid,
                    size: fetch.size,
                    internal_date: fetch
                        .internal_date()
                        .map(|dt| dt.with_timezone(&Utc)),
                    header: header.to_vec(),
                });
            }
            Ok(out)
        })
        .await
    }

    /// Fetch the verbatim RFC 5322 bytes for one UID with `BODY.PEEK[]`.
    pub async fn fetch_body(&mut self, mailbox: &str, uid: u32) -> Result<BodyFetch, ImapError> {
        let mailbox = mailbox.to_string();
        self.with_session(move |pooled| {
            ensure_selected(pooled, &mailbox)?;
            let fetches = pooled
                .session
                .uid_fetch(uid.to_string(), "(UID INTERNALDATE BODY.PEEK[])")?;

            let fetch = fetches
                .iter()
                .find(|fetch| fetch.uid == Some(uid))
                .ok_or_else(|| {
                    ImapError::MissingData(format!("no FETCH response for uid {uid}"))
                })?;
            let raw = fetch
                .body()
                .ok_or_else(|| ImapError::MissingData(format!("no body for uid {uid}")))?
                .to_vec();
            Ok(BodyFetch {
                uid,
                internal_date: fetch.internal_date().map(|dt| dt.with_timezone(&Utc)),
                raw,
            })
        })
        .await
    }

    async fn with_session<T, F>(&mut self, op: F) -> Result<T, ImapError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledSession) -> Result<T, ImapError> + Send + 'static,
    {
        let mut pooled = self
            .inner
            .take()
            .ok_or_else(|| ImapError::Task("imap session already discarded".to_string()))?;

        let (pooled, result) = task::spawn_blocking(move || {
            let result = op(&mut pooled);
            (pooled, result)
        })
        .await
        .map_err(|err| ImapError::Task(err.to_string()))?;

        match result {
            Ok(value) => {
                self.inner = Some(pooled);
                Ok(value)
            }
            Err(err) => {
                // Keep the session only for clean protocol-level errors; a
                // network fault leaves it in an unknown state.
                if !matches!(err, ImapError::Network(_) | ImapError::Task(_)) {
                    self.inner = Some(pooled);
                }
                Err(err)
            }
        }
    }
}

impl Drop for ImapHandle {
    fn drop(&mut self) {
        if let Some(pooled) = self.inner.take() {
            self.idle.lock().expect("imap pool lock").push(pooled);
        }
    }
}

fn ensure_selected(pooled: &mut PooledSession, mailbox: &str) -> Result<(), ImapError> {
    if pooled.selected.as_deref() != Some(mailbox) {
        select_mailbox(pooled, mailbox)?;
    }
    Ok(())
}

fn select_mailbox(pooled: &mut PooledSession, mailbox: &str) -> Result<SelectInfo, ImapError> {
    pooled.selected = None;
    let mb = pooled.session.select(mailbox)?;
    pooled.selected = Some(mailbox.to_string());
    Ok(SelectInfo {
        uidvalidity: mb.uid_validity.unwrap_or(0),
        exists: mb.exists,
    })
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn jittered(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_set_joins_with_commas() {
        assert_eq!(uid_set(&[1, 5, 9]), "1,5,9");
        assert_eq!(uid_set(&[42]), "42");
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(2);
        for _ in 0..32 {
            let delay = jittered(base);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_millis(250));
        }
    }

    #[test]
    fn settings_debug_redacts_password() {
        let settings = ImapSettings {
            host: "imap.mail.me.com".to_string(),
            port: 993,
            username: "user@icloud.com".to_string(),
            app_password: "super-secret".to_string(),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
