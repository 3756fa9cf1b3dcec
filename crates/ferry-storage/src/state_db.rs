use crate::StorageError;
use chrono::{DateTime, Utc};
use ferry_core::{
    ErrorKind, FolderCheckpoint, FolderScanStatus, MessageRow, MessageStatus, MinimalHeaders,
    SkipReason, StatusCounts,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Outcome of `reserve_discovery`.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub row: MessageRow,
    /// A fresh row was inserted for this discovery.
    pub is_new: bool,
    /// The existing row refers to the same (folder, uid, uidvalidity); this
    /// is a re-scan of the same physical message, not a duplicate.
    pub same_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    SkippedAndFailed,
    FolderCheckpoints,
    All,
}

/// Durable SQLite store of message rows, folder checkpoints, and the label
/// mapping. All writes go through one pool against a WAL database; every
/// state transition is a single short transaction.
#[derive(Clone)]
pub struct StateDb {
    pool: SqlitePool,
}

impl StateDb {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a `discovered` row for a fetched message, or return the row
    /// that already owns its fingerprint or Message-Id.
    pub async fn reserve_discovery(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: u32,
        fingerprint: &str,
        headers: &MinimalHeaders,
        size_bytes: u64,
        received_at: Option<DateTime<Utc>>,
    ) -> Result<Reservation, StorageError> {
        let mut tx = self.pool.begin().await?;

        let by_source =
            sqlx::query("SELECT * FROM messages WHERE folder = ?1 AND uid = ?2 AND uidvalidity = ?3")
                .bind(folder)
                .bind(uid)
                .bind(uidvalidity)
                .fetch_optional(&mut *tx)
                .await?;
        // A fingerprint-less `discovered` row is a reset skip placeholder; it
        // must go back through the dedupe lookups below before it may claim
        // this discovery.
        let mut placeholder_id = None;
        if let Some(raw) = by_source {
            let row = row_to_message(&raw)?;
            if row.fingerprint.is_some() || row.status != MessageStatus::Discovered {
                tx.commit().await?;
                return Ok(Reservation {
                    row,
                    is_new: false,
                    same_source: true,
                });
            }
            placeholder_id = Some(row.id);
        }

        let by_fingerprint = sqlx::query("SELECT * FROM messages WHERE fingerprint = ?1")
            .bind(fingerprint)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(raw) = by_fingerprint {
            let row = row_to_message(&raw)?;
            tx.commit().await?;
            return Ok(Reservation {
                row,
                is_new: false,
                same_source: false,
            });
        }

        if let Some(msgid) = headers.message_id_norm.as_deref() {
            let by_msgid = sqlx::query("SELECT * FROM messages WHERE message_id_norm = ?1")
                .bind(msgid)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(raw) = by_msgid {
                let row = row_to_message(&raw)?;
                tx.commit().await?;
                return Ok(Reservation {
                    row,
                    is_new: false,
                    same_source: false,
                });
            }
        }

        let now = Utc::now().to_rfc3339();
        let (id, is_new) = match placeholder_id {
            // Re-bind the reset placeholder row to this discovery.
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET fingerprint = ?1, message_id_norm = ?2, subject = ?3, from_addr = ?4,
                        to_addrs = ?5, cc_addrs = ?6, bcc_addrs = ?7, date_header = ?8,
                        received_at = ?9, size_bytes = ?10, updated_at = ?11
                    WHERE id = ?12
                    "#,
                )
                .bind(fingerprint)
                .bind(headers.message_id_norm.as_deref())
                .bind(headers.subject.as_deref())
                .bind(headers.from.as_deref())
                .bind(headers.to.as_deref())
                .bind(headers.cc.as_deref())
                .bind(headers.bcc.as_deref())
                .bind(headers.date_raw.as_deref())
                .bind(received_at.map(|dt| dt.to_rfc3339()))
                .bind(size_bytes as i64)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                (id, false)
            }
            None => {
                let id = sqlx::query(
                    r#"
                    INSERT INTO messages (
                      fingerprint, message_id_norm, folder, uid, uidvalidity,
                      subject, from_addr, to_addrs, cc_addrs, bcc_addrs,
                      date_header, received_at, size_bytes, status, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                    "#,
                )
                .bind(fingerprint)
                .bind(headers.message_id_norm.as_deref())
                .bind(folder)
                .bind(uid)
                .bind(uidvalidity)
                .bind(headers.subject.as_deref())
                .bind(headers.from.as_deref())
                .bind(headers.to.as_deref())
                .bind(headers.cc.as_deref())
                .bind(headers.bcc.as_deref())
                .bind(headers.date_raw.as_deref())
                .bind(received_at.map(|dt| dt.to_rfc3339()))
                .bind(size_bytes as i64)
                .bind(MessageStatus::Discovered.as_str())
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
                (id, true)
            }
        };

        let raw = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let row = row_to_message(&raw)?;

        tx.commit().await?;
        Ok(Reservation {
            row,
            is_new,
            same_source: true,
        })
    }

    /// Record a filter miss. The row is terminal `skipped` and carries no
    /// fingerprint, since no body was fetched for it.
    pub async fn record_skipped_filtered(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: u32,
        headers: &MinimalHeaders,
        reason: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO messages (
              folder, uid, uidvalidity, subject, from_addr, to_addrs,
              date_header, status, last_error_kind, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(folder, uid, uidvalidity) DO UPDATE SET
              status = CASE
                WHEN messages.status IN ('discovered', 'skipped') THEN excluded.status
                ELSE messages.status
              END,
              last_error_kind = excluded.last_error_kind,
              last_error = excluded.last_error,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(folder)
        .bind(uid)
        .bind(uidvalidity)
        .bind(headers.subject.as_deref())
        .bind(headers.from.as_deref())
        .bind(headers.to.as_deref())
        .bind(headers.date_raw.as_deref())
        .bind(MessageStatus::Skipped.as_str())
        .bind(SkipReason::Filtered.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a UID whose body fetch permanently failed, so the folder
    /// checkpoint can still advance past it without losing the audit trail.
    /// An existing row past `discovered` is left untouched.
    pub async fn record_fetch_failure(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: u32,
        kind: ErrorKind,
        error: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO messages (
              folder, uid, uidvalidity, status, attempts, last_error_kind, last_error,
              created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)
            ON CONFLICT(folder, uid, uidvalidity) DO UPDATE SET
              status = excluded.status,
              attempts = messages.attempts + 1,
              last_error_kind = excluded.last_error_kind,
              last_error = excluded.last_error,
              updated_at = excluded.updated_at
              WHERE messages.status = 'discovered'
            "#,
        )
        .bind(folder)
        .bind(uid)
        .bind(uidvalidity)
        .bind(MessageStatus::Failed.as_str())
        .bind(kind.as_str())
        .bind(error)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a duplicate discovery as a reference row pointing at the
    /// canonical fingerprint. No evidence file is associated with it.
    pub async fn record_duplicate(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: u32,
        duplicate_of: &str,
        reason: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO messages (
              folder, uid, uidvalidity, status, last_error_kind, last_error,
              duplicate_of, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(folder, uid, uidvalidity) DO UPDATE SET
              status = CASE
                WHEN messages.status IN ('discovered', 'skipped') THEN excluded.status
                ELSE messages.status
              END,
              duplicate_of = excluded.duplicate_of,
              last_error_kind = excluded.last_error_kind,
              last_error = excluded.last_error,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(folder)
        .bind(uid)
        .bind(uidvalidity)
        .bind(MessageStatus::Skipped.as_str())
        .bind(SkipReason::Duplicate.as_str())
        .bind(reason)
        .bind(duplicate_of)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Promote `discovered` → `downloaded` once the evidence file is
    /// committed. Returns false when the row was not in `discovered`, which
    /// keeps the promotion idempotent across crashes and re-scans.
    pub async fn record_downloaded(
        &self,
        row_id: i64,
        evidence_path: &str,
        sha256: &str,
        size_bytes: u64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = ?1, evidence_path = ?2, evidence_sha256 = ?3,
                size_bytes = ?4, updated_at = ?5
            WHERE id = ?6 AND status = ?7
            "#,
        )
        .bind(MessageStatus::Downloaded.as_str())
        .bind(evidence_path)
        .bind(sha256)
        .bind(size_bytes as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(row_id)
        .bind(MessageStatus::Discovered.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Promote `downloaded` → `imported`. The status gate guarantees each
    /// fingerprint is handed to Gmail at most once even if two workers race.
    pub async fn record_imported(
        &self,
        row_id: i64,
        gmail_message_id: &str,
        gmail_thread_id: Option<&str>,
        label_ids: &[String],
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = ?1, gmail_message_id = ?2, gmail_thread_id = ?3,
                labels_json = ?4, last_error_kind = NULL, last_error = NULL,
                updated_at = ?5
            WHERE id = ?6 AND status = ?7
            "#,
        )
        .bind(MessageStatus::Imported.as_str())
        .bind(gmail_message_id)
        .bind(gmail_thread_id)
        .bind(serde_json::to_string(label_ids)?)
        .bind(Utc::now().to_rfc3339())
        .bind(row_id)
        .bind(MessageStatus::Downloaded.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a failed attempt. The row is marked `failed` when the error is
    /// permanent or the retry budget is exhausted; otherwise it stays in its
    /// current status for a later attempt. Returns the attempt count.
    pub async fn record_failure(
        &self,
        row_id: i64,
        kind: ErrorKind,
        error: &str,
        permanent: bool,
        max_attempts: i64,
    ) -> Result<i64, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE messages
            SET attempts = attempts + 1, last_error_kind = ?1, last_error = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(kind.as_str())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(row_id)
        .execute(&mut *tx)
        .await?;

        let attempts: i64 = sqlx::query("SELECT attempts FROM messages WHERE id = ?1")
            .bind(row_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("attempts")?;

        if permanent || attempts >= max_attempts {
            sqlx::query("UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(MessageStatus::Failed.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(attempts)
    }

    pub async fn append_note(&self, row_id: i64, note: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET notes = CASE WHEN notes IS NULL THEN ?1 ELSE notes || '; ' || ?1 END,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(note)
        .bind(Utc::now().to_rfc3339())
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_folder_checkpoint(
        &self,
        folder: &str,
        uidvalidity: u32,
    ) -> Result<Option<FolderCheckpoint>, StorageError> {
        let row = sqlx::query("SELECT * FROM folders WHERE name = ?1 AND uidvalidity = ?2")
            .bind(folder)
            .bind(uidvalidity)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_checkpoint(&r)).transpose()
    }

    /// Open (or continue) a scan epoch for a folder. A UIDVALIDITY change
    /// creates a fresh checkpoint starting at UID 0; progress rows from
    /// older epochs are left in place for the audit trail.
    pub async fn begin_folder_scan(
        &self,
        folder: &str,
        uidvalidity: u32,
        message_count: Option<i64>,
    ) -> Result<FolderCheckpoint, StorageError> {
        let stale_epochs = sqlx::query(
            "SELECT COUNT(*) AS c FROM folders WHERE name = ?1 AND uidvalidity <> ?2",
        )
        .bind(folder)
        .bind(uidvalidity)
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("c")?;
        if stale_epochs > 0 {
            info!(folder, uidvalidity, "UIDVALIDITY changed, prior UID progress discarded");
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO folders (name, uidvalidity, highest_uid_done, message_count, status,
                                 last_scan_at, created_at, updated_at)
            VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name, uidvalidity) DO UPDATE SET
              message_count = excluded.message_count,
              status = excluded.status,
              last_scan_at = excluded.last_scan_at,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(folder)
        .bind(uidvalidity)
        .bind(message_count)
        .bind(FolderScanStatus::Scanning.as_str())
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_folder_checkpoint(folder, uidvalidity)
            .await?
            .ok_or_else(|| StorageError::Data(format!("missing checkpoint for {folder}")))
    }

    /// Advance the checkpoint; `highest_uid_done` only moves forward.
    pub async fn checkpoint_folder(
        &self,
        folder: &str,
        uidvalidity: u32,
        highest_uid_done: u32,
        status: FolderScanStatus,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE folders
            SET highest_uid_done = MAX(highest_uid_done, ?1), status = ?2, updated_at = ?3
            WHERE name = ?4 AND uidvalidity = ?5
            "#,
        )
        .bind(highest_uid_done)
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(folder)
        .bind(uidvalidity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_folder_checkpoints(&self) -> Result<Vec<FolderCheckpoint>, StorageError> {
        let rows = sqlx::query("SELECT * FROM folders ORDER BY name, uidvalidity")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    pub async fn get_label(&self, path: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT gmail_id FROM labels WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.try_get("gmail_id").ok()))
    }

    pub async fn put_label(&self, path: &str, gmail_id: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO labels (path, gmail_id, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(path) DO UPDATE SET gmail_id = excluded.gmail_id
            "#,
        )
        .bind(path)
        .bind(gmail_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rows waiting for ingestion, in discovery order. Drives the queue on
    /// resume after a crash between evidence write and Gmail import.
    pub async fn pending_import(&self) -> Result<Vec<MessageRow>, StorageError> {
        self.messages_with_status(MessageStatus::Downloaded).await
    }

    pub async fn failures(&self) -> Result<Vec<MessageRow>, StorageError> {
        self.messages_with_status(MessageStatus::Failed).await
    }

    /// Rows that claim an evidence file (status `downloaded` or `imported`).
    pub async fn evidence_rows(&self) -> Result<Vec<MessageRow>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE status IN (?1, ?2) AND evidence_path IS NOT NULL ORDER BY id",
        )
        .bind(MessageStatus::Downloaded.as_str())
        .bind(MessageStatus::Imported.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn messages_with_status(
        &self,
        status: MessageStatus,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE status = ?1 ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn counts_by_status(&self) -> Result<StatusCounts, StorageError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS c FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("c")?;
            let count = count as u64;
            match MessageStatus::parse(&status) {
                Some(MessageStatus::Discovered) => counts.discovered = count,
                Some(MessageStatus::Downloaded) => counts.downloaded = count,
                Some(MessageStatus::Imported) => counts.imported = count,
                Some(MessageStatus::Skipped) => counts.skipped = count,
                Some(MessageStatus::Failed) => counts.failed = count,
                None => return Err(StorageError::Data(format!("unknown status {status:?}"))),
            }
        }
        Ok(counts)
    }

    /// Return terminal rows to an earlier status so they can be retried.
    /// Evidence files are never deleted; `imported` rows are never touched.
    pub async fn reset(&self, scope: ResetScope) -> Result<u64, StorageError> {
        let mut affected = 0u64;

        if matches!(scope, ResetScope::SkippedAndFailed | ResetScope::All) {
            let now = Utc::now().to_rfc3339();

            // Failed rows with committed evidence only need re-ingestion.
            let downgraded = sqlx::query(
                r#"
                UPDATE messages
                SET status = ?1, last_error_kind = NULL, last_error = NULL, updated_at = ?2
                WHERE status = ?3 AND evidence_path IS NOT NULL
                "#,
            )
            .bind(MessageStatus::Downloaded.as_str())
            .bind(&now)
            .bind(MessageStatus::Failed.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            // Skip rows and evidence-less failures are re-evaluated from scratch.
            let requeued = sqlx::query(
                r#"
                UPDATE messages
                SET status = ?1, last_error_kind = NULL, last_error = NULL,
                    duplicate_of = NULL, updated_at = ?2
                WHERE status IN (?3, ?4)
                "#,
            )
            .bind(MessageStatus::Discovered.as_str())
            .bind(&now)
            .bind(MessageStatus::Skipped.as_str())
            .bind(MessageStatus::Failed.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            affected += downgraded + requeued;
        }

        if matches!(scope, ResetScope::FolderCheckpoints | ResetScope::All) {
            let reset = sqlx::query(
                "UPDATE folders SET highest_uid_done = 0, status = ?1, updated_at = ?2",
            )
            .bind(FolderScanStatus::Scanning.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?
            .rows_affected();
            affected += reset;
        }

        Ok(affected)
    }
}

fn row_to_message(row: &SqliteRow) -> Result<MessageRow, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(MessageRow {
        id: row.try_get("id")?,
        fingerprint: row.try_get("fingerprint")?,
        message_id_norm: row.try_get("message_id_norm")?,
        folder: row.try_get("folder")?,
        uid: row.try_get::<i64, _>("uid")? as u32,
        uidvalidity: row.try_get::<i64, _>("uidvalidity")? as u32,
        subject: row.try_get("subject")?,
        from_addr: row.try_get("from_addr")?,
        to_addrs: row.try_get("to_addrs")?,
        cc_addrs: row.try_get("cc_addrs")?,
        bcc_addrs: row.try_get("bcc_addrs")?,
        date_header: row.try_get("date_header")?,
        received_at: parse_dt(row.try_get("received_at")?),
        evidence_path: row.try_get("evidence_path")?,
        evidence_sha256: row.try_get("evidence_sha256")?,
        size_bytes: row.try_get("size_bytes")?,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| StorageError::Data(format!("unknown message status {status:?}")))?,
        attempts: row.try_get("attempts")?,
        last_error_kind: row.try_get("last_error_kind")?,
        last_error: row.try_get("last_error")?,
        notes: row.try_get("notes")?,
        gmail_message_id: row.try_get("gmail_message_id")?,
        gmail_thread_id: row.try_get("gmail_thread_id")?,
        labels_json: row.try_get("labels_json")?,
        duplicate_of: row.try_get("duplicate_of")?,
        created_at: parse_dt(row.try_get("created_at")?)
            .ok_or_else(|| StorageError::Data("missing created_at".to_string()))?,
        updated_at: parse_dt(row.try_get("updated_at")?)
            .ok_or_else(|| StorageError::Data("missing updated_at".to_string()))?,
    })
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<FolderCheckpoint, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(FolderCheckpoint {
        folder: row.try_get("name")?,
        uidvalidity: row.try_get::<i64, _>("uidvalidity")? as u32,
        highest_uid_done: row.try_get::<i64, _>("highest_uid_done")? as u32,
        message_count: row.try_get("message_count")?,
        status: FolderScanStatus::parse(&status)
            .ok_or_else(|| StorageError::Data(format!("unknown folder status {status:?}")))?,
        last_scan_at: parse_dt(row.try_get("last_scan_at")?),
        created_at: parse_dt(row.try_get("created_at")?)
            .ok_or_else(|| StorageError::Data("missing created_at".to_string()))?,
        updated_at: parse_dt(row.try_get("updated_at")?)
            .ok_or_else(|| StorageError::Data("missing updated_at".to_string()))?,
    })
}

fn parse_dt(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP_A: &str = "aa11111111111111111111111111111111111111111111111111111111111111";
    const FP_B: &str = "bb22222222222222222222222222222222222222222222222222222222222222";

    async fn open_db() -> (tempfile::TempDir, StateDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::connect(&dir.path().join("state.sqlite3"))
            .await
            .unwrap();
        (dir, db)
    }

    fn headers() -> MinimalHeaders {
        MinimalHeaders {
            message_id_norm: Some("abc@d.com".to_string()),
            from: Some("a@d.com".to_string()),
            subject: Some("hi".to_string()),
            ..MinimalHeaders::default()
        }
    }

    #[tokio::test]
    async fn reserve_is_new_once_per_fingerprint() {
        let (_dir, db) = open_db().await;

        let first = db
            .reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 1200, None)
            .await
            .unwrap();
        assert!(first.is_new);
        assert_eq!(first.row.status, MessageStatus::Discovered);

        // Re-scan of the same message.
        let again = db
            .reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 1200, None)
            .await
            .unwrap();
        assert!(!again.is_new);
        assert!(again.same_source);
        assert_eq!(again.row.id, first.row.id);

        // Same bytes discovered in another folder: a duplicate.
        let dup = db
            .reserve_discovery("Archive", 9, 3, FP_A, &headers(), 1200, None)
            .await
            .unwrap();
        assert!(!dup.is_new);
        assert!(!dup.same_source);
        assert_eq!(dup.row.id, first.row.id);
    }

    #[tokio::test]
    async fn duplicate_reference_rows_do_not_collide() {
        let (_dir, db) = open_db().await;
        db.reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 100, None)
            .await
            .unwrap();
        db.record_duplicate("Archive", 9, 3, FP_A, "duplicate of INBOX/1")
            .await
            .unwrap();
        // Idempotent on re-scan.
        db.record_duplicate("Archive", 9, 3, FP_A, "duplicate of INBOX/1")
            .await
            .unwrap();

        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.discovered, 1);
        assert_eq!(counts.skipped, 1);
    }

    #[tokio::test]
    async fn status_gates_enforce_the_lifecycle() {
        let (_dir, db) = open_db().await;
        let row = db
            .reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 100, None)
            .await
            .unwrap()
            .row;

        // Import before download is refused.
        assert!(!db.record_imported(row.id, "g1", None, &[]).await.unwrap());

        assert!(db
            .record_downloaded(row.id, "aa/11/x.eml", "cafe", 100)
            .await
            .unwrap());
        // Second promotion is a no-op.
        assert!(!db
            .record_downloaded(row.id, "aa/11/x.eml", "cafe", 100)
            .await
            .unwrap());

        assert!(db
            .record_imported(row.id, "g1", Some("t1"), &["INBOX".to_string()])
            .await
            .unwrap());
        // At-most-once: a racing second import commit is refused.
        assert!(!db.record_imported(row.id, "g2", None, &[]).await.unwrap());

        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.imported, 1);
    }

    #[tokio::test]
    async fn failures_respect_retry_budget() {
        let (_dir, db) = open_db().await;
        let row = db
            .reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 100, None)
            .await
            .unwrap()
            .row;
        db.record_downloaded(row.id, "aa/11/x.eml", "cafe", 100)
            .await
            .unwrap();

        for attempt in 1..=2 {
            let attempts = db
                .record_failure(row.id, ErrorKind::QuotaExceeded, "429", false, 5)
                .await
                .unwrap();
            assert_eq!(attempts, attempt);
        }
        // Still downloaded: transient failures under budget do not fail the row.
        assert_eq!(db.pending_import().await.unwrap().len(), 1);

        db.record_failure(row.id, ErrorKind::RemoteRejected, "400", true, 5)
            .await
            .unwrap();
        let failures = db.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].last_error_kind.as_deref(), Some("remote_rejected"));
        assert_eq!(failures[0].attempts, 3);
    }

    #[tokio::test]
    async fn reset_returns_failed_rows_without_touching_imported() {
        let (_dir, db) = open_db().await;

        let failed = db
            .reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 100, None)
            .await
            .unwrap()
            .row;
        db.record_downloaded(failed.id, "aa/11/a.eml", "cafe", 100)
            .await
            .unwrap();
        db.record_failure(failed.id, ErrorKind::RemoteRejected, "400", true, 5)
            .await
            .unwrap();

        let mut h = headers();
        h.message_id_norm = Some("other@d.com".to_string());
        let imported = db
            .reserve_discovery("INBOX", 2, 7, FP_B, &h, 100, None)
            .await
            .unwrap()
            .row;
        db.record_downloaded(imported.id, "bb/22/b.eml", "beef", 100)
            .await
            .unwrap();
        db.record_imported(imported.id, "g1", None, &[]).await.unwrap();

        db.reset(ResetScope::SkippedAndFailed).await.unwrap();

        let pending = db.pending_import().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, failed.id);

        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.imported, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn reset_duplicate_rows_still_hit_the_dedupe_gate() {
        let (_dir, db) = open_db().await;

        // Canonical row in INBOX, duplicate reference in Archive.
        let canonical = db
            .reserve_discovery("INBOX", 1, 7, FP_A, &headers(), 100, None)
            .await
            .unwrap()
            .row;
        db.record_duplicate("Archive", 9, 3, FP_A, "duplicate of INBOX/1")
            .await
            .unwrap();

        db.reset(ResetScope::SkippedAndFailed).await.unwrap();

        // Re-scan of the Archive copy: the placeholder row must not claim
        // the fingerprint the canonical row already owns.
        let rescan = db
            .reserve_discovery("Archive", 9, 3, FP_A, &headers(), 100, None)
            .await
            .unwrap();
        assert!(!rescan.is_new);
        assert!(!rescan.same_source);
        assert_eq!(rescan.row.id, canonical.id);

        // A reset placeholder whose fingerprint is genuinely unclaimed is
        // re-bound in place instead of inserting a second source row.
        let mut h = headers();
        h.message_id_norm = None;
        db.record_skipped_filtered("INBOX", 2, 7, &h, "filtered").await.unwrap();
        db.reset(ResetScope::SkippedAndFailed).await.unwrap();
        let rebound = db
            .reserve_discovery("INBOX", 2, 7, FP_B, &h, 64, None)
            .await
            .unwrap();
        assert!(!rebound.is_new);
        assert!(rebound.same_source);
        assert_eq!(rebound.row.fingerprint.as_deref(), Some(FP_B));
        assert_eq!(rebound.row.status, MessageStatus::Discovered);
    }

    #[tokio::test]
    async fn checkpoints_advance_monotonically_per_epoch() {
        let (_dir, db) = open_db().await;

        let cp = db.begin_folder_scan("INBOX", 7, Some(10)).await.unwrap();
        assert_eq!(cp.highest_uid_done, 0);
        assert_eq!(cp.status, FolderScanStatus::Scanning);

        db.checkpoint_folder("INBOX", 7, 50, FolderScanStatus::Scanning)
            .await
            .unwrap();
        db.checkpoint_folder("INBOX", 7, 20, FolderScanStatus::Scanning)
            .await
            .unwrap();
        let cp = db.get_folder_checkpoint("INBOX", 7).await.unwrap().unwrap();
        assert_eq!(cp.highest_uid_done, 50);

        // New UIDVALIDITY: fresh epoch starting from zero.
        let cp = db.begin_folder_scan("INBOX", 8, Some(10)).await.unwrap();
        assert_eq!(cp.highest_uid_done, 0);
        assert_eq!(db.list_folder_checkpoints().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn label_cache_round_trips() {
        let (_dir, db) = open_db().await;
        assert!(db.get_label("iCloud/Inbox").await.unwrap().is_none());
        db.put_label("iCloud/Inbox", "Label_12").await.unwrap();
        assert_eq!(
            db.get_label("iCloud/Inbox").await.unwrap().as_deref(),
            Some("Label_12")
        );
    }

    #[tokio::test]
    async fn filtered_skips_record_no_fingerprint() {
        let (_dir, db) = open_db().await;
        db.record_skipped_filtered("INBOX", 4, 7, &headers(), "no target address")
            .await
            .unwrap();
        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.skipped, 1);
        assert!(db.evidence_rows().await.unwrap().is_empty());
    }
}
