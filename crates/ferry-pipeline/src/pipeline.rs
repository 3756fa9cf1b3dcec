use crate::retry::{fetch_delay, ingest_delay};
use crate::PipelineError;
use ferry_config::AppConfig;
use ferry_core::{
    ErrorKind, FolderScanStatus, InternalDateSource, MessageStatus, StatusCounts,
};
use ferry_gmail::{LabelCache, MessageIngestor};
use ferry_imap::{Folder, HeaderFetch, ImapPool};
use ferry_mail::{fingerprint_message, map_folder, parse_minimal_headers, AddressFilter};
use ferry_storage::{EvidenceStore, StateDb};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

const FETCH_ATTEMPTS: usize = 5;
const INGEST_ATTEMPTS: i64 = 5;

/// One unit of work between the download stage and the ingestion workers.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub row_id: i64,
    pub evidence_path: String,
    pub label_ids: Vec<String>,
    pub internal_date_source: InternalDateSource,
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub counts: StatusCounts,
    pub interrupted: bool,
}

/// The fetch → evidence → ingest state machine. Discovery producers (one
/// logical task per mailbox) feed a bounded queue; a fixed worker pool
/// drains it into Gmail. All progress is committed to the state store
/// before the next stage may observe it.
pub struct Migration {
    config: AppConfig,
    db: StateDb,
    evidence: EvidenceStore,
    pool: ImapPool,
    ingestor: Option<Arc<dyn MessageIngestor>>,
    labels: Option<Arc<LabelCache>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    ingest_backoff: Option<Duration>,
}

struct MailboxCtx {
    db: StateDb,
    evidence: EvidenceStore,
    pool: ImapPool,
    labels: Option<Arc<LabelCache>>,
    filter: AddressFilter,
    tx: Option<mpsc::Sender<WorkItem>>,
    label_prefix: String,
    fingerprint_body_bytes: usize,
    internal_date_source: InternalDateSource,
    shutdown: watch::Receiver<bool>,
}

impl Migration {
    pub fn new(
        config: AppConfig,
        db: StateDb,
        evidence: EvidenceStore,
        pool: ImapPool,
        ingestor: Option<Arc<dyn MessageIngestor>>,
        labels: Option<Arc<LabelCache>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            db,
            evidence,
            pool,
            ingestor,
            labels,
            shutdown_tx,
            shutdown_rx,
            ingest_backoff: None,
        }
    }

    /// Override the worker backoff delay; test hook.
    pub fn with_ingest_backoff(mut self, delay: Duration) -> Self {
        self.ingest_backoff = Some(delay);
        self
    }

    /// Handle for external cancellation (SIGINT/SIGTERM). Producers stop
    /// enqueuing, workers finish their current item, then everything joins.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub async fn run(&self) -> Result<MigrationOutcome, PipelineError> {
        let dry_run = self.ingestor.is_none();
        info!(dry_run, "migration starting");

        let (tx, rx) = mpsc::channel::<WorkItem>(self.config.concurrency.queue_maxsize);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::new();
        if let Some(ingestor) = &self.ingestor {
            for worker_idx in 0..self.config.concurrency.gmail_workers {
                workers.push(tokio::spawn(ingest_worker(
                    worker_idx,
                    Arc::clone(&rx),
                    self.db.clone(),
                    self.evidence.clone(),
                    Arc::clone(ingestor),
                    self.shutdown_rx.clone(),
                    self.shutdown_tx.clone(),
                    self.ingest_backoff,
                )));
            }

            // Recover rows stranded between evidence write and import by a
            // previous crash: they enter the queue before discovery begins.
            self.drain_pending(&tx).await?;
        }

        let discovery = self.run_discovery(if dry_run { None } else { Some(tx.clone()) });
        let discovery_result = discovery.await;
        drop(tx);

        for worker in workers {
            worker.await?;
        }
        discovery_result?;

        let counts = self.db.counts_by_status().await?;
        let interrupted = *self.shutdown_rx.borrow();
        info!(
            imported = counts.imported,
            skipped = counts.skipped,
            failed = counts.failed,
            interrupted,
            "migration finished"
        );

        Ok(MigrationOutcome {
            counts,
            interrupted,
        })
    }

    async fn drain_pending(&self, tx: &mpsc::Sender<WorkItem>) -> Result<(), PipelineError> {
        let pending = self.db.pending_import().await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "resuming rows pending import");

        for row in pending {
            let Some(evidence_path) = row.evidence_path.clone() else {
                warn!(row_id = row.id, "downloaded row without evidence path");
                continue;
            };
            let label_ids = match self.resolve_labels(&row.folder, None).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(row_id = row.id, error = %err, "label resolution failed on resume");
                    Vec::new()
                }
            };
            let item = WorkItem {
                row_id: row.id,
                evidence_path,
                label_ids,
                internal_date_source: self.internal_date_source_for(row.date_header.as_deref()),
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn run_discovery(&self, tx: Option<mpsc::Sender<WorkItem>>) -> Result<(), PipelineError> {
        let mut handle = self.pool.acquire().await?;
        let folders = handle.list_folders().await?;
        drop(handle);

        let folders = self.filter_mailboxes(folders);
        if folders.is_empty() {
            warn!("no mailboxes selected for discovery");
            return Ok(());
        }
        info!(count = folders.len(), "discovered mailboxes");

        let imap_cfg = self
            .config
            .imap
            .as_ref()
            .ok_or_else(|| PipelineError::Aborted("imap configuration missing".to_string()))?;

        let filter = AddressFilter::new(
            self.config.filter.target_addresses.clone(),
            self.config.filter.include_sender,
            self.config.filter.include_recipients,
        );

        let mut tasks = Vec::new();
        for folder in folders {
            let ctx = MailboxCtx {
                db: self.db.clone(),
                evidence: self.evidence.clone(),
                pool: self.pool.clone(),
                labels: self.labels.clone(),
                filter: filter.clone(),
                tx: tx.clone(),
                label_prefix: self
                    .config
                    .gmail
                    .as_ref()
                    .map(|gmail| gmail.label_prefix.clone())
                    .unwrap_or_else(|| "iCloud".to_string()),
                fingerprint_body_bytes: self.config.storage.fingerprint_body_bytes,
                internal_date_source: self.default_internal_date_source(),
                shutdown: self.shutdown_rx.clone(),
            };
            let batch_size = imap_cfg.batch_size;
            let search_query = imap_cfg.search_query.clone();
            let fetch_concurrency = self.config.concurrency.imap_fetch_concurrency;

            tasks.push(tokio::spawn(async move {
                process_mailbox(ctx, folder, batch_size, search_query, fetch_concurrency).await
            }));
        }

        let mut first_err = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "mailbox discovery failed");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(join_err.into());
                    }
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn filter_mailboxes(&self, folders: Vec<Folder>) -> Vec<Folder> {
        let Some(imap_cfg) = self.config.imap.as_ref() else {
            return folders;
        };
        let include: Vec<&str> = imap_cfg
            .folder_include
            .iter()
            .map(String::as_str)
            .collect();
        let exclude: Vec<&str> = imap_cfg
            .folder_exclude
            .iter()
            .map(String::as_str)
            .collect();

        folders
            .into_iter()
            .filter(|folder| {
                if !include.is_empty() && !include.contains(&folder.name.as_str()) {
                    return false;
                }
                !exclude.contains(&folder.name.as_str())
            })
            .collect()
    }

    fn default_internal_date_source(&self) -> InternalDateSource {
        self.config
            .gmail
            .as_ref()
            .map(|gmail| gmail.internal_date_source)
            .unwrap_or(InternalDateSource::DateHeader)
    }

    fn internal_date_source_for(&self, date_header: Option<&str>) -> InternalDateSource {
        date_fallback(self.default_internal_date_source(), date_header)
    }

    async fn resolve_labels(
        &self,
        folder: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<String>, PipelineError> {
        resolve_labels(
            &self.db,
            self.labels.as_deref(),
            &self
                .config
                .gmail
                .as_ref()
                .map(|gmail| gmail.label_prefix.clone())
                .unwrap_or_else(|| "iCloud".to_string()),
            folder,
            delimiter,
        )
        .await
    }
}

/// `dateHeader` is only usable when the message actually has a parseable
/// `Date:`; otherwise Gmail gets `receivedTime` for that one message.
fn date_fallback(configured: InternalDateSource, date_header: Option<&str>) -> InternalDateSource {
    match configured {
        InternalDateSource::DateHeader => {
            let parseable = date_header
                .map(|raw| mail_date_parses(raw))
                .unwrap_or(false);
            if parseable {
                InternalDateSource::DateHeader
            } else {
                InternalDateSource::ReceivedTime
            }
        }
        InternalDateSource::ReceivedTime => InternalDateSource::ReceivedTime,
    }
}

fn mail_date_parses(raw: &str) -> bool {
    ferry_mail::parse_minimal_headers(format!("Date: {raw}\r\n\r\n").as_bytes())
        .map(|headers| headers.date_epoch.is_some())
        .unwrap_or(false)
}

async fn resolve_labels(
    db: &StateDb,
    labels: Option<&LabelCache>,
    prefix: &str,
    folder: &str,
    delimiter: Option<&str>,
) -> Result<Vec<String>, PipelineError> {
    let mapping = map_folder(prefix, folder, delimiter);
    let mut ids = Vec::new();

    if let Some(system) = mapping.system_label {
        ids.push(system.id().to_string());
    }

    if let Some(cache) = labels {
        let id = match db.get_label(&mapping.custom_label).await? {
            Some(id) => id,
            None => {
                let id = cache.ensure(&mapping.custom_label).await?;
                db.put_label(&mapping.custom_label, &id).await?;
                id
            }
        };
        ids.push(id);
    }

    ids.sort();
    ids.dedup();
    Ok(ids)
}

async fn process_mailbox(
    ctx: MailboxCtx,
    folder: Folder,
    batch_size: usize,
    search_query: String,
    fetch_concurrency: usize,
) -> Result<(), PipelineError> {
    let name = folder.name.clone();

    let mut handle = ctx.pool.acquire().await?;
    let select = handle.select(&name).await?;
    drop(handle);
    let db = ctx.db.clone();

    let result = scan_mailbox(
        ctx,
        folder,
        select,
        batch_size,
        search_query,
        fetch_concurrency,
    )
    .await;

    if result.is_err() {
        let _ = db
            .checkpoint_folder(&name, select.uidvalidity, 0, FolderScanStatus::Error)
            .await;
    }
    result
}

async fn scan_mailbox(
    ctx: MailboxCtx,
    folder: Folder,
    select: ferry_imap::SelectInfo,
    batch_size: usize,
    search_query: String,
    fetch_concurrency: usize,
) -> Result<(), PipelineError> {
    let name = folder.name.clone();

    let checkpoint = ctx
        .db
        .begin_folder_scan(&name, select.uidvalidity, Some(select.exists as i64))
        .await?;

    let uids = {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut handle = ctx.pool.acquire().await?;
            match handle.uid_search(&name, &search_query).await {
                Ok(uids) => break uids,
                Err(err) if err.is_transient() && attempt < FETCH_ATTEMPTS => {
                    warn!(folder = %name, attempt, error = %err, "uid search failed, retrying");
                    tokio::time::sleep(fetch_delay(attempt)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    };

    let start_after = checkpoint.highest_uid_done;
    let uids: Vec<u32> = uids.into_iter().filter(|uid| *uid > start_after).collect();
    info!(
        folder = %name,
        uidvalidity = select.uidvalidity,
        total = uids.len(),
        resume_after = start_after,
        "scanning mailbox"
    );

    let fetch_permits = Arc::new(Semaphore::new(fetch_concurrency.max(1)));
    let mut interrupted = false;
    let mut last_uid = start_after;

    for chunk in uids.chunks(batch_size.max(1)) {
        if *ctx.shutdown.borrow() {
            interrupted = true;
            break;
        }

        let heads = {
            let mut attempt = 0usize;
            loop {
                attempt += 1;
                let mut handle = ctx.pool.acquire().await?;
                match handle.fetch_headers(&name, chunk).await {
                    Ok(heads) => break heads,
                    Err(err) if err.is_transient() && attempt < FETCH_ATTEMPTS => {
                        warn!(folder = %name, attempt, error = %err, "header fetch failed, retrying");
                        tokio::time::sleep(fetch_delay(attempt)).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let mut by_uid: HashMap<u32, HeaderFetch> = heads
            .into_iter()
            .map(|head| (head.uid, head))
            .collect();

        let mut batch_tasks = Vec::new();
        for uid in chunk {
            let Some(head) = by_uid.remove(uid) else {
                // The server returned no data for this UID (expunged mid
                // scan); record the skip so the checkpoint can pass it.
                debug!(folder = %name, uid, "uid missing from header fetch");
                ctx.db
                    .record_skipped_filtered(
                        &name,
                        *uid,
                        select.uidvalidity,
                        &Default::default(),
                        "uid missing from header fetch (expunged?)",
                    )
                    .await?;
                continue;
            };

            let headers = match parse_minimal_headers(&head.header) {
                Ok(headers) => headers,
                Err(err) => {
                    warn!(folder = %name, uid = head.uid, error = %err, "unparseable headers");
                    ctx.db
                        .record_skipped_filtered(
                            &name,
                            head.uid,
                            select.uidvalidity,
                            &Default::default(),
                            &format!("unparseable headers: {err}"),
                        )
                        .await?;
                    continue;
                }
            };

            if !ctx.filter.matches(&headers) {
                ctx.db
                    .record_skipped_filtered(
                        &name,
                        head.uid,
                        select.uidvalidity,
                        &headers,
                        "no target address in sender or recipients",
                    )
                    .await?;
                continue;
            }

            let permit = Arc::clone(&fetch_permits).acquire_owned().await.expect("semaphore");
            let task_ctx = MessageCtx {
                db: ctx.db.clone(),
                evidence: ctx.evidence.clone(),
                pool: ctx.pool.clone(),
                labels: ctx.labels.clone(),
                tx: ctx.tx.clone(),
                label_prefix: ctx.label_prefix.clone(),
                fingerprint_body_bytes: ctx.fingerprint_body_bytes,
                internal_date_source: ctx.internal_date_source,
                folder: name.clone(),
                delimiter: folder.delimiter.clone(),
                uidvalidity: select.uidvalidity,
                shutdown: ctx.shutdown.clone(),
            };
            batch_tasks.push(tokio::spawn(async move {
                let result = process_message(&task_ctx, head).await;
                drop(permit);
                result
            }));
        }

        for task in batch_tasks {
            if let Err(err) = task.await? {
                // Per-message failures are recorded in the state store; a
                // storage failure here is the only thing that stops the scan.
                match err {
                    PipelineError::Storage(storage_err) => return Err(storage_err.into()),
                    other => {
                        error!(folder = %name, error = %other, "message left for a later run")
                    }
                }
            }
        }

        if let Some(max_uid) = chunk.iter().max() {
            last_uid = last_uid.max(*max_uid);
            ctx.db
                .checkpoint_folder(&name, select.uidvalidity, *max_uid, FolderScanStatus::Scanning)
                .await?;
        }
    }

    let final_status = if interrupted {
        FolderScanStatus::Scanning
    } else {
        FolderScanStatus::Done
    };
    ctx.db
        .checkpoint_folder(&name, select.uidvalidity, last_uid, final_status)
        .await?;

    Ok(())
}

struct MessageCtx {
    db: StateDb,
    evidence: EvidenceStore,
    pool: ImapPool,
    labels: Option<Arc<LabelCache>>,
    tx: Option<mpsc::Sender<WorkItem>>,
    label_prefix: String,
    fingerprint_body_bytes: usize,
    internal_date_source: InternalDateSource,
    folder: String,
    delimiter: Option<String>,
    uidvalidity: u32,
    shutdown: watch::Receiver<bool>,
}

/// Download stage for a single UID: full-body fetch, fingerprint, dedupe
/// gate, evidence write, promotion to `downloaded`, enqueue for ingestion.
async fn process_message(ctx: &MessageCtx, head: HeaderFetch) -> Result<(), PipelineError> {
    let uid = head.uid;

    let body = {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut handle = ctx.pool.acquire().await?;
            match handle.fetch_body(&ctx.folder, uid).await {
                Ok(body) => break body,
                Err(err) if err.is_transient() && attempt < FETCH_ATTEMPTS => {
                    warn!(folder = %ctx.folder, uid, attempt, error = %err, "body fetch failed, retrying");
                    tokio::time::sleep(fetch_delay(attempt)).await;
                }
                Err(err) => {
                    // Exhausted retries: record the miss so the checkpoint
                    // can move past this UID without silently dropping it.
                    warn!(folder = %ctx.folder, uid, error = %err, "body fetch permanently failed");
                    ctx.db
                        .record_fetch_failure(
                            &ctx.folder,
                            uid,
                            ctx.uidvalidity,
                            err.kind(),
                            &err.to_string(),
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
    };

    let fp = match fingerprint_message(&body.raw, ctx.fingerprint_body_bytes) {
        Ok(fp) => fp,
        Err(err) => {
            ctx.db
                .record_skipped_filtered(
                    &ctx.folder,
                    uid,
                    ctx.uidvalidity,
                    &Default::default(),
                    &format!("unparseable message: {err}"),
                )
                .await?;
            return Ok(());
        }
    };

    let reservation = ctx
        .db
        .reserve_discovery(
            &ctx.folder,
            uid,
            ctx.uidvalidity,
            &fp.fingerprint,
            &fp.headers,
            body.raw.len() as u64,
            body.internal_date.or(head.internal_date),
        )
        .await?;

    if !reservation.same_source {
        ctx.db
            .record_duplicate(
                &ctx.folder,
                uid,
                ctx.uidvalidity,
                reservation.row.fingerprint.as_deref().unwrap_or(&fp.fingerprint),
                &format!(
                    "duplicate of {}/{} (row {})",
                    reservation.row.folder, reservation.row.uid, reservation.row.id
                ),
            )
            .await?;
        debug!(folder = %ctx.folder, uid, "duplicate suppressed");
        return Ok(());
    }

    if reservation.row.status != MessageStatus::Discovered {
        // Already downloaded, imported, or terminally resolved on an
        // earlier run; the checkpoint just had not advanced past it yet.
        return Ok(());
    }
    let row_id = reservation.row.id;

    let written = match ctx.evidence.write(&fp.fingerprint, &body.raw) {
        Ok(written) => written,
        Err(err) => {
            let kind = err.kind();
            ctx.db
                .record_failure(row_id, kind, &err.to_string(), true, INGEST_ATTEMPTS)
                .await?;
            error!(folder = %ctx.folder, uid, error = %err, "evidence write failed");
            return Ok(());
        }
    };

    let promoted = ctx
        .db
        .record_downloaded(row_id, &written.rel_path, &written.sha256, written.size_bytes)
        .await?;
    if !promoted {
        return Ok(());
    }

    let internal_date_source = date_fallback(
        ctx.internal_date_source,
        fp.headers.date_raw.as_deref(),
    );
    if internal_date_source != ctx.internal_date_source {
        ctx.db
            .append_note(row_id, "no parseable Date header; internalDate from receivedTime")
            .await?;
    }

    let Some(tx) = &ctx.tx else {
        // Dry run stops at the evidence boundary.
        return Ok(());
    };
    if *ctx.shutdown.borrow() {
        return Ok(());
    }

    let label_ids = resolve_labels(
        &ctx.db,
        ctx.labels.as_deref(),
        &ctx.label_prefix,
        &ctx.folder,
        ctx.delimiter.as_deref(),
    )
    .await?;

    let _ = tx
        .send(WorkItem {
            row_id,
            evidence_path: written.rel_path,
            label_ids,
            internal_date_source,
        })
        .await;
    Ok(())
}

/// Ingestion worker: dequeue, call Gmail, commit the outcome. Transient
/// errors are retried here with backoff honoring `Retry-After`; every
/// attempt is recorded so retry counts survive a crash.
#[allow(clippy::too_many_arguments)]
async fn ingest_worker(
    worker_idx: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    db: StateDb,
    evidence: EvidenceStore,
    ingestor: Arc<dyn MessageIngestor>,
    shutdown: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    backoff_override: Option<Duration>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let item = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(item) = item else { break };

        if let Err(err) = ingest_one(&db, &evidence, ingestor.as_ref(), &item, backoff_override).await
        {
            match err {
                PipelineError::Gmail(gmail_err)
                    if gmail_err.kind() == ErrorKind::AuthFailed =>
                {
                    // Nothing else can succeed without credentials.
                    error!(worker = worker_idx, error = %gmail_err, "auth failure, aborting run");
                    let _ = shutdown_tx.send(true);
                }
                err => {
                    error!(worker = worker_idx, row_id = item.row_id, error = %err, "worker error");
                }
            }
        }
    }
}

async fn ingest_one(
    db: &StateDb,
    evidence: &EvidenceStore,
    ingestor: &dyn MessageIngestor,
    item: &WorkItem,
    backoff_override: Option<Duration>,
) -> Result<(), PipelineError> {
    let raw = match evidence.read(&item.evidence_path) {
        Ok(raw) => raw,
        Err(err) => {
            db.record_failure(
                item.row_id,
                ErrorKind::EvidenceIo,
                &err.to_string(),
                true,
                INGEST_ATTEMPTS,
            )
            .await?;
            return Ok(());
        }
    };

    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match ingestor
            .ingest(&raw, &item.label_ids, item.internal_date_source)
            .await
        {
            Ok(result) => {
                let committed = db
                    .record_imported(
                        item.row_id,
                        &result.gmail_message_id,
                        result.gmail_thread_id.as_deref(),
                        &item.label_ids,
                    )
                    .await?;
                if !committed {
                    warn!(row_id = item.row_id, "import commit refused, row not in downloaded");
                }
                return Ok(());
            }
            Err(err) if err.is_transient() => {
                let hint = err.retry_after();
                let attempts_recorded = db
                    .record_failure(
                        item.row_id,
                        err.kind(),
                        &err.to_string(),
                        false,
                        INGEST_ATTEMPTS,
                    )
                    .await?;
                if attempts_recorded >= INGEST_ATTEMPTS {
                    warn!(row_id = item.row_id, "retry budget exhausted");
                    return Ok(());
                }
                let delay = backoff_override.unwrap_or_else(|| ingest_delay(attempt, hint));
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                db.record_failure(
                    item.row_id,
                    err.kind(),
                    &err.to_string(),
                    true,
                    INGEST_ATTEMPTS,
                )
                .await?;
                if err.kind() == ErrorKind::AuthFailed {
                    return Err(err.into());
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_gmail::{GmailError, IngestResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubIngestor {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl MessageIngestor for StubIngestor {
        async fn ingest(
            &self,
            _raw: &[u8],
            _label_ids: &[String],
            _internal_date_source: InternalDateSource,
        ) -> Result<IngestResult, GmailError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(GmailError::Quota {
                    retry_after_secs: Some(0),
                });
            }
            Ok(IngestResult {
                gmail_message_id: format!("gm-{n}"),
                gmail_thread_id: Some("thread-1".to_string()),
                label_ids: Vec::new(),
            })
        }
    }

    async fn downloaded_row(
        db: &StateDb,
        evidence: &EvidenceStore,
        uid: u32,
        raw: &[u8],
    ) -> (i64, String) {
        let fp = fingerprint_message(raw, 4096).unwrap();
        let reservation = db
            .reserve_discovery("INBOX", uid, 7, &fp.fingerprint, &fp.headers, raw.len() as u64, None)
            .await
            .unwrap();
        let written = evidence.write(&fp.fingerprint, raw).unwrap();
        assert!(db
            .record_downloaded(reservation.row.id, &written.rel_path, &written.sha256, written.size_bytes)
            .await
            .unwrap());
        (reservation.row.id, written.rel_path)
    }

    #[tokio::test]
    async fn worker_imports_a_downloaded_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::connect(&dir.path().join("state.sqlite3")).await.unwrap();
        let evidence = EvidenceStore::new(dir.path().join("evidence"));

        let raw = b"Message-ID: <a@d.com>\r\nFrom: a@d.com\r\nSubject: hi\r\n\r\nbody";
        let (row_id, rel_path) = downloaded_row(&db, &evidence, 1, raw).await;

        let ingestor = StubIngestor {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        };
        ingest_one(
            &db,
            &evidence,
            &ingestor,
            &WorkItem {
                row_id,
                evidence_path: rel_path,
                label_ids: vec!["INBOX".to_string()],
                internal_date_source: InternalDateSource::DateHeader,
            },
            Some(Duration::from_millis(1)),
        )
        .await
        .unwrap();

        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.imported, 1);
        assert_eq!(ingestor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_quota_errors_are_retried_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::connect(&dir.path().join("state.sqlite3")).await.unwrap();
        let evidence = EvidenceStore::new(dir.path().join("evidence"));

        let raw = b"Message-ID: <b@d.com>\r\nFrom: a@d.com\r\nSubject: hi\r\n\r\nbody";
        let (row_id, rel_path) = downloaded_row(&db, &evidence, 2, raw).await;

        // Three 429s, then success: the row finishes imported with the
        // transient attempts recorded.
        let ingestor = StubIngestor {
            calls: AtomicUsize::new(0),
            fail_first: 3,
        };
        ingest_one(
            &db,
            &evidence,
            &ingestor,
            &WorkItem {
                row_id,
                evidence_path: rel_path,
                label_ids: Vec::new(),
                internal_date_source: InternalDateSource::DateHeader,
            },
            Some(Duration::from_millis(1)),
        )
        .await
        .unwrap();

        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.imported, 1);
        assert_eq!(ingestor.calls.load(Ordering::SeqCst), 4);

        let rows = db.evidence_rows().await.unwrap();
        let row = rows.iter().find(|row| row.id == row_id).unwrap();
        assert_eq!(row.attempts, 3);
        assert_eq!(row.status, MessageStatus::Imported);
    }

    #[tokio::test]
    async fn permanent_rejection_fails_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::connect(&dir.path().join("state.sqlite3")).await.unwrap();
        let evidence = EvidenceStore::new(dir.path().join("evidence"));

        struct Rejecting;
        #[async_trait::async_trait]
        impl MessageIngestor for Rejecting {
            async fn ingest(
                &self,
                _raw: &[u8],
                _label_ids: &[String],
                _internal_date_source: InternalDateSource,
            ) -> Result<IngestResult, GmailError> {
                Err(GmailError::Rejected {
                    status: 400,
                    body: "invalid".to_string(),
                })
            }
        }

        let raw = b"Message-ID: <c@d.com>\r\nFrom: a@d.com\r\nSubject: hi\r\n\r\nbody";
        let (row_id, rel_path) = downloaded_row(&db, &evidence, 3, raw).await;

        ingest_one(
            &db,
            &evidence,
            &Rejecting,
            &WorkItem {
                row_id,
                evidence_path: rel_path,
                label_ids: Vec::new(),
                internal_date_source: InternalDateSource::DateHeader,
            },
            Some(Duration::from_millis(1)),
        )
        .await
        .unwrap();

        let failures = db.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].last_error_kind.as_deref(), Some("remote_rejected"));
    }

    #[test]
    fn date_fallback_applies_only_to_unparseable_dates() {
        assert_eq!(
            date_fallback(InternalDateSource::DateHeader, Some("Mon, 01 Jan 2024 00:00:00 +0000")),
            InternalDateSource::DateHeader
        );
        assert_eq!(
            date_fallback(InternalDateSource::DateHeader, Some("not a date")),
            InternalDateSource::ReceivedTime
        );
        assert_eq!(
            date_fallback(InternalDateSource::DateHeader, None),
            InternalDateSource::ReceivedTime
        );
        assert_eq!(
            date_fallback(InternalDateSource::ReceivedTime, Some("Mon, 01 Jan 2024 00:00:00 +0000")),
            InternalDateSource::ReceivedTime
        );
    }
}
