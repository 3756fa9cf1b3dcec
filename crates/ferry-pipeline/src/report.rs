use crate::PipelineError;
use chrono::Utc;
use ferry_core::{FailureReport, FolderReport, SummaryReport};
use ferry_storage::StateDb;
use std::path::{Path, PathBuf};
use tracing::info;

/// Assemble the summary artifact from the state store.
pub async fn build_report(
    db: &StateDb,
    evidence_mismatches: u64,
) -> Result<SummaryReport, PipelineError> {
    let counts = db.counts_by_status().await?;

    let folders = db
        .list_folder_checkpoints()
        .await?
        .into_iter()
        .map(|cp| FolderReport {
            name: cp.folder,
            uidvalidity: cp.uidvalidity,
            highest_uid_done: cp.highest_uid_done,
            status: cp.status.as_str().to_string(),
        })
        .collect();

    let failures = db
        .failures()
        .await?
        .into_iter()
        .map(|row| FailureReport {
            fingerprint: row.fingerprint.unwrap_or_default(),
            kind: row.last_error_kind.unwrap_or_else(|| "unknown".to_string()),
            retries: row.attempts,
        })
        .collect();

    Ok(SummaryReport {
        generated_at: Utc::now(),
        counts,
        folders,
        failures,
        evidence_mismatches,
    })
}

/// Write the report under `reports/<timestamp>.json` and return its path.
pub fn write_report(report: &SummaryReport, reports_dir: &Path) -> Result<PathBuf, PipelineError> {
    std::fs::create_dir_all(reports_dir)?;
    let name = report
        .generated_at
        .format("%Y-%m-%dT%H-%M-%SZ")
        .to_string();
    let path = reports_dir.join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
    info!(path = %path.display(), "report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{ErrorKind, FolderScanStatus, MinimalHeaders};

    #[tokio::test]
    async fn report_carries_counts_folders_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::connect(&dir.path().join("state.sqlite3"))
            .await
            .unwrap();

        let fp = "cc33333333333333333333333333333333333333333333333333333333333333";
        let row = db
            .reserve_discovery("INBOX", 1, 7, fp, &MinimalHeaders::default(), 10, None)
            .await
            .unwrap()
            .row;
        db.record_downloaded(row.id, "cc/33/x.eml", "feed", 10)
            .await
            .unwrap();
        db.record_failure(row.id, ErrorKind::RemoteRejected, "400", true, 5)
            .await
            .unwrap();

        db.begin_folder_scan("INBOX", 7, Some(1)).await.unwrap();
        db.checkpoint_folder("INBOX", 7, 1, FolderScanStatus::Done)
            .await
            .unwrap();

        let report = build_report(&db, 0).await.unwrap();
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.folders.len(), 1);
        assert_eq!(report.folders[0].status, "done");
        assert_eq!(report.folders[0].highest_uid_done, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].fingerprint, fp);
        assert_eq!(report.failures[0].kind, "remote_rejected");

        let path = write_report(&report, &dir.path().join("reports")).unwrap();
        let parsed: SummaryReport =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(parsed.counts.failed, 1);
    }
}
