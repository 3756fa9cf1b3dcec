use crate::PipelineError;
use ferry_mail::sha256_file_hex;
use ferry_storage::{EvidenceStore, StateDb};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct VerifyMismatch {
    pub fingerprint: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub checked: u64,
    pub mismatches: Vec<VerifyMismatch>,
}

impl VerifyOutcome {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Recompute the SHA-256 of every evidence file claimed by the state store
/// and compare hash and size. Reports only; nothing is mutated.
pub async fn verify_evidence(
    db: &StateDb,
    store: &EvidenceStore,
) -> Result<VerifyOutcome, PipelineError> {
    let rows = db.evidence_rows().await?;
    let mut outcome = VerifyOutcome::default();

    for row in rows {
        let Some(rel_path) = row.evidence_path.as_deref() else {
            continue;
        };
        let Some(expected_sha) = row.evidence_sha256.as_deref() else {
            continue;
        };
        outcome.checked += 1;

        let fingerprint = row.fingerprint.clone().unwrap_or_default();
        let full = store.full_path(rel_path);

        if !full.exists() {
            outcome.mismatches.push(VerifyMismatch {
                fingerprint,
                path: rel_path.to_string(),
                reason: "evidence file missing".to_string(),
            });
            continue;
        }

        if let Some(expected_size) = row.size_bytes {
            let actual_size = std::fs::metadata(&full)?.len() as i64;
            if actual_size != expected_size {
                outcome.mismatches.push(VerifyMismatch {
                    fingerprint,
                    path: rel_path.to_string(),
                    reason: format!("size mismatch: expected {expected_size}, found {actual_size}"),
                });
                continue;
            }
        }

        let actual_sha = sha256_file_hex(&full)?;
        if actual_sha != expected_sha {
            warn!(fingerprint = %fingerprint, path = rel_path, "evidence hash mismatch");
            outcome.mismatches.push(VerifyMismatch {
                fingerprint,
                path: rel_path.to_string(),
                reason: format!("sha256 mismatch: expected {expected_sha}, found {actual_sha}"),
            });
        }
    }

    info!(
        checked = outcome.checked,
        mismatches = outcome.mismatches.len(),
        "evidence verification finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_mail::fingerprint_message;

    async fn seeded() -> (tempfile::TempDir, StateDb, EvidenceStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::connect(&dir.path().join("state.sqlite3"))
            .await
            .unwrap();
        let store = EvidenceStore::new(dir.path().join("evidence"));

        let raw = b"Message-ID: <v@d.com>\r\nFrom: a@d.com\r\nSubject: hi\r\n\r\nverify me";
        let fp = fingerprint_message(raw, 4096).unwrap();
        let reservation = db
            .reserve_discovery("INBOX", 1, 7, &fp.fingerprint, &fp.headers, raw.len() as u64, None)
            .await
            .unwrap();
        let written = store.write(&fp.fingerprint, raw).unwrap();
        db.record_downloaded(
            reservation.row.id,
            &written.rel_path,
            &written.sha256,
            written.size_bytes,
        )
        .await
        .unwrap();

        (dir, db, store, written.rel_path)
    }

    #[tokio::test]
    async fn clean_store_verifies() {
        let (_dir, db, store, _) = seeded().await;
        let outcome = verify_evidence(&db, &store).await.unwrap();
        assert_eq!(outcome.checked, 1);
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn bit_flip_is_detected_and_state_unchanged() {
        let (_dir, db, store, rel_path) = seeded().await;

        // Corrupt one byte; the file is read-only, so lift that first.
        let full = store.full_path(&rel_path);
        let mut perms = std::fs::metadata(&full).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(&full, perms).unwrap();
        let mut bytes = std::fs::read(&full).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&full, &bytes).unwrap();

        let outcome = verify_evidence(&db, &store).await.unwrap();
        assert_eq!(outcome.mismatches.len(), 1);
        assert!(!outcome.mismatches[0].fingerprint.is_empty());

        // Verification never mutates rows.
        let counts = db.counts_by_status().await.unwrap();
        assert_eq!(counts.downloaded, 1);
    }

    #[tokio::test]
    async fn missing_file_is_a_mismatch() {
        let (_dir, db, store, rel_path) = seeded().await;
        let full = store.full_path(&rel_path);
        let mut perms = std::fs::metadata(&full).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(&full, perms).unwrap();
        std::fs::remove_file(&full).unwrap();

        let outcome = verify_evidence(&db, &store).await.unwrap();
        assert_eq!(outcome.mismatches.len(), 1);
        assert_eq!(outcome.mismatches[0].reason, "evidence file missing");
    }
}
