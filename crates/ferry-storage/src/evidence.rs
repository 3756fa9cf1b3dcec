use crate::StorageError;
use ferry_mail::{sha256_file_hex, sha256_hex};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Identity of a committed evidence file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceWritten {
    /// Path relative to the evidence root.
    pub rel_path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Content-addressed store of immutable `.eml` files. The tree is split on
/// the first two byte pairs of the fingerprint to bound directory fanout:
/// `<aa>/<bb>/<fingerprint>.eml`.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rel_path(fingerprint: &str) -> String {
        format!(
            "{}/{}/{fingerprint}.eml",
            &fingerprint[..2],
            &fingerprint[2..4]
        )
    }

    pub fn full_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    /// Write raw RFC 5322 bytes under the fingerprint's path. The write goes
    /// to a temp file first and the rename is the commit; the committed file
    /// is made read-only. If the target already exists its hash is compared:
    /// a match returns the existing identity, a mismatch is corruption.
    pub fn write(&self, fingerprint: &str, raw: &[u8]) -> Result<EvidenceWritten, StorageError> {
        let rel = Self::rel_path(fingerprint);
        let target = self.root.join(&rel);
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Data(format!("evidence path has no parent: {rel}")))?;
        fs::create_dir_all(parent)?;

        let sha256 = sha256_hex(raw);

        if target.exists() {
            return self.verify_existing(&target, &rel, &sha256);
        }

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(raw)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        match tmp.persist_noclobber(&target) {
            Ok(_) => {}
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the rename race; converge on the winner's bytes.
                return self.verify_existing(&target, &rel, &sha256);
            }
            Err(err) => return Err(err.error.into()),
        }

        sync_dir(parent)?;
        make_read_only(&target)?;
        debug!(path = %target.display(), size = raw.len(), "evidence committed");

        Ok(EvidenceWritten {
            rel_path: rel,
            sha256,
            size_bytes: raw.len() as u64,
        })
    }

    fn verify_existing(
        &self,
        target: &Path,
        rel: &str,
        expected_sha: &str,
    ) -> Result<EvidenceWritten, StorageError> {
        let actual = sha256_file_hex(target)
            .map_err(|_| StorageError::Data(format!("unreadable evidence file: {rel}")))?;
        if actual != expected_sha {
            return Err(StorageError::EvidenceCorruption {
                path: rel.to_string(),
                expected: expected_sha.to_string(),
                actual,
            });
        }
        let size_bytes = fs::metadata(target)?.len();
        Ok(EvidenceWritten {
            rel_path: rel.to_string(),
            sha256: actual,
            size_bytes,
        })
    }

    pub fn read(&self, rel_path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.full_path(rel_path))?)
    }
}

#[cfg(unix)]
fn make_read_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))
}

#[cfg(not(unix))]
fn make_read_only(path: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    fs::File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";

    #[test]
    fn writes_content_addressed_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());
        let written = store.write(FP, b"raw message").unwrap();

        assert_eq!(written.rel_path, format!("aa/bb/{FP}.eml"));
        assert_eq!(written.size_bytes, 11);
        assert_eq!(written.sha256, sha256_hex(b"raw message"));
        assert_eq!(store.read(&written.rel_path).unwrap(), b"raw message");
    }

    #[cfg(unix)]
    #[test]
    fn committed_file_is_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());
        let written = store.write(FP, b"raw message").unwrap();

        let mode = fs::metadata(store.full_path(&written.rel_path))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[test]
    fn rewrite_of_identical_bytes_converges() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());
        let first = store.write(FP, b"same bytes").unwrap();
        let second = store.write(FP, b"same bytes").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn conflicting_bytes_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(dir.path());
        store.write(FP, b"original").unwrap();

        let err = store.write(FP, b"different").unwrap_err();
        assert!(matches!(err, StorageError::EvidenceCorruption { .. }));
    }
}
