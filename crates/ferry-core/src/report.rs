use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub discovered: u64,
    pub downloaded: u64,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.discovered + self.downloaded + self.imported + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderReport {
    pub name: String,
    pub uidvalidity: u32,
    pub highest_uid_done: u32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub fingerprint: String,
    pub kind: String,
    pub retries: i64,
}

/// Summary artifact written into `reports/` and printed by `verify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReport {
    pub generated_at: DateTime<Utc>,
    pub counts: StatusCounts,
    pub folders: Vec<FolderReport>,
    pub failures: Vec<FailureReport>,
    #[serde(default)]
    pub evidence_mismatches: u64,
}
