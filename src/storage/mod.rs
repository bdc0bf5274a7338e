//! Remote object storage for backup artifacts.
//!
//! Every operation is scoped to the single folder the store was built for.

pub(crate) mod auth;
pub(crate) mod gdrive;
#[cfg(test)]
pub(crate) mod mock;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::Result;

pub use gdrive::DriveClient;

/// Content type every backup artifact is stored with.
pub const BACKUP_MIME_TYPE: &str = "application/gzip";

/// A single backup unit as it exists in the remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Opaque identifier assigned by the store.
    pub id: String,
    /// Display name, also used as the local file name.
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    pub mime_type: String,
}

/// Snapshot of a running download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub transferred_bytes: u64,
    pub total_bytes: Option<u64>,
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Throughput in MiB/s since the transfer started.
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / (1024.0 * 1024.0) / secs
    }

    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.transferred_bytes as f64 * 100.0 / total as f64),
            None => None,
        }
    }
}

/// Operations the backup and restore pipelines need from the remote folder.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fails with `FolderAccess` when the folder is not readable with the credential.
    async fn verify_folder_access(&self) -> Result<()>;

    /// All backup artifacts in the folder, newest first.
    async fn list(&self) -> Result<Vec<Artifact>>;

    /// Backup artifacts created strictly before `cutoff`.
    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Artifact>>;

    /// Uploads `local_path` as a new artifact called `display_name`.
    async fn upload(&self, local_path: &Path, display_name: &str) -> Result<Artifact>;

    /// Streams the artifact's content into `local_path`.
    async fn download(
        &self,
        artifact_id: &str,
        local_path: &Path,
        on_progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<PathBuf>;

    async fn delete(&self, artifact_id: &str) -> Result<()>;
}

/// Orders artifacts by descending creation time; ties keep their listing order.
pub fn sort_newest_first(artifacts: &mut [Artifact]) {
    artifacts.sort_by(|a, b| b.created_time.cmp(&a.created_time));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn artifact(id: &str, created: DateTime<Utc>) -> Artifact {
        Artifact {
            id: id.to_string(),
            name: format!("db-backup-{id}.tar.gz"),
            created_time: created,
            size_bytes: None,
            mime_type: BACKUP_MIME_TYPE.to_string(),
        }
    }

    #[test]
    fn sorts_newest_first() {
        let day = |d| Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap();
        let mut artifacts = vec![artifact("a", day(2)), artifact("b", day(9)), artifact("c", day(5))];
        sort_newest_first(&mut artifacts);
        let ids: Vec<_> = artifacts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }

    #[test]
    fn progress_throughput() {
        let progress = TransferProgress {
            transferred_bytes: 4 * 1024 * 1024,
            total_bytes: Some(8 * 1024 * 1024),
            elapsed: Duration::from_secs(2),
        };
        assert!((progress.mib_per_sec() - 2.0).abs() < f64::EPSILON);
        assert_eq!(progress.percent(), Some(50.0));

        let idle = TransferProgress { transferred_bytes: 10, total_bytes: None, elapsed: Duration::ZERO };
        assert_eq!(idle.mib_per_sec(), 0.0);
        assert_eq!(idle.percent(), None);
    }
}
