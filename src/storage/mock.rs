// In-memory RemoteStore used by the orchestrator tests.
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Artifact, BACKUP_MIME_TYPE, RemoteStore, TransferProgress, sort_newest_first};
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    VerifyFolderAccess,
    List,
    ListOlderThan(DateTime<Utc>),
    Upload(String),
    Download(String),
    Delete(String),
}

#[derive(Default)]
pub struct MockStore {
    pub objects: Mutex<Vec<(Artifact, Vec<u8>)>>,
    pub calls: Mutex<Vec<Call>>,
    pub deny_folder_access: bool,
    pub fail_uploads: bool,
    pub fail_delete_of: Option<String>,
}

pub fn artifact(id: &str, created_time: DateTime<Utc>) -> Artifact {
    Artifact {
        id: id.to_string(),
        name: format!("db-backup-{id}.tar.gz"),
        created_time,
        size_bytes: None,
        mime_type: BACKUP_MIME_TYPE.to_string(),
    }
}

impl MockStore {
    pub fn with_artifacts(artifacts: Vec<Artifact>) -> Self {
        let objects = artifacts.into_iter().map(|a| (a, Vec::new())).collect();
        Self { objects: Mutex::new(objects), ..Self::default() }
    }

    pub fn with_objects(objects: Vec<(Artifact, Vec<u8>)>) -> Self {
        Self { objects: Mutex::new(objects), ..Self::default() }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining_ids(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().map(|(a, _)| a.id.clone()).collect()
    }

    pub fn uploaded_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a.name == name)
            .map(|(_, bytes)| bytes.clone())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl RemoteStore for MockStore {
    async fn verify_folder_access(&self) -> Result<()> {
        self.record(Call::VerifyFolderAccess);
        if self.deny_folder_access {
            return Err(AppError::FolderAccess {
                folder_id: "mock-folder".to_string(),
                reason: "404 Not Found".to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Artifact>> {
        self.record(Call::List);
        let mut artifacts: Vec<_> = self.objects.lock().unwrap().iter().map(|(a, _)| a.clone()).collect();
        sort_newest_first(&mut artifacts);
        Ok(artifacts)
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Artifact>> {
        self.record(Call::ListOlderThan(cutoff));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a.created_time < cutoff)
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn upload(&self, local_path: &Path, display_name: &str) -> Result<Artifact> {
        self.record(Call::Upload(display_name.to_string()));
        if self.fail_uploads {
            return Err(AppError::Transfer("connection reset by peer".to_string()));
        }
        let bytes = tokio::fs::read(local_path).await?;
        let artifact = Artifact {
            id: format!("id-{display_name}"),
            name: display_name.to_string(),
            created_time: Utc::now(),
            size_bytes: Some(bytes.len() as u64),
            mime_type: BACKUP_MIME_TYPE.to_string(),
        };
        self.objects.lock().unwrap().push((artifact.clone(), bytes));
        Ok(artifact)
    }

    async fn download(
        &self,
        artifact_id: &str,
        local_path: &Path,
        on_progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<PathBuf> {
        self.record(Call::Download(artifact_id.to_string()));
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a.id == artifact_id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| AppError::Transfer(format!("download of {artifact_id} returned 404")))?;
        tokio::fs::write(local_path, &bytes).await?;
        on_progress(TransferProgress {
            transferred_bytes: bytes.len() as u64,
            total_bytes: Some(bytes.len() as u64),
            elapsed: Duration::from_millis(5),
        });
        Ok(local_path.to_path_buf())
    }

    async fn delete(&self, artifact_id: &str) -> Result<()> {
        self.record(Call::Delete(artifact_id.to_string()));
        if self.fail_delete_of.as_deref() == Some(artifact_id) {
            return Err(AppError::RemoteStore(format!("delete {artifact_id} returned 403 Forbidden")));
        }
        self.objects.lock().unwrap().retain(|(a, _)| a.id != artifact_id);
        Ok(())
    }
}
