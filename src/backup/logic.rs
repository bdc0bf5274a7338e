use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::db_dump::DumpProducer;
use super::retention::prune_stale_backups;
use crate::config::AppConfig;
use crate::crypto;
use crate::errors::{AppError, AtStage, PipelineError, Stage};
use crate::storage::{Artifact, RemoteStore};
use crate::utils::redact_db_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    PruningRetention,
    Dumping,
    Encrypting,
    Uploading,
    CleaningUp,
    Done,
    Failed(Stage),
}

/// Outcome of a successful backup run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub artifact: Artifact,
    pub pruned: usize,
}

/// `{prefix}{timestamp}.tar.gz`, where the timestamp is ISO-8601 UTC with
/// the fractional-second dot replaced by a dash so names sort by time.
pub fn display_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}{}.tar.gz", prefix, now.format("%Y-%m-%dT%H:%M:%S-%3fZ"))
}

/// Runs one backup: prune, dump, encrypt, upload, then remove the local file.
///
/// Nothing is rolled back on failure; whatever the failed stage left on
/// disk stays there.
pub struct BackupOrchestrator<'a> {
    config: &'a AppConfig,
    store: &'a dyn RemoteStore,
    dumper: &'a dyn DumpProducer,
    state: BackupState,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(config: &'a AppConfig, store: &'a dyn RemoteStore, dumper: &'a dyn DumpProducer) -> Self {
        Self { config, store, dumper, state: BackupState::Idle }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn enter(&mut self, state: BackupState) {
        info!(from = ?self.state, to = ?state, "Backup state transition");
        self.state = state;
    }

    pub async fn run(&mut self, now: DateTime<Utc>) -> Result<BackupReport, PipelineError> {
        match self.run_stages(now).await {
            Ok(report) => {
                self.enter(BackupState::Done);
                info!(artifact = %report.artifact.name, id = %report.artifact.id, "All done!");
                Ok(report)
            }
            Err(e) => {
                self.state = BackupState::Failed(e.stage);
                error!(stage = %e.stage, error = %e.source, "Backup failed");
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, now: DateTime<Utc>) -> Result<BackupReport, PipelineError> {
        self.enter(BackupState::PruningRetention);
        let pruned = prune_stale_backups(self.store, self.config.retention, now)
            .await
            .at_stage(Stage::PruningRetention)?;

        let name = display_name(&self.config.file_prefix, now);
        let local_path: PathBuf = self.config.scratch_dir.join(&name);

        self.enter(BackupState::Dumping);
        info!(
            file = %name,
            database = %redact_db_url(&self.config.database_url),
            "Starting backup"
        );
        self.dumper
            .produce_dump(&self.config.database_url, &local_path)
            .await
            .at_stage(Stage::Dumping)?;

        self.enter(BackupState::Encrypting);
        crypto::encrypt_file(&local_path, &self.config.encryption_secret)
            .await
            .at_stage(Stage::Encrypting)?;

        self.enter(BackupState::Uploading);
        self.store.verify_folder_access().await.at_stage(Stage::Uploading)?;
        let artifact = self.store.upload(&local_path, &name).await.at_stage(Stage::Uploading)?;
        info!(artifact = %artifact.name, id = %artifact.id, "Backup uploaded");

        self.enter(BackupState::CleaningUp);
        tokio::fs::remove_file(&local_path)
            .await
            .map_err(AppError::from)
            .at_stage(Stage::CleaningUp)?;

        Ok(BackupReport { artifact, pruned })
    }
}
