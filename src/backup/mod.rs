pub(crate) mod db_dump;
pub(crate) mod logic;
pub(crate) mod retention;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::config::AppConfig;
use crate::storage::DriveClient;
use db_dump::PgDump;
use logic::{BackupOrchestrator, BackupReport};

/// Public entry point for one backup run against the configured Drive folder.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<BackupReport> {
    let store = DriveClient::new(app_config.folder_id.clone(), app_config.service_account_path.clone());
    let dumper = PgDump::locate()?;
    info!(folder_id = store.folder_id(), retention = %app_config.retention, "Backing up to Google Drive");

    let report = BackupOrchestrator::new(app_config, &store, &dumper)
        .run(Utc::now())
        .await?;
    Ok(report)
}
