pub(crate) mod db_restore;
pub(crate) mod logic;
pub(crate) mod selection;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::storage::DriveClient;
use db_restore::PgRestore;
use logic::{RestoreOrchestrator, RestoreReport};
use selection::PromptChooser;

/// Public entry point for the interactive restore.
pub async fn run_restore_flow(app_config: &AppConfig) -> Result<RestoreReport> {
    let store = DriveClient::new(app_config.folder_id.clone(), app_config.service_account_path.clone());
    let runner = PgRestore::locate()?;
    info!(
        folder_id = store.folder_id(),
        destination = %app_config.restore_path.display(),
        "Restoring from Google Drive"
    );

    let report = RestoreOrchestrator::new(app_config, &store, &PromptChooser, &runner)
        .run()
        .await?;
    Ok(report)
}
