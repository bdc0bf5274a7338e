//! Encrypted PostgreSQL backups to a Google Drive folder.
//!
//! Provides CLI interface for backup, restore, scheduled backups and configuration

mod backup;
mod config;
mod crypto;
mod errors;
mod restore;
mod schedule;
mod storage;
mod utils;

use anyhow::{Context, Result};
use config::AppConfig;
use std::env;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run_app().await {
        Ok(()) => {
            info!("Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let choice = match env::args().nth(1) {
        Some(arg) => arg.trim().to_string(),
        None => prompt_choice()?,
    };

    match choice.as_str() {
        "1" | "backup" => {
            info!("Starting backup");
            let app_config = AppConfig::load()?;
            let report = backup::run_backup_flow(&app_config).await.context("Backup process failed")?;
            info!(artifact = %report.artifact.name, pruned = report.pruned, "Backup finished");
        }
        "2" | "restore" => {
            info!("Starting restore");
            let app_config = AppConfig::load()?;
            let report = restore::run_restore_flow(&app_config).await.context("Restore process failed")?;
            info!(
                artifact = %report.artifact.name,
                local_file = %report.local_path.display(),
                "Restore finished"
            );
        }
        "3" | "schedule" | "cron" => {
            let app_config = AppConfig::load()?;
            schedule::run_schedule(&app_config).await.context("Scheduled backups stopped")?;
        }
        "4" | "config" => {
            let path = config::run_wizard().context("Config wizard failed")?;
            info!("Config written to {}", path.display());
        }
        other => {
            anyhow::bail!(
                "Invalid choice '{}'. Please enter '1' (backup), '2' (restore), '3' (schedule) or '4' (config).",
                other
            );
        }
    }
    Ok(())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. Run Scheduled Backups (or type 'schedule')");
    println!("4. Configure (or type 'config')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
