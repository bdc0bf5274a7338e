use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication with the service credential failed: {0}")]
    Auth(String),

    #[error("No access to FOLDER_ID {folder_id}: {reason}")]
    FolderAccess { folder_id: String, reason: String },

    #[error("{tool} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.")]
    ToolNotFound { tool: &'static str },

    #[error("pg_dump failed ({status}): {stderr}")]
    DumpProcess { status: ExitStatus, stderr: String },

    #[error("Backup file is empty: {}", .0.display())]
    EmptyBackup(PathBuf),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed (wrong passphrase or corrupted payload): {0}")]
    Decryption(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Remote store operation failed: {0}")]
    RemoteStore(String),

    #[error("pg_restore failed ({status}): {stderr}")]
    RestoreProcess { status: ExitStatus, stderr: String },

    #[error("No backup files found in the remote folder")]
    NoArtifacts,

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// A step of the backup or restore pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PruningRetention,
    Dumping,
    Encrypting,
    Uploading,
    CleaningUp,
    SelectingArtifact,
    Downloading,
    Decrypting,
    Restoring,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PruningRetention => "pruning retention",
            Stage::Dumping => "dumping",
            Stage::Encrypting => "encrypting",
            Stage::Uploading => "uploading",
            Stage::CleaningUp => "cleaning up",
            Stage::SelectingArtifact => "selecting artifact",
            Stage::Downloading => "downloading",
            Stage::Decrypting => "decrypting",
            Stage::Restoring => "restoring",
        };
        f.write_str(name)
    }
}

/// A pipeline failure, tagged with the stage it happened in.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: AppError,
}

/// Attaches a [`Stage`] to the error of a stage result.
pub trait AtStage<T> {
    fn at_stage(self, stage: Stage) -> std::result::Result<T, PipelineError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at_stage(self, stage: Stage) -> std::result::Result<T, PipelineError> {
        self.map_err(|source| PipelineError { stage, source })
    }
}
