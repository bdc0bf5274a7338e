use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::read::GzDecoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};
use crate::utils::{find_executable, format_size, redact_db_url};

const CHUNK_SIZE: usize = 64 * 1024;

/// Loads a decrypted `.tar.gz` dump into the target database.
#[async_trait::async_trait]
pub trait RestoreRunner: Send + Sync {
    async fn restore(&self, connection_string: &str, archive: &Path) -> Result<()>;
}

/// `gunzip -c <archive> | pg_restore --clean --if-exists --no-owner`.
pub struct PgRestore {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl PgRestore {
    pub fn locate() -> Result<Self> {
        let program = find_executable("pg_restore")?;
        debug!(path = %program.display(), "Found pg_restore executable");
        Ok(Self { program, leading_args: Vec::new() })
    }

    #[cfg(test)]
    fn with_command(program: &str, leading_args: &[&str]) -> Self {
        Self {
            program: PathBuf::from(program),
            leading_args: leading_args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait::async_trait]
impl RestoreRunner for PgRestore {
    async fn restore(&self, connection_string: &str, archive: &Path) -> Result<()> {
        info!(
            database = %redact_db_url(connection_string),
            archive = %archive.display(),
            "Restoring backup with pg_restore"
        );

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(format!("--dbname={}", connection_string))
            .args(["--clean", "--if-exists", "--no-owner"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("pg_restore stdin was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("pg_restore stderr was not captured"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
        let archive_path = archive.to_path_buf();
        let decompress = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut decoder = GzDecoder::new(BufReader::new(File::open(&archive_path)?));
            let mut chunk = vec![0u8; CHUNK_SIZE];
            loop {
                let n = decoder.read(&mut chunk)?;
                // receiver gone means pg_restore stopped reading
                if n == 0 || tx.blocking_send(chunk[..n].to_vec()).is_err() {
                    return Ok(());
                }
            }
        });

        let mut piped: u64 = 0;
        while let Some(chunk) = rx.recv().await {
            match stdin.write_all(&chunk).await {
                Ok(()) => piped += chunk.len() as u64,
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("pg_restore closed its input early");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        drop(rx);
        drop(stdin);

        let decompressed = decompress.await.map_err(std::io::Error::other)?;
        let status = child.wait().await?;
        let stderr = stderr_task.await.map_err(std::io::Error::other)??;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        if !status.success() {
            return Err(AppError::RestoreProcess { status, stderr });
        }
        decompressed?;
        if !stderr.trim().is_empty() {
            warn!(target: "pg_restore", "{}", stderr.trim_end());
        }

        info!(restored = %format_size(piped), "Restore complete");
        Ok(())
    }
}
