use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};
use crate::utils::{find_executable, format_size, redact_db_url};

const CHUNK_SIZE: usize = 64 * 1024;

/// Produces a gzip-compressed tar dump of a database.
#[async_trait::async_trait]
pub trait DumpProducer: Send + Sync {
    /// Writes the dump to `destination` and returns that path.
    ///
    /// The file is left on disk when this fails.
    async fn produce_dump(&self, connection_string: &str, destination: &Path) -> Result<PathBuf>;
}

/// `pg_dump --format=tar`, gzipped on the way to disk.
pub struct PgDump {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl PgDump {
    pub fn locate() -> Result<Self> {
        let program = find_executable("pg_dump")?;
        debug!(path = %program.display(), "Found pg_dump executable");
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
impl DumpProducer for PgDump {
    async fn produce_dump(&self, connection_string: &str, destination: &Path) -> Result<PathBuf> {
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(
            database = %redact_db_url(connection_string),
            path = %destination.display(),
            "Starting pg_dump"
        );

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(format!("--dbname={}", connection_string))
            .arg("--format=tar")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("pg_dump stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("pg_dump stderr was not captured"))?;
        // Drained concurrently so a chatty pg_dump cannot block on a full stderr pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let file = File::create(destination)?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
        let compress = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            while let Some(chunk) = rx.blocking_recv() {
                encoder.write_all(&chunk)?;
            }
            encoder.finish()?.flush()
        });

        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = stdout.read(&mut chunk).await?;
            // a closed receiver means the encoder failed; its error is surfaced below
            if n == 0 || tx.send(chunk[..n].to_vec()).await.is_err() {
                break;
            }
        }
        drop(tx);
        compress.await.map_err(std::io::Error::other)??;

        let status = child.wait().await?;
        let stderr = stderr_task.await.map_err(std::io::Error::other)??;
        let stderr = String::from_utf8_lossy(&stderr).trim_end().to_string();

        if !status.success() {
            return Err(AppError::DumpProcess { status, stderr });
        }
        if !stderr.is_empty() {
            info!(target: "pg_dump", "{}", stderr);
        }

        let path = destination.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || validate_dump_archive(&path))
            .await
            .map_err(std::io::Error::other)??;

        info!(
            size = %format_size(summary.size_bytes),
            entries = ?summary.tar_entries,
            path = %destination.display(),
            "Backup file created"
        );
        Ok(destination.to_path_buf())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    pub size_bytes: u64,
    /// Entry count of the tar stream, when it could be read.
    pub tar_entries: Option<usize>,
}

/// Checks that the archive decompresses to at least one byte.
///
/// pg_dump can exit 0 without writing anything on some connection failures,
/// so a zero exit status alone does not prove a usable backup.
pub fn validate_dump_archive(path: &Path) -> Result<DumpSummary> {
    let size_bytes = std::fs::metadata(path)?.len();

    let mut first = [0u8; 1];
    let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    match decoder.read(&mut first) {
        Ok(1) => {}
        Ok(_) => return Err(AppError::EmptyBackup(path.to_path_buf())),
        Err(e) => {
            debug!(error = %e, path = %path.display(), "Backup does not decompress");
            return Err(AppError::EmptyBackup(path.to_path_buf()));
        }
    }

    let tar_entries = match count_tar_entries(path) {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Could not inspect the tar stream of the backup");
            None
        }
    };

    Ok(DumpSummary { size_bytes, tar_entries })
}

fn count_tar_entries(path: &Path) -> std::io::Result<usize> {
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(File::open(path)?)));
    let mut count = 0;
    for entry in archive.entries()? {
        entry?;
        count += 1;
    }
    Ok(count)
}
