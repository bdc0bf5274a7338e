use std::io::{BufRead, Write};

use chrono::SecondsFormat;

use crate::errors::{AppError, Result};
use crate::storage::Artifact;

/// Picks the backup to restore out of a non-empty, newest-first listing.
pub trait ArtifactChooser: Send + Sync {
    /// Returns the index of the chosen artifact.
    fn choose(&self, artifacts: &[Artifact]) -> Result<usize>;
}

pub fn describe(artifact: &Artifact) -> String {
    format!(
        "Backup file: {} created at: {}",
        artifact.name,
        artifact.created_time.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Numbered prompt on the terminal.
pub struct PromptChooser;

impl ArtifactChooser for PromptChooser {
    fn choose(&self, artifacts: &[Artifact]) -> Result<usize> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        choose_from(artifacts, &mut stdin.lock(), &mut stdout.lock())
    }
}

fn choose_from(artifacts: &[Artifact], input: &mut impl BufRead, output: &mut impl Write) -> Result<usize> {
    writeln!(output, "Select a backup file to restore:")?;
    for (i, artifact) in artifacts.iter().enumerate() {
        writeln!(output, "{}. {}", i + 1, describe(artifact))?;
    }
    write!(output, "Enter your choice [1]: ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(0);
    }

    match line.parse::<usize>() {
        Ok(n) if (1..=artifacts.len()).contains(&n) => Ok(n - 1),
        _ => Err(AppError::InvalidSelection(format!(
            "'{}' is not a number between 1 and {}",
            line,
            artifacts.len()
        ))),
    }
}
