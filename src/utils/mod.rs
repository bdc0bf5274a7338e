use std::path::PathBuf;

use url::Url;
use which::which;

use crate::errors::{AppError, Result};

/// Finds a PostgreSQL client tool in the system PATH.
pub fn find_executable(tool: &'static str) -> Result<PathBuf> {
    which(tool).map_err(|_| AppError::ToolNotFound { tool })
}

/// Returns the connection URL with any password masked, for logging.
pub fn redact_db_url(db_url: &str) -> String {
    match Url::parse(db_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

/// Human readable byte count, e.g. `1.50 MiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
