use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use tracing::info;

use crate::errors::{AppError, Result};
use crate::storage::RemoteStore;

/// How long backups are kept in the remote folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionUnit {
    #[default]
    Disabled,
    Week,
    Month,
    Year,
}

impl FromStr for RetentionUnit {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "disabled" => Ok(RetentionUnit::Disabled),
            "week" => Ok(RetentionUnit::Week),
            "month" => Ok(RetentionUnit::Month),
            "year" => Ok(RetentionUnit::Year),
            other => Err(AppError::Config(format!(
                "RETENTION must be one of week, month, year or disabled (got '{}')",
                other
            ))),
        }
    }
}

impl fmt::Display for RetentionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetentionUnit::Disabled => "disabled",
            RetentionUnit::Week => "week",
            RetentionUnit::Month => "month",
            RetentionUnit::Year => "year",
        })
    }
}

/// `now` minus one `unit`, or `None` when retention is disabled.
///
/// Months and years are calendar arithmetic; the day is clamped to the end of
/// the target month (31 March minus one month is 29 or 28 February).
pub fn compute_cutoff(unit: RetentionUnit, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match unit {
        RetentionUnit::Disabled => None,
        RetentionUnit::Week => Some(now - Duration::weeks(1)),
        RetentionUnit::Month => now.checked_sub_months(Months::new(1)),
        RetentionUnit::Year => now.checked_sub_months(Months::new(12)),
    }
}

/// Deletes every backup created before the retention cutoff.
///
/// Stops at the first failed deletion. Returns how many artifacts were removed.
pub async fn prune_stale_backups(
    store: &dyn RemoteStore,
    unit: RetentionUnit,
    now: DateTime<Utc>,
) -> Result<usize> {
    let Some(cutoff) = compute_cutoff(unit, now) else {
        info!("Retention disabled, keeping all existing backups");
        return Ok(0);
    };

    info!(retention = %unit, cutoff = %cutoff.to_rfc3339(), "Deleting old backups older than a {}", unit);
    store.verify_folder_access().await?;
    let stale = store.list_older_than(cutoff).await?;

    for artifact in &stale {
        store.delete(&artifact.id).await?;
        info!(artifact = %artifact.name, created = %artifact.created_time, "Deleted stale backup");
    }

    info!(deleted = stale.len(), "Delete complete, proceeding with backup");
    Ok(stale.len())
}
