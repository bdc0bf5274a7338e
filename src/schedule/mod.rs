//! Recurring backups driven by `CRON_EXPRESSION`.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use tracing::{error, info};

use crate::backup;
use crate::config::{AppConfig, RUN_ONCE};
use crate::errors::AppError;

#[derive(Debug, Clone)]
pub enum Mode {
    Once,
    Recurring(Schedule),
}

/// Rewrites a classic cron expression into the form the `cron` crate parses.
///
/// 5-field expressions get a leading `0` seconds field. For 5- and 6-field
/// expressions the day of week is renumbered from 0-7 (0 and 7 are Sunday) to
/// 1-7 (1 is Sunday). Names such as `MON-FRI` and 7-field expressions pass
/// through unchanged.
pub fn normalize_expression(expression: &str) -> String {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    if fields.len() == 6 {
        fields[5] = renumber_days_of_week(&fields[5]);
    }
    fields.join(" ")
}

fn renumber_days_of_week(field: &str) -> String {
    let mut days = BTreeSet::new();
    let mut untouched = Vec::new();
    for item in field.split(',') {
        match classic_days(item) {
            Some(classic) => days.extend(classic.into_iter().map(|day| day % 7 + 1)),
            None => untouched.push(item.to_string()),
        }
    }
    days.iter().map(u32::to_string).chain(untouched).collect::<Vec<_>>().join(",")
}

/// Expands one list item (`3`, `1-5`, `*/2`, `1-5/2`) into classic day numbers.
/// `None` leaves the item for the parser to accept or reject.
fn classic_days(item: &str) -> Option<Vec<u32>> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step.parse::<u32>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };
    let (start, end) = match (base, step) {
        ("*", None) => return None,
        ("*", Some(_)) => (0, 6),
        _ => match base.split_once('-') {
            Some((first, last)) => (first.parse().ok()?, last.parse().ok()?),
            None => {
                let day: u32 = base.parse().ok()?;
                (day, if step.is_some() { 6 } else { day })
            }
        },
    };
    if start > end || end > 7 {
        return None;
    }
    Some((start..=end).step_by(step.unwrap_or(1) as usize).collect())
}

pub fn mode_for(expression: &str) -> crate::errors::Result<Mode> {
    if expression.trim() == RUN_ONCE {
        return Ok(Mode::Once);
    }
    Schedule::from_str(&normalize_expression(expression))
        .map(Mode::Recurring)
        .map_err(|e| AppError::Config(format!("invalid CRON_EXPRESSION '{}': {}", expression, e)))
}

/// Next fire time strictly after `now`, and how long to sleep until it.
pub fn next_fire<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> Option<(DateTime<Tz>, Duration)> {
    let next = schedule.after(now).next()?;
    let wait = (next.clone() - now.clone()).to_std().unwrap_or(Duration::ZERO);
    Some((next, wait))
}

/// Runs backups forever on the configured schedule, or once for `-1`.
///
/// In recurring mode a failed run is logged and the loop waits for the next
/// fire time. Runs never overlap.
pub async fn run_schedule(config: &AppConfig) -> Result<()> {
    let schedule = match mode_for(&config.cron_expression)? {
        Mode::Once => {
            info!("Running backup once.");
            backup::run_backup_flow(config).await?;
            return Ok(());
        }
        Mode::Recurring(schedule) => schedule,
    };

    info!(cron = %config.cron_expression, "Running backup every {}", config.cron_expression);
    if config.run_on_start {
        run_logged(config).await;
    } else {
        info!("Skipping initial backup, enable with RUN_ON_START=true if you want to run a backup on start.");
    }

    loop {
        let (next, wait) = next_fire(&schedule, &Local::now())
            .with_context(|| format!("CRON_EXPRESSION '{}' never fires again", config.cron_expression))?;
        info!(next = %next.to_rfc3339(), "Next backup scheduled");
        tokio::time::sleep(wait).await;
        run_logged(config).await;
    }
}

async fn run_logged(config: &AppConfig) {
    match backup::run_backup_flow(config).await {
        Ok(report) => info!(artifact = %report.artifact.name, pruned = report.pruned, "Scheduled backup finished"),
        Err(e) => error!(error = %format!("{:#}", e), "Scheduled backup failed"),
    }
}
