use std::fmt;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::backup::retention::RetentionUnit;
use crate::utils::redact_db_url;

pub const CONFIG_DIR_NAME: &str = ".pg_gdrive";
pub const ENV_FILENAME: &str = ".env";

pub const DEFAULT_FILE_PREFIX: &str = "db-backup-";
pub const DEFAULT_CRON_EXPRESSION: &str = "0 17 * * *";
pub const DEFAULT_RESTORE_PATH: &str = "./downloaded-backup.tar.gz";
/// `CRON_EXPRESSION` value meaning "back up once and exit".
pub const RUN_ONCE: &str = "-1";

// Misspelled key written by earlier releases.
const LEGACY_SECRET_KEY: &str = "ENCYRPTION_SECRET";

#[derive(Clone)]
pub struct AppConfig {
    pub service_account_path: PathBuf,
    pub folder_id: String,
    pub database_url: String,
    pub encryption_secret: String,
    pub file_prefix: String,
    pub retention: RetentionUnit,
    pub cron_expression: String,
    pub run_on_start: bool,
    /// Where backups are dumped and encrypted before upload.
    pub scratch_dir: PathBuf,
    /// Where a restore downloads and decrypts the chosen backup.
    pub restore_path: PathBuf,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("service_account_path", &self.service_account_path)
            .field("folder_id", &self.folder_id)
            .field("database_url", &redact_db_url(&self.database_url))
            .field("encryption_secret", &"****")
            .field("file_prefix", &self.file_prefix)
            .field("retention", &self.retention)
            .field("cron_expression", &self.cron_expression)
            .field("run_on_start", &self.run_on_start)
            .field("scratch_dir", &self.scratch_dir)
            .field("restore_path", &self.restore_path)
            .finish()
    }
}

/// `~/.pg_gdrive`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine the home directory")?;
    Ok(home.join(CONFIG_DIR_NAME))
}

pub fn env_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(ENV_FILENAME))
}

impl AppConfig {
    /// Loads `~/.pg_gdrive/.env` into the environment, then reads every key
    /// from the environment. Variables already set take precedence over the file.
    pub fn load() -> Result<Self> {
        let env_file = env_file_path()?;
        if env_file.exists() {
            dotenv::from_path(&env_file)
                .with_context(|| format!("Failed to read config file at {}", env_file.display()))?;
            debug!(path = %env_file.display(), "Loaded config file");
        } else {
            info!(
                path = %env_file.display(),
                "Config file not found, reading the environment only (run `config` to create one)"
            );
        }

        Self::from_lookup(|key| std::env::var(key).ok())
            .context("Error loading config, please check your configuration file.")
    }

    /// Builds the configuration from a key lookup. Blank values count as unset.
    ///
    /// Values are trimmed, except the encryption secret: surrounding spaces are
    /// part of the passphrase that existing archives were encrypted with.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let get_verbatim = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).with_context(|| format!("{} must be set", key));

        let encryption_secret = get_verbatim("ENCRYPTION_SECRET")
            .or_else(|| get_verbatim(LEGACY_SECRET_KEY))
            .context("ENCRYPTION_SECRET must be set")?;

        let file_prefix = get("FILE_PREFIX").unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string());
        if !is_valid_file_prefix(&file_prefix) {
            bail!("FILE_PREFIX must not contain path separators or '..' (got '{}')", file_prefix);
        }

        let retention = match get("RETENTION") {
            Some(raw) => raw.parse::<RetentionUnit>()?,
            None => RetentionUnit::Disabled,
        };

        let run_on_start = match get("RUN_ON_START") {
            Some(raw) => parse_bool(&raw).with_context(|| format!("RUN_ON_START must be true or false (got '{}')", raw))?,
            None => true,
        };

        Ok(AppConfig {
            service_account_path: PathBuf::from(required("SERVICE_ACCOUNT_PATH")?),
            folder_id: required("FOLDER_ID")?,
            database_url: required("DATABASE_URL")?,
            encryption_secret,
            file_prefix,
            retention,
            cron_expression: get("CRON_EXPRESSION").unwrap_or_else(|| DEFAULT_CRON_EXPRESSION.to_string()),
            run_on_start,
            scratch_dir: get("SCRATCH_DIR").map(PathBuf::from).unwrap_or_else(std::env::temp_dir),
            restore_path: PathBuf::from(get("RESTORE_PATH").unwrap_or_else(|| DEFAULT_RESTORE_PATH.to_string())),
        })
    }

    #[cfg(test)]
    pub fn for_tests(dir: &Path) -> Self {
        AppConfig {
            service_account_path: dir.join("service-account.json"),
            folder_id: "folder-1".to_string(),
            database_url: "postgres://app:pw@localhost:5432/orders".to_string(),
            encryption_secret: "test-secret".to_string(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            retention: RetentionUnit::Disabled,
            cron_expression: DEFAULT_CRON_EXPRESSION.to_string(),
            run_on_start: true,
            scratch_dir: dir.to_path_buf(),
            restore_path: dir.join("downloaded-backup.tar.gz"),
        }
    }
}

/// Backups are written to `scratch_dir/<prefix><timestamp>.tar.gz`, so the
/// prefix must stay a plain file name fragment.
fn is_valid_file_prefix(prefix: &str) -> bool {
    !prefix.contains(['/', '\\']) && !prefix.contains("..")
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// One prompt of the config wizard.
struct WizardField {
    key: &'static str,
    label: &'static str,
    default: Option<&'static str>,
}

const WIZARD_FIELDS: &[WizardField] = &[
    WizardField { key: "SERVICE_ACCOUNT_PATH", label: "Enter SERVICE_ACCOUNT path", default: None },
    WizardField { key: "FOLDER_ID", label: "Enter FOLDER_ID", default: None },
    WizardField { key: "DATABASE_URL", label: "Enter DATABASE_URL", default: None },
    WizardField { key: "RUN_ON_START", label: "Run on start? (true/false)", default: Some("true") },
    WizardField { key: "FILE_PREFIX", label: "Enter FILE_PREFIX", default: Some(DEFAULT_FILE_PREFIX) },
    WizardField { key: "ENCRYPTION_SECRET", label: "Enter ENCRYPTION_SECRET", default: None },
    WizardField {
        key: "RETENTION",
        label: "Retention (week/month/year/disabled)",
        default: Some("disabled"),
    },
    WizardField {
        key: "CRON_EXPRESSION",
        label: "Enter CRON_EXPRESSION (-1 to run once)",
        default: Some(DEFAULT_CRON_EXPRESSION),
    },
];

/// Interactive `config` operation: asks for every key and writes `~/.pg_gdrive/.env`.
pub fn run_wizard() -> Result<PathBuf> {
    let env_file = env_file_path()?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let values = prompt_values(&mut stdin.lock(), &mut stdout.lock(), |key| std::env::var(key).ok())?;
    write_env_file(&env_file, &values)?;
    info!(path = %env_file.display(), "Config written");
    Ok(env_file)
}

fn prompt_values(
    input: &mut impl BufRead,
    output: &mut impl Write,
    current: impl Fn(&str) -> Option<String>,
) -> Result<Vec<(&'static str, String)>> {
    let mut values = Vec::with_capacity(WIZARD_FIELDS.len());
    for field in WIZARD_FIELDS {
        let fallback = current(field.key)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| field.default.map(str::to_string));
        loop {
            match &fallback {
                Some(value) if field.key != "ENCRYPTION_SECRET" => write!(output, "{} [{}]: ", field.label, value)?,
                Some(_) => write!(output, "{} [keep current]: ", field.label)?,
                None => write!(output, "{}: ", field.label)?,
            }
            output.flush().context("Failed to flush stdout")?;

            let mut line = String::new();
            if input.read_line(&mut line).context("Failed to read user input")? == 0 {
                bail!("Input ended before {} was entered", field.key);
            }
            // the secret keeps inner and surrounding spaces, only the line ending goes
            let given = if field.key == "ENCRYPTION_SECRET" {
                line.trim_end_matches(['\r', '\n'])
            } else {
                line.trim()
            };
            let answer = match given {
                blank if blank.trim().is_empty() => fallback.clone(),
                given => Some(given.to_string()),
            };
            match answer {
                Some(value) if field_is_valid(field.key, &value) => {
                    values.push((field.key, value));
                    break;
                }
                Some(value) => writeln!(output, "'{}' is not a valid value for {}", value, field.key)?,
                None => writeln!(output, "{} is required", field.key)?,
            }
        }
    }
    Ok(values)
}

fn field_is_valid(key: &str, value: &str) -> bool {
    match key {
        "RUN_ON_START" => parse_bool(value).is_some(),
        "RETENTION" => value.parse::<RetentionUnit>().is_ok(),
        "FILE_PREFIX" => is_valid_file_prefix(value),
        _ => true,
    }
}

fn write_env_file(path: &Path, values: &[(&str, String)]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create config directory {}", dir.display()))?;
    }
    let mut contents = String::new();
    for (key, value) in values {
        contents.push_str(&format!("{}={}\n", key, quote_env_value(value)));
    }
    fs::write(path, contents).with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}

/// Quotes a value so the dotenv parser reads it back unchanged.
fn quote_env_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@*?=+,%".contains(c));
    if plain {
        value.to_string()
    } else if !value.contains('\'') {
        format!("'{}'", value)
    } else {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$");
        format!("\"{}\"", escaped)
    }
}
