use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

const APP_JSON: &str = "app.json";
const SUPPORTED_SCHEMA: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfigFile {
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    remote: RemoteSection,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    backup: BackupSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RemoteSection {
    endpoint: Option<String>,
    ledger_collection: String,
    account_collection: String,
    timeout_seconds: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            ledger_collection: "user_data".to_string(),
            account_collection: "users".to_string(),
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SyncSection {
    ledger_interval_minutes: u64,
    account_interval_minutes: u64,
    connection_check_seconds: u64,
    auto_save_seconds: u64,
    watch_debounce_millis: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            ledger_interval_minutes: 10,
            account_interval_minutes: 30,
            connection_check_seconds: 60,
            auto_save_seconds: 60,
            watch_debounce_millis: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackupSection {
    retention: usize,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self { retention: 30 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    /// `None` means no remote is configured for this deployment.
    pub endpoint: Option<Url>,
    pub ledger_collection: String,
    pub account_collection: String,
    pub timeout: Duration,
    /// Bearer token supplied through the environment; wins over the keyring.
    pub token_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub ledger_interval: Duration,
    pub account_interval: Duration,
    pub connection_check: Duration,
    pub auto_save: Duration,
    pub watch_debounce: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `None` follows the local system clock.
    pub timezone: Option<Tz>,
    pub remote: RemoteSettings,
    pub sync: SyncSettings,
    pub backup_retention: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let remote = RemoteSection::default();
        let sync = SyncSection::default();
        Self {
            timezone: None,
            remote: RemoteSettings {
                endpoint: None,
                ledger_collection: remote.ledger_collection,
                account_collection: remote.account_collection,
                timeout: Duration::from_secs(remote.timeout_seconds),
                token_override: None,
            },
            sync: SyncSettings {
                ledger_interval: Duration::from_secs(sync.ledger_interval_minutes * 60),
                account_interval: Duration::from_secs(sync.account_interval_minutes * 60),
                connection_check: Duration::from_secs(sync.connection_check_seconds),
                auto_save: Duration::from_secs(sync.auto_save_seconds),
                watch_debounce: Duration::from_millis(sync.watch_debounce_millis),
            },
            backup_retention: BackupSection::default().retention,
        }
    }
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([(
        APP_JSON,
        serde_json::json!({
            "schema": 1,
            "timezone": null,
            "remote": {
                "endpoint": null,
                "ledgerCollection": "user_data",
                "accountCollection": "users",
                "timeoutSeconds": 5
            },
            "sync": {
                "ledgerIntervalMinutes": 10,
                "accountIntervalMinutes": 30,
                "connectionCheckSeconds": 60,
                "autoSaveSeconds": 60,
                "watchDebounceMillis": 500
            },
            "backup": {
                "retention": 30
            }
        }),
    )])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    fs::create_dir_all(config_dir)?;
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_settings(config_dir: &Path) -> Result<Settings, InfraError> {
    load_settings_with_lookup(config_dir, |key| std::env::var(key).ok())
}

/// Reads `app.json` and applies `WORKTIME_*` overrides from `lookup`.
pub fn load_settings_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<Settings, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let path = config_dir.join(APP_JSON);
    let file: AppConfigFile = serde_json::from_value(read_config(&path)?)
        .map_err(|error| InfraError::InvalidConfig(format!("{}: {error}", path.display())))?;

    let timezone = optional_lookup_value(&lookup, &["WORKTIME_TIMEZONE"])
        .or_else(|| non_empty(file.timezone.as_deref()))
        .map(|name| parse_timezone(&name))
        .transpose()?;
    let endpoint = optional_lookup_value(&lookup, &["WORKTIME_REMOTE_URL"])
        .or_else(|| non_empty(file.remote.endpoint.as_deref()))
        .map(|raw| parse_endpoint(&raw))
        .transpose()?;
    let token_override = optional_lookup_value(&lookup, &["WORKTIME_REMOTE_TOKEN"]);

    let sync = &file.sync;
    let remote = &file.remote;
    Ok(Settings {
        timezone,
        remote: RemoteSettings {
            endpoint,
            ledger_collection: required_name(&remote.ledger_collection, "remote.ledgerCollection")?,
            account_collection: required_name(&remote.account_collection, "remote.accountCollection")?,
            timeout: positive_duration(remote.timeout_seconds, "remote.timeoutSeconds", Duration::from_secs)?,
            token_override,
        },
        sync: SyncSettings {
            ledger_interval: positive_minutes(sync.ledger_interval_minutes, "sync.ledgerIntervalMinutes")?,
            account_interval: positive_minutes(sync.account_interval_minutes, "sync.accountIntervalMinutes")?,
            connection_check: positive_duration(
                sync.connection_check_seconds,
                "sync.connectionCheckSeconds",
                Duration::from_secs,
            )?,
            auto_save: positive_duration(sync.auto_save_seconds, "sync.autoSaveSeconds", Duration::from_secs)?,
            watch_debounce: Duration::from_millis(sync.watch_debounce_millis),
        },
        backup_retention: file.backup.retention.max(1),
    })
}

fn parse_timezone(name: &str) -> Result<Tz, InfraError> {
    name.parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("unknown timezone '{name}': {error}")))
}

fn parse_endpoint(raw: &str) -> Result<Url, InfraError> {
    let url = Url::parse(raw)
        .map_err(|error| InfraError::InvalidConfig(format!("invalid remote endpoint '{raw}': {error}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(InfraError::InvalidConfig(format!(
            "remote endpoint must be http or https: {raw}"
        )));
    }
    Ok(url)
}

fn required_name(value: &str, field_name: &str) -> Result<String, InfraError> {
    non_empty(Some(value))
        .ok_or_else(|| InfraError::InvalidConfig(format!("{field_name} must not be empty")))
}

fn positive_duration(
    value: u64,
    field_name: &str,
    to_duration: impl Fn(u64) -> Duration,
) -> Result<Duration, InfraError> {
    if value == 0 {
        return Err(InfraError::InvalidConfig(format!("{field_name} must be positive")));
    }
    Ok(to_duration(value))
}

fn positive_minutes(value: u64, field_name: &str) -> Result<Duration, InfraError> {
    let seconds = value
        .checked_mul(60)
        .ok_or_else(|| InfraError::InvalidConfig(format!("{field_name} is too large")))?;
    positive_duration(seconds, field_name, Duration::from_secs)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .find_map(|value| non_empty(Some(&value)))
}
