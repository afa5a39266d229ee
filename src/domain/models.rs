use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
const LAST_SYNC_KEY: &str = "last_sync";
const USERNAME_KEY: &str = "username";

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer is already running")]
    AlreadyRunning,
    #[error("timer is not running")]
    NotRunning,
}

/// Banked seconds for one calendar date plus the open interval, if any.
///
/// `start_time` is epoch seconds and is only present while `is_running`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WorkDayRepr")]
pub struct WorkDay {
    pub accumulated_time: f64,
    pub is_running: bool,
    pub start_time: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkDayRepr {
    Legacy(f64),
    Record {
        #[serde(default)]
        accumulated_time: f64,
        #[serde(default)]
        is_running: bool,
        #[serde(default)]
        start_time: Option<f64>,
    },
}

impl From<WorkDayRepr> for WorkDay {
    fn from(repr: WorkDayRepr) -> Self {
        match repr {
            WorkDayRepr::Legacy(seconds) => Self::normalized(seconds, false, None),
            WorkDayRepr::Record {
                accumulated_time,
                is_running,
                start_time,
            } => Self::normalized(accumulated_time, is_running, start_time),
        }
    }
}

impl WorkDay {
    pub fn banked(accumulated_time: f64) -> Self {
        Self::normalized(accumulated_time, false, None)
    }

    pub fn running(accumulated_time: f64, start_time: f64) -> Self {
        Self::normalized(accumulated_time, true, Some(start_time))
    }

    fn normalized(accumulated_time: f64, is_running: bool, start_time: Option<f64>) -> Self {
        let accumulated_time = if accumulated_time.is_finite() {
            accumulated_time.max(0.0)
        } else {
            0.0
        };
        match (is_running, start_time.filter(|value| value.is_finite())) {
            (true, Some(start_time)) => Self {
                accumulated_time,
                is_running: true,
                start_time: Some(start_time),
            },
            _ => Self {
                accumulated_time,
                is_running: false,
                start_time: None,
            },
        }
    }

    fn open_interval_start(&self) -> Option<f64> {
        if self.is_running { self.start_time } else { None }
    }

    /// Elapsed seconds at `now`. A clock that reads earlier than
    /// `start_time` contributes nothing instead of subtracting.
    pub fn effective_seconds(&self, now: f64) -> f64 {
        match self.open_interval_start() {
            Some(start_time) => self.accumulated_time + (now - start_time).max(0.0),
            None => self.accumulated_time,
        }
    }

    pub fn start(&self, now: f64) -> Result<Self, TimerError> {
        if self.is_running {
            return Err(TimerError::AlreadyRunning);
        }
        Ok(Self::running(self.accumulated_time, now))
    }

    pub fn stop(&self, now: f64) -> Result<Self, TimerError> {
        if !self.is_running {
            return Err(TimerError::NotRunning);
        }
        Ok(Self::banked(self.effective_seconds(now)))
    }

    pub fn toggle(&self, now: f64) -> Self {
        match self.stop(now) {
            Ok(stopped) => stopped,
            Err(_) => Self::running(self.accumulated_time, now),
        }
    }

    pub fn reset(&self) -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.accumulated_time.is_finite() || self.accumulated_time < 0.0 {
            return Err("work_day.accumulated_time must be a non-negative number".to_string());
        }
        if self.is_running != self.start_time.is_some() {
            return Err("work_day.start_time must be present iff is_running".to_string());
        }
        Ok(())
    }
}

pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Accepts RFC 3339 and naive ISO-8601 (read as UTC). Anything else is
/// treated as absent, which sorts as the oldest possible stamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub mod timestamp {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
    }
}

/// Per-user mapping of date to [`WorkDay`], persisted as one JSON object.
///
/// The object shares its namespace with two reserved keys, `username` and
/// `last_sync`; any other key that is not a `YYYY-MM-DD` date is ignored on read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    pub username: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub days: BTreeMap<NaiveDate, WorkDay>,
}

impl Ledger {
    pub fn for_owner(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    pub fn from_object(raw: Map<String, Value>) -> Self {
        let mut ledger = Self::default();
        for (key, value) in raw {
            match key.as_str() {
                LAST_SYNC_KEY => ledger.last_sync = value.as_str().and_then(parse_timestamp),
                USERNAME_KEY => ledger.username = value.as_str().map(ToOwned::to_owned),
                _ => {
                    let Ok(date) = NaiveDate::parse_from_str(&key, DATE_FORMAT) else {
                        continue;
                    };
                    match serde_json::from_value::<WorkDay>(value) {
                        Ok(day) => {
                            ledger.days.insert(date, day);
                        }
                        Err(error) => {
                            tracing::warn!(date = %key, %error, "skipping unreadable work day");
                        }
                    }
                }
            }
        }
        ledger
    }

    pub fn day(&self, date: NaiveDate) -> Option<&WorkDay> {
        self.days.get(&date)
    }

    pub fn day_or_default(&self, date: NaiveDate) -> WorkDay {
        self.days.get(&date).copied().unwrap_or_default()
    }

    pub fn set_day(&mut self, date: NaiveDate, day: WorkDay) {
        self.days.insert(date, day);
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Sum of elapsed seconds over `start..=end`. Only `today` may still be
    /// counting; an open interval on any other date contributes its banked
    /// time only.
    pub fn total_between(&self, start: NaiveDate, end: NaiveDate, today: NaiveDate, now: f64) -> f64 {
        self.days
            .range(start..=end)
            .map(|(date, day)| {
                if *date == today {
                    day.effective_seconds(now)
                } else {
                    day.accumulated_time
                }
            })
            .sum()
    }
}

impl Serialize for Ledger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let reserved =
            usize::from(self.username.is_some()) + usize::from(self.last_sync.is_some());
        let mut map = serializer.serialize_map(Some(self.days.len() + reserved))?;
        for (date, day) in &self.days {
            map.serialize_entry(&date.format(DATE_FORMAT).to_string(), day)?;
        }
        if let Some(last_sync) = self.last_sync {
            map.serialize_entry(LAST_SYNC_KEY, &last_sync.to_rfc3339())?;
        }
        if let Some(username) = &self.username {
            map.serialize_entry(USERNAME_KEY, username)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Ledger {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self::from_object(raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    #[serde(default)]
    pub username: String,
    /// Empty for accounts created before passwords were stored.
    #[serde(default, alias = "password")]
    pub password_hash: String,
    #[serde(default, with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub last_sync: Option<DateTime<Utc>>,
}

impl UserAccount {
    pub fn new(
        username: impl Into<String>,
        password_hash: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            created_at: Some(created_at),
            last_login: None,
            last_sync: Some(created_at),
        }
    }

    pub fn has_password(&self) -> bool {
        !self.password_hash.trim().is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.username, "account.username")
    }
}

/// Username-keyed account directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, UserAccount>",
    into = "BTreeMap<String, UserAccount>"
)]
pub struct AccountDirectory {
    accounts: BTreeMap<String, UserAccount>,
}

impl From<BTreeMap<String, UserAccount>> for AccountDirectory {
    fn from(raw: BTreeMap<String, UserAccount>) -> Self {
        let accounts = raw
            .into_iter()
            .map(|(username, mut account)| {
                if account.username.trim().is_empty() {
                    account.username = username.clone();
                }
                (username, account)
            })
            .collect();
        Self { accounts }
    }
}

impl From<AccountDirectory> for BTreeMap<String, UserAccount> {
    fn from(directory: AccountDirectory) -> Self {
        directory.accounts
    }
}

impl FromIterator<UserAccount> for AccountDirectory {
    fn from_iter<I: IntoIterator<Item = UserAccount>>(iter: I) -> Self {
        Self {
            accounts: iter
                .into_iter()
                .map(|account| (account.username.clone(), account))
                .collect(),
        }
    }
}

impl AccountDirectory {
    pub fn get(&self, username: &str) -> Option<&UserAccount> {
        self.accounts.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.accounts.contains_key(username)
    }

    pub fn upsert(&mut self, account: UserAccount) {
        self.accounts.insert(account.username.clone(), account);
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, UserAccount> {
        &self.accounts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Disconnected,
    Connected,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
        }
    }
}

/// Transient connectivity state for one remote target. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSession {
    pub phase: SyncPhase,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Short-lived single-use code bound to an identity, as produced by the
/// out-of-band issuance channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub code: String,
    pub identity: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl OneTimeCode {
    pub fn is_valid(&self, input: &str, now: DateTime<Utc>) -> bool {
        !self.used && now <= self.expires_at && self.code == input.trim()
    }

    pub fn redeem(&mut self, input: &str, now: DateTime<Utc>) -> bool {
        if !self.is_valid(input, now) {
            return false;
        }
        self.used = true;
        true
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
