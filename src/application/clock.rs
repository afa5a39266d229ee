use crate::domain::models::epoch_seconds;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::sync::Arc;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock plus the zone that decides which calendar date is "today".
#[derive(Clone)]
pub struct Clock {
    now_provider: NowProvider,
    timezone: Option<Tz>,
}

impl Clock {
    pub fn system(timezone: Option<Tz>) -> Self {
        Self {
            now_provider: Arc::new(Utc::now),
            timezone,
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    pub fn epoch_seconds(&self) -> f64 {
        epoch_seconds(self.now())
    }

    /// Wall time in this clock's zone, for file names and display.
    pub fn local_now(&self) -> DateTime<FixedOffset> {
        let now = self.now();
        match self.timezone {
            Some(timezone) => now.with_timezone(&timezone).fixed_offset(),
            None => now.with_timezone(&Local).fixed_offset(),
        }
    }

    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        match self.timezone {
            Some(timezone) => at.with_timezone(&timezone).date_naive(),
            None => at.with_timezone(&Local).date_naive(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.date_of(self.now())
    }

    /// First instant of `date` in this clock's zone, or `None` if the zone
    /// skips local midnight on that date.
    pub fn start_of_day(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        match self.timezone {
            Some(timezone) => midnight
                .and_local_timezone(timezone)
                .earliest()
                .map(|at| at.with_timezone(&Utc)),
            None => midnight
                .and_local_timezone(Local)
                .earliest()
                .map(|at| at.with_timezone(&Utc)),
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Clock")
            .field("timezone", &self.timezone)
            .finish_non_exhaustive()
    }
}
