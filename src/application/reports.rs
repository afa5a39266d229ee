use crate::domain::models::{DATE_FORMAT, Ledger};
use crate::infrastructure::error::InfraError;
use chrono::NaiveDate;
use serde::Serialize;
use std::path::Path;

const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total_seconds: f64,
    pub days_worked: usize,
}

/// One exported row. Hours are banked time only, rounded to two places.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub date: String,
    pub hours: String,
    pub target_met: bool,
}

pub fn summarize_period(
    ledger: &Ledger,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
    now: f64,
) -> Result<PeriodSummary, InfraError> {
    if start > end {
        return Err(InfraError::InvalidState(format!(
            "period start {start} is after end {end}"
        )));
    }
    let days_worked = ledger
        .days
        .range(start..=end)
        .filter(|(date, day)| {
            let seconds = if **date == today {
                day.effective_seconds(now)
            } else {
                day.accumulated_time
            };
            seconds > 0.0
        })
        .count();
    Ok(PeriodSummary {
        start,
        end,
        total_seconds: ledger.total_between(start, end, today, now),
        days_worked,
    })
}

/// `"3h 07m"` style rendering; fractions of a minute are dropped.
pub fn format_duration(seconds: f64) -> String {
    let total_minutes = if seconds.is_finite() && seconds > 0.0 {
        (seconds / 60.0).floor() as u64
    } else {
        0
    };
    format!("{}h {:02}m", total_minutes / 60, total_minutes % 60)
}

pub fn export_rows(ledger: &Ledger, target_hours: f64) -> Vec<ExportRow> {
    ledger
        .days
        .iter()
        .map(|(date, day)| {
            let hours = day.accumulated_time / SECONDS_PER_HOUR;
            ExportRow {
                date: date.format(DATE_FORMAT).to_string(),
                hours: format!("{hours:.2}"),
                target_met: hours >= target_hours,
            }
        })
        .collect()
}

pub fn export_csv(ledger: &Ledger, target_hours: f64, path: &Path) -> Result<usize, InfraError> {
    let rows = export_rows(ledger, target_hours);
    let mut writer = csv::Writer::from_path(path)
        .map_err(|error| InfraError::Io(std::io::Error::other(format!("CSV open error: {error}"))))?;
    for row in &rows {
        writer
            .serialize(row)
            .map_err(|error| InfraError::Io(std::io::Error::other(format!("CSV write error: {error}"))))?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = rows.len(), "ledger exported");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::WorkDay;
    use crate::test_support::TempWorkspace;
    use std::fs;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, DATE_FORMAT).expect("valid date")
    }

    fn sample() -> Ledger {
        let mut ledger = Ledger::for_owner("alice");
        ledger.set_day(date("2024-04-30"), WorkDay::banked(1800.0));
        ledger.set_day(date("2024-05-01"), WorkDay::banked(3600.0 * 8.5));
        ledger.set_day(date("2024-05-02"), WorkDay::running(0.0, 1_000.0));
        ledger
    }

    #[test]
    fn period_summary_counts_only_todays_open_interval() {
        let summary =
            summarize_period(&sample(), date("2024-05-01"), date("2024-05-02"), date("2024-05-02"), 1_600.0)
                .expect("summary");
        assert_eq!(summary.total_seconds, 3600.0 * 8.5 + 600.0);
        assert_eq!(summary.days_worked, 2);

        assert!(summarize_period(&sample(), date("2024-05-02"), date("2024-05-01"), date("2024-05-02"), 0.0).is_err());
    }

    #[test]
    fn durations_render_hours_and_minutes() {
        assert_eq!(format_duration(0.0), "0h 00m");
        assert_eq!(format_duration(3600.0 * 3.0 + 7.0 * 60.0 + 59.0), "3h 07m");
        assert_eq!(format_duration(-5.0), "0h 00m");
        assert_eq!(format_duration(f64::NAN), "0h 00m");
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let workspace = TempWorkspace::new("reports");
        let path = workspace.path().join("export.csv");

        let written = export_csv(&sample(), 1.0, &path).expect("export");
        assert_eq!(written, 3);
        let contents = fs::read_to_string(&path).expect("read export");
        assert_eq!(
            contents,
            "date,hours,target_met\n2024-04-30,0.50,false\n2024-05-01,8.50,true\n2024-05-02,0.00,false\n"
        );
    }
}
