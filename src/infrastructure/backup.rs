use crate::infrastructure::error::InfraError;
use chrono::{DateTime, TimeZone};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const BACKUP_PREFIX: &str = "work_time_";
const BACKUP_SUFFIX: &str = ".json";

/// Copies `source` into `backups_dir` under a timestamped name and prunes all
/// but the newest `retention` copies. Returns `None` when there is nothing to
/// back up yet.
pub fn create_backup<Tz: TimeZone>(
    source: &Path,
    backups_dir: &Path,
    at: &DateTime<Tz>,
    retention: usize,
) -> Result<Option<PathBuf>, InfraError>
where
    Tz::Offset: std::fmt::Display,
{
    if !source.exists() {
        return Ok(None);
    }
    fs::create_dir_all(backups_dir)?;
    let name = format!("{BACKUP_PREFIX}{}{BACKUP_SUFFIX}", at.format("%Y%m%d_%H%M%S"));
    let target = backups_dir.join(name);
    fs::copy(source, &target)?;

    let removed = prune_backups(backups_dir, retention)?;
    tracing::info!(backup = %target.display(), removed, "ledger backup written");
    Ok(Some(target))
}

pub fn list_backups(backups_dir: &Path) -> Result<Vec<PathBuf>, InfraError> {
    let entries = match fs::read_dir(backups_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };
    let mut backups = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_backup = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX));
        if is_backup && path.is_file() {
            backups.push(path);
        }
    }
    // Timestamped names sort chronologically.
    backups.sort();
    Ok(backups)
}

fn prune_backups(backups_dir: &Path, retention: usize) -> Result<usize, InfraError> {
    let backups = list_backups(backups_dir)?;
    let excess = backups.len().saturating_sub(retention.max(1));
    for path in &backups[..excess] {
        fs::remove_file(path)?;
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TempWorkspace;
    use chrono::{Duration, Utc};

    #[test]
    fn missing_source_is_not_backed_up() {
        let workspace = TempWorkspace::new("backup");
        let result = create_backup(
            &workspace.path().join("absent.json"),
            &workspace.path().join("backups"),
            &Utc::now(),
            3,
        )
        .expect("backup");
        assert!(result.is_none());
    }

    #[test]
    fn keeps_only_the_newest_copies() {
        let workspace = TempWorkspace::new("backup");
        let source = workspace.path().join("work_time.json");
        let backups_dir = workspace.path().join("backups");
        fs::write(&source, "{}\n").expect("write source");
        fs::create_dir_all(&backups_dir).expect("backups dir");
        fs::write(backups_dir.join("notes.txt"), "keep me").expect("unrelated file");

        let start = DateTime::parse_from_rfc3339("2024-05-01T09:00:00Z")
            .expect("time")
            .with_timezone(&Utc);
        for offset in 0..5 {
            create_backup(&source, &backups_dir, &(start + Duration::minutes(offset)), 3)
                .expect("backup");
        }

        let names: Vec<String> = list_backups(&backups_dir)
            .expect("list")
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(ToOwned::to_owned))
            .collect();
        assert_eq!(
            names,
            vec![
                "work_time_20240501_090200.json",
                "work_time_20240501_090300.json",
                "work_time_20240501_090400.json",
            ]
        );
        assert!(backups_dir.join("notes.txt").exists());
    }
}
