use crate::infrastructure::error::InfraError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// Another save on this store was already in progress.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalWrite {
    pub at: Instant,
    pub modified: Option<SystemTime>,
}

/// Whole-document JSON persistence with temp-file-plus-rename writes.
#[derive(Debug)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    saving: AtomicBool,
    last_write: Mutex<Option<LocalWrite>>,
    _document: PhantomData<fn() -> T>,
}

struct SavingGuard<'a>(&'a AtomicBool);

impl<'a> SavingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            saving: AtomicBool::new(false),
            last_write: Mutex::new(None),
            _document: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent or unreadable files yield the empty document. An unparseable
    /// file is copied aside to `<name>.corrupt` before it can be overwritten.
    pub fn load(&self) -> T {
        match self.try_load() {
            Ok(Some(document)) => document,
            Ok(None) => T::default(),
            Err(InfraError::Json(error)) => {
                tracing::warn!(path = %self.path.display(), %error, "local document is corrupt; starting empty");
                if let Err(error) = fs::copy(&self.path, self.corrupt_path()) {
                    tracing::warn!(%error, "failed to preserve corrupt local document");
                }
                T::default()
            }
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "local document unreadable; starting empty");
                T::default()
            }
        }
    }

    pub fn try_load(&self) -> Result<Option<T>, InfraError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, document: &T) -> Result<SaveOutcome, InfraError> {
        let Some(_guard) = SavingGuard::acquire(&self.saving) else {
            tracing::debug!(path = %self.path.display(), "save already in progress; skipping");
            return Ok(SaveOutcome::Skipped);
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let formatted = serde_json::to_string_pretty(document)?;
        let temp_path = self.temp_path();
        let written = write_synced(&temp_path, &formatted)
            .and_then(|_| fs::rename(&temp_path, &self.path));
        if let Err(error) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(error.into());
        }

        let modified = fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok();
        let mut last_write = self
            .last_write
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("local store lock poisoned: {error}")))?;
        *last_write = Some(LocalWrite {
            at: Instant::now(),
            modified,
        });
        Ok(SaveOutcome::Written)
    }

    pub fn last_local_write(&self) -> Option<LocalWrite> {
        self.last_write.lock().ok().and_then(|guard| *guard)
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// True when the file on disk is still the one this store last wrote.
    pub fn is_own_write(&self) -> bool {
        let Some(last_write) = self.last_local_write() else {
            return false;
        };
        let current = fs::metadata(&self.path)
            .and_then(|metadata| metadata.modified())
            .ok();
        last_write.modified.is_some() && current == last_write.modified
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling_path(".tmp")
    }

    fn corrupt_path(&self) -> PathBuf {
        self.sibling_path(".corrupt")
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

fn write_synced(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DATE_FORMAT, Ledger, WorkDay};
    use crate::test_support::TempWorkspace;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn sample_ledger() -> Ledger {
        let mut ledger = Ledger::for_owner("alice");
        ledger.set_day(
            NaiveDate::parse_from_str("2024-05-01", DATE_FORMAT).expect("date"),
            WorkDay::banked(3600.0),
        );
        ledger
    }

    #[test]
    fn missing_file_loads_empty_document() {
        let workspace = TempWorkspace::new("local-store");
        let store = JsonFileStore::<Ledger>::new(workspace.path().join("absent.json"));
        assert_eq!(store.load(), Ledger::default());
        assert!(store.try_load().expect("try load").is_none());
    }

    #[test]
    fn save_then_load_is_a_byte_fixed_point() {
        let workspace = TempWorkspace::new("local-store");
        let path = workspace.path().join("users/alice/work_time.json");
        let store = JsonFileStore::<Ledger>::new(&path);

        assert_eq!(store.save(&sample_ledger()).expect("save"), SaveOutcome::Written);
        let first = fs::read(&path).expect("read first");
        store.save(&store.load()).expect("save again");
        let second = fs::read(&path).expect("read second");

        assert_eq!(first, second);
        assert_eq!(store.load(), sample_ledger());
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn corrupt_file_loads_empty_and_is_preserved() {
        let workspace = TempWorkspace::new("local-store");
        let path = workspace.path().join("work_time.json");
        fs::write(&path, "{ not json").expect("write corrupt");
        let store = JsonFileStore::<Ledger>::new(&path);

        assert_eq!(store.load(), Ledger::default());
        let preserved = fs::read_to_string(store.corrupt_path()).expect("corrupt copy");
        assert_eq!(preserved, "{ not json");
    }

    #[test]
    fn nested_save_is_skipped() {
        let workspace = TempWorkspace::new("local-store");
        let store = JsonFileStore::<Ledger>::new(workspace.path().join("work_time.json"));

        let guard = SavingGuard::acquire(&store.saving).expect("first guard");
        assert!(store.is_saving());
        assert_eq!(store.save(&sample_ledger()).expect("save"), SaveOutcome::Skipped);
        drop(guard);

        assert!(!store.is_saving());
        assert_eq!(store.save(&sample_ledger()).expect("save"), SaveOutcome::Written);
    }

    #[test]
    fn own_write_is_recognised_until_the_file_changes() {
        let workspace = TempWorkspace::new("local-store");
        let path = workspace.path().join("work_time.json");
        let store = JsonFileStore::<Ledger>::new(&path);
        assert!(!store.is_own_write());

        store.save(&sample_ledger()).expect("save");
        assert!(store.is_own_write());
        assert!(store.last_local_write().is_some());

        let previous = store.last_local_write().and_then(|write| write.modified).expect("mtime");
        fs::write(&path, "{}").expect("external write");
        let file = File::options().write(true).open(&path).expect("open");
        file.set_modified(previous + Duration::from_secs(5)).expect("set mtime");

        assert!(!store.is_own_write());
    }
}
