use crate::application::clock::Clock;
use crate::application::sync_engine::{PassReport, SyncTarget};
use crate::domain::merge::{merge_running_day, reconcile_ledger};
use crate::domain::models::{Ledger, WorkDay, epoch_seconds};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_store::{JsonFileStore, SaveOutcome};
use crate::infrastructure::remote_store::RemoteStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const LEDGER_FILE: &str = "work_time.json";

pub fn ledger_path(data_dir: &Path, owner: &str) -> PathBuf {
    data_dir.join("users").join(owner).join(LEDGER_FILE)
}

#[derive(Debug)]
struct LedgerState {
    ledger: Ledger,
    today: NaiveDate,
}

/// The in-memory ledger of the logged-in user and its file. The live timer,
/// the watcher and the sync engine all go through this one owner.
#[derive(Debug)]
pub struct LedgerSession {
    owner: String,
    store: JsonFileStore<Ledger>,
    state: Mutex<LedgerState>,
    clock: Clock,
}

impl LedgerSession {
    pub fn open(owner: impl Into<String>, path: impl AsRef<Path>, clock: Clock) -> Result<Self, InfraError> {
        let owner = owner.into();
        let store: JsonFileStore<Ledger> = JsonFileStore::new(path);
        let mut ledger = store.load();
        if ledger.username.is_none() {
            ledger.username = Some(owner.clone());
        }
        let today = clock.today();
        let sealed = seal_stale_days(&mut ledger, today, &clock);
        if sealed > 0 {
            tracing::info!(owner = %owner, sealed, "stopped timers left running on past dates");
        }

        let session = Self {
            owner,
            store,
            state: Mutex::new(LedgerState { ledger, today }),
            clock,
        };
        if sealed > 0 {
            session.save()?;
        }
        Ok(session)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn today(&self) -> Result<NaiveDate, InfraError> {
        Ok(self.lock_state()?.today)
    }

    pub fn snapshot(&self) -> Result<Ledger, InfraError> {
        Ok(self.lock_state()?.ledger.clone())
    }

    /// The ledger together with the date it treats as today, read atomically
    /// so a rollover cannot land between the two.
    pub fn snapshot_with_today(&self) -> Result<(Ledger, NaiveDate), InfraError> {
        let state = self.lock_state()?;
        Ok((state.ledger.clone(), state.today))
    }

    pub fn today_record(&self) -> Result<WorkDay, InfraError> {
        let state = self.lock_state()?;
        Ok(state.ledger.day_or_default(state.today))
    }

    pub fn is_running(&self) -> Result<bool, InfraError> {
        Ok(self.today_record()?.is_running)
    }

    pub fn elapsed_today(&self) -> Result<f64, InfraError> {
        Ok(self.today_record()?.effective_seconds(self.clock.epoch_seconds()))
    }

    pub fn toggle(&self) -> Result<WorkDay, InfraError> {
        self.mutate_today(|day, now| Ok(day.toggle(now)))
    }

    pub fn start(&self) -> Result<WorkDay, InfraError> {
        self.mutate_today(|day, now| Ok(day.start(now)?))
    }

    pub fn stop(&self) -> Result<WorkDay, InfraError> {
        self.mutate_today(|day, now| Ok(day.stop(now)?))
    }

    /// Clears today's record. Callers confirm with the user first.
    pub fn reset(&self) -> Result<WorkDay, InfraError> {
        self.mutate_today(|day, _| Ok(day.reset()))
    }

    pub fn period_total(&self, start: NaiveDate, end: NaiveDate) -> Result<f64, InfraError> {
        let state = self.lock_state()?;
        Ok(state
            .ledger
            .total_between(start, end, state.today, self.clock.epoch_seconds()))
    }

    /// Writes the document out whole. `last_sync` is left alone; only a
    /// completed upload or an adopted remote document moves it.
    pub fn save(&self) -> Result<SaveOutcome, InfraError> {
        let mut state = self.lock_state()?;
        self.save_locked(&mut state)
    }

    pub fn is_own_write(&self) -> bool {
        self.store.is_own_write()
    }

    /// Seals the previous date once the local calendar date changes. A timer
    /// still running carries over into the new day without losing time.
    pub fn roll_over_if_needed(&self) -> Result<bool, InfraError> {
        let now = self.clock.now();
        let today = self.clock.date_of(now);
        let mut state = self.lock_state()?;
        if today <= state.today {
            return Ok(false);
        }

        let previous = state.today;
        let record = state.ledger.day_or_default(previous);
        if record.is_running {
            let sealed_at = boundary_after(previous, now, &self.clock);
            let resumed_at = self.clock.start_of_day(today).unwrap_or(now).min(now);
            state.ledger.set_day(previous, record.stop(epoch_seconds(sealed_at))?);
            let today_record = state.ledger.day_or_default(today);
            if !today_record.is_running {
                state.ledger.set_day(today, today_record.start(epoch_seconds(resumed_at))?);
            }
        }
        state.today = today;
        tracing::info!(from = %previous, to = %today, carried = record.is_running, "day rolled over");
        self.save_locked(&mut state)?;
        Ok(true)
    }

    /// Local-only merge with whatever another process wrote to our file.
    /// Today is merged monotonically, so in-memory progress never shrinks.
    pub fn apply_external(&self) -> Result<bool, InfraError> {
        let Some(on_disk) = self.store.try_load()? else {
            return Ok(false);
        };
        let mut state = self.lock_state()?;
        let now = self.clock.epoch_seconds();
        let result = reconcile_ledger(&state.ledger, &on_disk, state.today, now, false);
        let changed = result.local_changed();
        let write_back = result.remote_changed();
        if changed {
            tracing::info!(days = result.days.pulled.len(), "merged external changes to the ledger file");
            state.ledger.days = result.merged.days;
            state.ledger.last_sync = result.merged.last_sync;
        }
        if write_back {
            self.save_locked(&mut state)?;
        }
        Ok(changed)
    }

    /// Applies the `pulled` dates of a merge computed from the snapshot taken
    /// on `pass_today`. Dates the pass did not pull keep whatever memory holds
    /// now. Today is merged again against memory, since the timer kept
    /// running meanwhile. If the day rolled over during the pass, the old
    /// today was sealed locally and is left for the next pass.
    pub fn adopt(&self, merged: &Ledger, pulled: &[NaiveDate], pass_today: NaiveDate) -> Result<(), InfraError> {
        let mut state = self.lock_state()?;
        let now = self.clock.epoch_seconds();
        let today = state.today;

        for date in pulled {
            let Some(incoming) = merged.day(*date) else {
                continue;
            };
            if *date == today {
                let current = state.ledger.day_or_default(today);
                state.ledger.set_day(today, merge_running_day(&current, incoming, now).value);
            } else if *date == pass_today {
                continue;
            } else {
                state.ledger.set_day(*date, *incoming);
            }
        }
        state.ledger.last_sync = state.ledger.last_sync.max(merged.last_sync);
        self.save_locked(&mut state)?;
        Ok(())
    }

    /// Records a completed upload of the document stamped `at`.
    pub fn mark_synced(&self, at: DateTime<Utc>) -> Result<(), InfraError> {
        let mut state = self.lock_state()?;
        state.ledger.last_sync = state.ledger.last_sync.max(Some(at));
        self.save_locked(&mut state)?;
        Ok(())
    }

    fn mutate_today<F>(&self, mutate: F) -> Result<WorkDay, InfraError>
    where
        F: FnOnce(&WorkDay, f64) -> Result<WorkDay, InfraError>,
    {
        let mut state = self.lock_state()?;
        let today = state.today;
        let updated = mutate(&state.ledger.day_or_default(today), self.clock.epoch_seconds())?;
        state.ledger.set_day(today, updated);
        self.save_locked(&mut state)?;
        Ok(updated)
    }

    fn save_locked(&self, state: &mut LedgerState) -> Result<SaveOutcome, InfraError> {
        self.store.save(&state.ledger)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, LedgerState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("ledger lock poisoned: {error}")))
    }
}

fn boundary_after(date: NaiveDate, now: DateTime<Utc>, clock: &Clock) -> DateTime<Utc> {
    date.succ_opt()
        .and_then(|next| clock.start_of_day(next))
        .unwrap_or(now)
        .min(now)
}

fn seal_stale_days(ledger: &mut Ledger, today: NaiveDate, clock: &Clock) -> usize {
    let now = clock.now();
    let stale: Vec<(NaiveDate, WorkDay)> = ledger
        .days
        .range(..today)
        .filter(|(_, day)| day.is_running)
        .map(|(date, day)| (*date, *day))
        .collect();
    for (date, day) in &stale {
        let sealed_at = epoch_seconds(boundary_after(*date, now, clock));
        ledger.set_day(*date, day.toggle(sealed_at));
    }
    stale.len()
}

/// The ledger as a sync target: one remote document keyed by the owner.
#[derive(Debug, Clone)]
pub struct LedgerSync {
    session: Arc<LedgerSession>,
}

impl LedgerSync {
    pub fn new(session: Arc<LedgerSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<LedgerSession> {
        &self.session
    }

    /// Puts the current ledger stamped with the upload time, then records
    /// that stamp locally once the remote accepted it.
    async fn upload(&self, remote: &dyn RemoteStore<Ledger>) -> Result<(), InfraError> {
        let owner = self.session.owner();
        let stamp = self.session.clock().now();
        let mut outgoing = self.session.snapshot()?;
        outgoing.username = Some(owner.to_string());
        outgoing.last_sync = outgoing.last_sync.max(Some(stamp));
        remote.put(owner, &outgoing).await?;
        self.session.mark_synced(stamp)
    }
}

#[async_trait]
impl SyncTarget for LedgerSync {
    type Document = Ledger;

    fn label(&self) -> &'static str {
        "ledger"
    }

    async fn reconcile(&self, remote: &dyn RemoteStore<Ledger>, force: bool) -> Result<PassReport, InfraError> {
        let owner = self.session.owner();
        let remote_ledger = remote.get(owner).await?;
        let remote_missing = remote_ledger.is_none();
        let remote_ledger = remote_ledger.unwrap_or_default();

        let (local, today) = self.session.snapshot_with_today()?;
        let now = self.session.clock().epoch_seconds();
        let result = reconcile_ledger(&local, &remote_ledger, today, now, force);

        if result.local_changed() {
            self.session.adopt(&result.merged, &result.days.pulled, today)?;
        }
        if result.remote_changed() || (remote_missing && !local.is_empty()) {
            self.upload(remote).await?;
        }

        Ok(PassReport {
            pulled: result.days.pulled.len(),
            pushed: result.days.pushed.len(),
            conflicts: result.days.conflicts,
        })
    }

    async fn push_local(&self, remote: &dyn RemoteStore<Ledger>) -> Result<(), InfraError> {
        self.upload(remote).await
    }
}
