//! Pure reconciliation of a local and a remote replica.
//!
//! Two policies exist. The live "today" record is merged monotonically: the
//! side showing more elapsed time wins, so banked time is never lost to a
//! lagging clock. Everything else (sealed history, accounts) is resolved by
//! last-write-wins on a `last_sync` stamp, where an absent stamp is older than
//! any present one and ties keep the local side.

use crate::domain::models::{AccountDirectory, Ledger, UserAccount, WorkDay};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub winner: Side,
}

impl<T: Clone> Resolved<T> {
    fn local(value: &T) -> Self {
        Self {
            value: value.clone(),
            winner: Side::Local,
        }
    }

    fn remote(value: &T) -> Self {
        Self {
            value: value.clone(),
            winner: Side::Remote,
        }
    }
}

/// Monotonic merge for the record the live timer is advancing. The remote
/// open interval is projected to the same local `now` as the local one.
pub fn merge_running_day(local: &WorkDay, remote: &WorkDay, now: f64) -> Resolved<WorkDay> {
    if remote.effective_seconds(now) > local.effective_seconds(now) {
        Resolved::remote(remote)
    } else {
        Resolved::local(local)
    }
}

/// Last-write-wins. `force` makes the local side authoritative regardless of
/// stamps.
pub fn merge_last_write<T: Clone>(
    local: &T,
    local_stamp: Option<DateTime<Utc>>,
    remote: &T,
    remote_stamp: Option<DateTime<Utc>>,
    force: bool,
) -> Resolved<T> {
    // None orders before every Some, so a missing stamp never wins.
    if !force && remote_stamp > local_stamp {
        Resolved::remote(remote)
    } else {
        Resolved::local(local)
    }
}

/// Outcome of merging two keyed collections.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<K, V> {
    pub merged: BTreeMap<K, V>,
    /// Keys whose local value must change.
    pub pulled: Vec<K>,
    /// Keys whose remote value must change.
    pub pushed: Vec<K>,
    /// Keys present on both sides with different values.
    pub conflicts: usize,
}

impl<K, V> Reconciliation<K, V> {
    pub fn is_noop(&self) -> bool {
        self.pulled.is_empty() && self.pushed.is_empty()
    }
}

pub fn reconcile_keyed<K, V, F>(
    local: &BTreeMap<K, V>,
    remote: &BTreeMap<K, V>,
    mut resolve: F,
) -> Reconciliation<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
    F: FnMut(&K, &V, &V) -> Resolved<V>,
{
    let mut merged = BTreeMap::new();
    let mut pulled = Vec::new();
    let mut pushed = Vec::new();
    let mut conflicts = 0;

    for (key, local_value) in local {
        match remote.get(key) {
            None => {
                merged.insert(key.clone(), local_value.clone());
                pushed.push(key.clone());
            }
            Some(remote_value) if remote_value == local_value => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(remote_value) => {
                conflicts += 1;
                let resolved = resolve(key, local_value, remote_value);
                if resolved.value != *local_value {
                    pulled.push(key.clone());
                }
                if resolved.value != *remote_value {
                    pushed.push(key.clone());
                }
                merged.insert(key.clone(), resolved.value);
            }
        }
    }

    for (key, remote_value) in remote {
        if !local.contains_key(key) {
            merged.insert(key.clone(), remote_value.clone());
            pulled.push(key.clone());
        }
    }

    Reconciliation {
        merged,
        pulled,
        pushed,
        conflicts,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerReconciliation {
    pub merged: Ledger,
    pub days: Reconciliation<NaiveDate, WorkDay>,
}

impl LedgerReconciliation {
    pub fn local_changed(&self) -> bool {
        !self.days.pulled.is_empty()
    }

    pub fn remote_changed(&self) -> bool {
        !self.days.pushed.is_empty()
    }
}

/// Merges two ledgers: `today` monotonically, every other date by the
/// document-level `last_sync` stamps.
pub fn reconcile_ledger(
    local: &Ledger,
    remote: &Ledger,
    today: NaiveDate,
    now: f64,
    force: bool,
) -> LedgerReconciliation {
    let days = reconcile_keyed(&local.days, &remote.days, |date, local_day, remote_day| {
        if *date == today {
            merge_running_day(local_day, remote_day, now)
        } else {
            merge_last_write(local_day, local.last_sync, remote_day, remote.last_sync, force)
        }
    });

    let merged = Ledger {
        username: local.username.clone().or_else(|| remote.username.clone()),
        last_sync: local.last_sync.max(remote.last_sync),
        days: days.merged.clone(),
    };
    LedgerReconciliation { merged, days }
}

pub fn reconcile_accounts(
    local: &AccountDirectory,
    remote: &AccountDirectory,
    force: bool,
) -> Reconciliation<String, UserAccount> {
    reconcile_keyed(local.as_map(), remote.as_map(), |_, local_account, remote_account| {
        merge_last_write(
            local_account,
            local_account.last_sync,
            remote_account,
            remote_account.last_sync,
            force,
        )
    })
}
