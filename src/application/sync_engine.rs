//! One engine per replicated store. It owns the connectivity state machine
//! and serializes reconciliation passes; the store-specific merge lives in a
//! [`SyncTarget`].

use crate::application::clock::Clock;
use crate::domain::models::{SyncPhase, SyncSession};
use crate::infrastructure::error::{InfraError, RemoteError, RemoteErrorKind};
use crate::infrastructure::remote_store::{RemoteStore, RemoteTarget};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Keys written to the local file.
    pub pulled: usize,
    /// Keys written to the remote store.
    pub pushed: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(PassReport),
    NoConnection,
    /// A pass was already running; it will run once more when it finishes.
    Coalesced,
    Failed(String),
}

impl SyncOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Completed(report) => format!(
                "sync completed: {} pulled, {} pushed, {} conflicts resolved",
                report.pulled, report.pushed, report.conflicts
            ),
            Self::NoConnection => "no connection to the remote store".to_string(),
            Self::Coalesced => "sync already in progress; queued one more pass".to_string(),
            Self::Failed(message) => format!("sync failed: {message}"),
        }
    }
}

/// A local replica that can be reconciled against a remote store.
///
/// Implementations write the local side before the remote side within one
/// pass and never hold in-memory locks across remote calls.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    type Document: Send + Sync + 'static;

    fn label(&self) -> &'static str;

    async fn reconcile(
        &self,
        remote: &dyn RemoteStore<Self::Document>,
        force: bool,
    ) -> Result<PassReport, InfraError>;

    /// Best-effort upload of the current local state after a save.
    async fn push_local(&self, remote: &dyn RemoteStore<Self::Document>) -> Result<(), InfraError>;
}

pub struct SyncEngine<T: SyncTarget> {
    target: T,
    remote: RemoteTarget<T::Document>,
    clock: Clock,
    session: Mutex<SyncSession>,
    pass_lock: tokio::sync::Mutex<()>,
    rerun_requested: AtomicBool,
    rerun_force: AtomicBool,
}

impl<T: SyncTarget> SyncEngine<T> {
    pub fn new(target: T, remote: RemoteTarget<T::Document>, timeout: Duration, clock: Clock) -> Self {
        Self {
            target,
            remote: remote.with_timeout(timeout),
            clock,
            session: Mutex::new(SyncSession::default()),
            pass_lock: tokio::sync::Mutex::new(()),
            rerun_requested: AtomicBool::new(false),
            rerun_force: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn is_configured(&self) -> bool {
        self.remote.is_configured()
    }

    pub fn session(&self) -> SyncSession {
        self.session
            .lock()
            .map(|session| session.clone())
            .unwrap_or_default()
    }

    pub fn phase(&self) -> SyncPhase {
        self.session().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == SyncPhase::Connected
    }

    /// Probes the remote and records the result. Unconfigured targets stay
    /// disconnected without any I/O.
    pub async fn check_connection(&self) -> SyncPhase {
        let RemoteTarget::Configured(store) = &self.remote else {
            self.set_phase(SyncPhase::Disconnected);
            return SyncPhase::Disconnected;
        };
        match store.health().await {
            Ok(()) => self.set_phase(SyncPhase::Connected),
            Err(error) => {
                self.mark_disconnected(&error);
                SyncPhase::Disconnected
            }
        }
    }

    /// Connects and, if that works, runs the initial full pass.
    pub async fn start(&self) -> SyncOutcome {
        if self.check_connection().await == SyncPhase::Disconnected {
            tracing::info!(store = self.target.label(), "starting offline");
            return SyncOutcome::NoConnection;
        }
        self.sync_now(false).await
    }

    /// Periodic trigger.
    pub async fn tick(&self) -> SyncOutcome {
        self.sync_now(false).await
    }

    /// Runs a pass now, reconnecting first if needed. With `force`, the local
    /// side wins every timestamp comparison.
    pub async fn sync_now(&self, force: bool) -> SyncOutcome {
        let mut force = force;
        loop {
            let guard = match self.pass_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.request_rerun(force);
                    // The running pass may have finished before it saw the request.
                    match self.pass_lock.try_lock() {
                        Ok(guard) => {
                            self.rerun_requested.store(false, Ordering::Release);
                            force |= self.rerun_force.swap(false, Ordering::AcqRel);
                            guard
                        }
                        Err(_) => return SyncOutcome::Coalesced,
                    }
                }
            };

            let outcome = self.run_pass(force).await;
            drop(guard);

            if !self.rerun_requested.swap(false, Ordering::AcqRel) {
                return outcome;
            }
            force = self.rerun_force.swap(false, Ordering::AcqRel);
            tracing::debug!(store = self.target.label(), "running coalesced sync pass");
        }
    }

    /// Called after every local save. Only uploads while connected; a failure
    /// flips the session to disconnected and is otherwise silent.
    pub async fn push_after_save(&self) {
        let RemoteTarget::Configured(store) = &self.remote else {
            return;
        };
        if !self.is_connected() {
            return;
        }
        {
            let Ok(_guard) = self.pass_lock.try_lock() else {
                self.request_rerun(false);
                return;
            };
            match self.target.push_local(store.as_ref()).await {
                Ok(()) => tracing::debug!(store = self.target.label(), "pushed local save"),
                Err(InfraError::Remote(error)) => self.mark_disconnected(&error),
                Err(error) => {
                    tracing::warn!(store = self.target.label(), %error, "failed to push local save")
                }
            }
        }

        // Triggers that arrived during the upload were answered with Coalesced.
        if self.rerun_requested.swap(false, Ordering::AcqRel) {
            let force = self.rerun_force.swap(false, Ordering::AcqRel);
            tracing::debug!(store = self.target.label(), "running sync pass queued during push");
            self.sync_now(force).await;
        }
    }

    async fn run_pass(&self, force: bool) -> SyncOutcome {
        let RemoteTarget::Configured(store) = &self.remote else {
            return SyncOutcome::NoConnection;
        };
        if !self.is_connected() && self.check_connection().await == SyncPhase::Disconnected {
            return SyncOutcome::NoConnection;
        }

        match self.target.reconcile(store.as_ref(), force).await {
            Ok(report) => {
                if report.conflicts > 0 {
                    tracing::debug!(
                        store = self.target.label(),
                        conflicts = report.conflicts,
                        "merge conflicts resolved"
                    );
                }
                tracing::info!(
                    store = self.target.label(),
                    pulled = report.pulled,
                    pushed = report.pushed,
                    force,
                    "reconciliation pass completed"
                );
                SyncOutcome::Completed(report)
            }
            Err(InfraError::Remote(error)) => {
                self.mark_disconnected(&error);
                match error.kind() {
                    RemoteErrorKind::Unreachable => SyncOutcome::NoConnection,
                    _ => SyncOutcome::Failed(error.to_string()),
                }
            }
            Err(error) => {
                tracing::error!(store = self.target.label(), %error, "reconciliation pass failed");
                SyncOutcome::Failed(error.to_string())
            }
        }
    }

    fn request_rerun(&self, force: bool) {
        if force {
            self.rerun_force.store(true, Ordering::Release);
        }
        self.rerun_requested.store(true, Ordering::Release);
    }

    fn mark_disconnected(&self, error: &RemoteError) {
        tracing::warn!(store = self.target.label(), %error, "remote call failed");
        self.set_phase(SyncPhase::Disconnected);
    }

    fn set_phase(&self, phase: SyncPhase) -> SyncPhase {
        let now = self.clock.now();
        let Ok(mut session) = self.session.lock() else {
            return phase;
        };
        if session.phase != phase {
            tracing::info!(store = self.target.label(), phase = phase.as_str(), "connection state changed");
        }
        session.phase = phase;
        session.last_checked = Some(now);
        phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::clock::testing::ManualClock;
    use crate::infrastructure::remote_store::InMemoryRemoteStore;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Counts passes and can be held open mid-pass.
    #[derive(Default)]
    struct CountingTarget {
        passes: AtomicUsize,
        forced_passes: AtomicUsize,
        pushes: AtomicUsize,
        hold: Option<Arc<Notify>>,
        push_hold: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl SyncTarget for CountingTarget {
        type Document = u32;

        fn label(&self) -> &'static str {
            "counter"
        }

        async fn reconcile(&self, remote: &dyn RemoteStore<u32>, force: bool) -> Result<PassReport, InfraError> {
            self.entered.notify_one();
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            remote.get("counter").await?;
            self.passes.fetch_add(1, Ordering::SeqCst);
            if force {
                self.forced_passes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(PassReport::default())
        }

        async fn push_local(&self, remote: &dyn RemoteStore<u32>) -> Result<(), InfraError> {
            self.entered.notify_one();
            if let Some(hold) = &self.push_hold {
                hold.notified().await;
            }
            remote.put("counter", &1).await?;
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(target: CountingTarget, store: &Arc<InMemoryRemoteStore<u32>>) -> SyncEngine<CountingTarget> {
        SyncEngine::new(
            target,
            RemoteTarget::configured(store.clone()),
            Duration::from_secs(1),
            ManualClock::starting_at("2024-05-01T09:00:00Z").clock(),
        )
    }

    #[tokio::test]
    async fn unconfigured_remote_stays_disconnected() {
        let engine = SyncEngine::new(
            CountingTarget::default(),
            RemoteTarget::Unconfigured,
            Duration::from_secs(1),
            ManualClock::starting_at("2024-05-01T09:00:00Z").clock(),
        );
        assert_eq!(engine.start().await, SyncOutcome::NoConnection);
        assert_eq!(engine.sync_now(true).await, SyncOutcome::NoConnection);
        assert_eq!(engine.phase(), SyncPhase::Disconnected);
        assert!(!engine.is_configured());
    }

    #[tokio::test]
    async fn start_connects_and_runs_initial_pass() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let engine = engine(CountingTarget::default(), &store);

        assert!(matches!(engine.start().await, SyncOutcome::Completed(_)));
        assert_eq!(engine.phase(), SyncPhase::Connected);
        assert!(engine.session().last_checked.is_some());
        assert_eq!(engine.target().passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_during_pass_disconnects_without_escaping() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let engine = engine(CountingTarget::default(), &store);
        engine.check_connection().await;
        assert!(engine.is_connected());

        store.fail_next(RemoteError::Unreachable("dns".to_string()));
        assert_eq!(engine.tick().await, SyncOutcome::NoConnection);
        assert_eq!(engine.phase(), SyncPhase::Disconnected);
        assert_eq!(engine.target().passes.load(Ordering::SeqCst), 0);

        // Next trigger reconnects opportunistically.
        assert!(matches!(engine.tick().await, SyncOutcome::Completed(_)));
        assert!(engine.is_connected());
    }

    #[tokio::test]
    async fn unauthorized_is_reported_as_failure() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let engine = engine(CountingTarget::default(), &store);
        engine.check_connection().await;

        store.fail_next(RemoteError::Unauthorized("expired token".to_string()));
        match engine.sync_now(false).await {
            SyncOutcome::Failed(message) => assert!(message.contains("expired token")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(engine.phase(), SyncPhase::Disconnected);
    }

    #[tokio::test]
    async fn push_after_save_only_when_connected() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let engine = engine(CountingTarget::default(), &store);

        engine.push_after_save().await;
        assert_eq!(store.put_calls(), 0);

        engine.check_connection().await;
        engine.push_after_save().await;
        assert_eq!(engine.target().pushes.load(Ordering::SeqCst), 1);

        store.set_offline(true);
        engine.push_after_save().await;
        assert_eq!(engine.phase(), SyncPhase::Disconnected);
    }

    #[tokio::test]
    async fn manual_sync_mid_pass_is_coalesced_into_one_rerun() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let hold = Arc::new(Notify::new());
        let target = CountingTarget {
            hold: Some(Arc::clone(&hold)),
            ..CountingTarget::default()
        };
        let entered = Arc::clone(&target.entered);
        let engine = Arc::new(engine(target, &store));
        engine.check_connection().await;

        let running = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.tick().await }
        });
        entered.notified().await;

        assert_eq!(engine.sync_now(true).await, SyncOutcome::Coalesced);
        assert_eq!(engine.sync_now(false).await, SyncOutcome::Coalesced);

        hold.notify_one();
        entered.notified().await;
        hold.notify_one();
        assert!(matches!(running.await.expect("join"), SyncOutcome::Completed(_)));

        assert_eq!(engine.target().passes.load(Ordering::SeqCst), 2);
        assert_eq!(engine.target().forced_passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sync_requested_during_a_push_runs_after_it() {
        let store = Arc::new(InMemoryRemoteStore::default());
        let hold = Arc::new(Notify::new());
        let target = CountingTarget {
            hold: Some(Arc::clone(&hold)),
            push_hold: Some(Arc::clone(&hold)),
            ..CountingTarget::default()
        };
        let entered = Arc::clone(&target.entered);
        let engine = Arc::new(engine(target, &store));
        engine.check_connection().await;

        let pushing = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.push_after_save().await }
        });
        entered.notified().await;

        assert_eq!(engine.sync_now(false).await, SyncOutcome::Coalesced);
        // A second save during the upload folds into the same queued pass.
        engine.push_after_save().await;

        hold.notify_one();
        entered.notified().await;
        hold.notify_one();
        pushing.await.expect("join");

        assert_eq!(engine.target().pushes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.target().passes.load(Ordering::SeqCst), 1);

        // Nothing stale is left queued for the next trigger.
        hold.notify_one();
        assert!(matches!(engine.tick().await, SyncOutcome::Completed(_)));
        assert_eq!(engine.target().passes.load(Ordering::SeqCst), 2);
    }
}
