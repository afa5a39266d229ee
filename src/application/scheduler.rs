use crate::application::accounts::AccountSync;
use crate::application::ledger::{LedgerSession, LedgerSync};
use crate::application::sync_engine::{SyncEngine, SyncOutcome, SyncTarget};
use crate::domain::models::SyncPhase;
use crate::infrastructure::config::SyncSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::watcher::ChangeWatcher;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug)]
pub enum SyncCommand {
    SyncLedger {
        force: bool,
        reply: Option<oneshot::Sender<SyncOutcome>>,
    },
    SyncAccounts {
        force: bool,
        reply: Option<oneshot::Sender<SyncOutcome>>,
    },
    CheckConnection,
    /// The ledger was saved locally.
    LedgerSaved,
    /// Another process modified the ledger file.
    FileChanged,
    Shutdown,
}

/// Cheap handle for sending triggers to the background engines.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub(crate) fn new(commands: mpsc::Sender<SyncCommand>) -> Self {
        Self { commands }
    }

    pub async fn sync_ledger(&self, force: bool) -> SyncOutcome {
        self.request(|reply| SyncCommand::SyncLedger {
            force,
            reply: Some(reply),
        })
        .await
    }

    pub async fn sync_accounts(&self, force: bool) -> SyncOutcome {
        self.request(|reply| SyncCommand::SyncAccounts {
            force,
            reply: Some(reply),
        })
        .await
    }

    /// Never waits; a full queue drops the notification, and the next
    /// periodic pass picks the change up instead.
    pub fn notify_saved(&self) {
        if let Err(error) = self.commands.try_send(SyncCommand::LedgerSaved) {
            tracing::debug!(%error, "dropped save notification");
        }
    }

    pub fn notify_file_changed(&self) {
        if let Err(error) = self.commands.try_send(SyncCommand::FileChanged) {
            tracing::debug!(%error, "dropped file change notification");
        }
    }

    async fn request<F>(&self, command: F) -> SyncOutcome
    where
        F: FnOnce(oneshot::Sender<SyncOutcome>) -> SyncCommand,
    {
        let (reply, response) = oneshot::channel();
        if self.commands.send(command(reply)).await.is_err() {
            return SyncOutcome::Failed("sync scheduler has stopped".to_string());
        }
        response
            .await
            .unwrap_or_else(|_| SyncOutcome::Failed("sync request was dropped".to_string()))
    }
}

/// Owns the background side: two periodic sync tasks, the connection check,
/// the file watch and the dispatcher that feeds both engines.
pub struct Scheduler {
    handle: SyncHandle,
    dispatcher: JoinHandle<()>,
    periodic: Vec<JoinHandle<()>>,
    _watcher: Option<ChangeWatcher>,
}

impl Scheduler {
    /// Runs the startup pass of both engines, then starts the background
    /// tasks. Must be called from within a tokio runtime.
    pub async fn start(
        ledger_engine: Arc<SyncEngine<LedgerSync>>,
        account_engine: Arc<SyncEngine<AccountSync>>,
        settings: &SyncSettings,
    ) -> Self {
        let (ledger_start, account_start) = tokio::join!(ledger_engine.start(), account_engine.start());
        tracing::info!(
            ledger = %ledger_start.message(),
            accounts = %account_start.message(),
            "sync engines started"
        );

        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SyncHandle::new(commands.clone());

        let session = Arc::clone(ledger_engine.target().session());
        let watcher = {
            let watched = Arc::clone(&session);
            let notifier = handle.clone();
            match ChangeWatcher::spawn(
                session.path(),
                settings.watch_debounce,
                move || watched.is_own_write(),
                move || notifier.notify_file_changed(),
            ) {
                Ok(watcher) => Some(watcher),
                Err(error) => {
                    tracing::warn!(%error, "file watching disabled");
                    None
                }
            }
        };

        let periodic = vec![
            spawn_periodic("ledger-sync", commands.clone(), settings.ledger_interval, || {
                SyncCommand::SyncLedger {
                    force: false,
                    reply: None,
                }
            }),
            spawn_periodic("account-sync", commands.clone(), settings.account_interval, || {
                SyncCommand::SyncAccounts {
                    force: false,
                    reply: None,
                }
            }),
            spawn_periodic("connection-check", commands, settings.connection_check, || {
                SyncCommand::CheckConnection
            }),
        ];
        let dispatcher = tokio::spawn(dispatch(receiver, ledger_engine, account_engine));

        Self {
            handle,
            dispatcher,
            periodic,
            _watcher: watcher,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) {
        for task in &self.periodic {
            task.abort();
        }
        let _ = self.handle.commands.send(SyncCommand::Shutdown).await;
        if let Err(error) = self.dispatcher.await {
            tracing::warn!(%error, "sync dispatcher ended abnormally");
        }
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    commands: mpsc::Sender<SyncCommand>,
    period: Duration,
    command: F,
) -> JoinHandle<()>
where
    F: Fn() -> SyncCommand + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tracing::debug!(task = name, "periodic trigger");
            if commands.send(command()).await.is_err() {
                break;
            }
        }
    })
}

async fn dispatch(
    mut receiver: mpsc::Receiver<SyncCommand>,
    ledger_engine: Arc<SyncEngine<LedgerSync>>,
    account_engine: Arc<SyncEngine<AccountSync>>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            SyncCommand::SyncLedger { force, reply } => {
                let engine = Arc::clone(&ledger_engine);
                tokio::spawn(async move {
                    let outcome = engine.sync_now(force).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                });
            }
            SyncCommand::SyncAccounts { force, reply } => {
                let engine = Arc::clone(&account_engine);
                tokio::spawn(async move {
                    let outcome = engine.sync_now(force).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                });
            }
            SyncCommand::CheckConnection => {
                let ledger = Arc::clone(&ledger_engine);
                let accounts = Arc::clone(&account_engine);
                tokio::spawn(async move {
                    tokio::join!(reconnect(ledger), reconnect(accounts));
                });
            }
            SyncCommand::LedgerSaved => {
                let engine = Arc::clone(&ledger_engine);
                tokio::spawn(async move { engine.push_after_save().await });
            }
            SyncCommand::FileChanged => {
                if let Err(error) = ledger_engine.target().session().apply_external() {
                    tracing::error!(%error, "failed to merge external ledger changes");
                }
            }
            SyncCommand::Shutdown => break,
        }
    }
    tracing::debug!("sync dispatcher stopped");
}

/// Re-probes the remote; coming back online triggers a full pass.
async fn reconnect<T: SyncTarget>(engine: Arc<SyncEngine<T>>) {
    let before = engine.phase();
    let after = engine.check_connection().await;
    if before == SyncPhase::Disconnected && after == SyncPhase::Connected {
        let outcome = engine.sync_now(false).await;
        tracing::info!(result = %outcome.message(), "reconciled after reconnect");
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickStatus {
    pub elapsed_seconds: f64,
    pub is_running: bool,
}

/// The live timer loop. Touches only the local ledger; remote work is handed
/// to the scheduler through `sync`.
pub async fn run_foreground<S, R>(
    session: Arc<LedgerSession>,
    sync: SyncHandle,
    tick: Duration,
    auto_save: Duration,
    shutdown: S,
    mut render: R,
) -> Result<(), InfraError>
where
    S: Future<Output = ()>,
    R: FnMut(TickStatus),
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_save = Instant::now();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        match session.roll_over_if_needed() {
            Ok(true) => {
                sync.notify_saved();
                last_save = Instant::now();
            }
            Ok(false) => {}
            Err(error) => tracing::error!(%error, "failed to roll the ledger over to a new day"),
        }

        let record = session.today_record()?;
        if record.is_running && last_save.elapsed() >= auto_save {
            match session.save() {
                Ok(_) => sync.notify_saved(),
                Err(error) => tracing::error!(%error, "auto-save failed"),
            }
            last_save = Instant::now();
        }

        render(TickStatus {
            elapsed_seconds: record.effective_seconds(session.clock().epoch_seconds()),
            is_running: record.is_running,
        });
    }

    session.save()?;
    sync.notify_saved();
    Ok(())
}
