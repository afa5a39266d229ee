use crate::application::accounts::{AccountService, AccountSync};
use crate::application::bootstrap::{bootstrap_workspace, BootstrapResult, WorkspacePaths};
use crate::application::clock::Clock;
use crate::application::ledger::{ledger_path, LedgerSession, LedgerSync};
use crate::application::reports::{export_csv, format_duration, summarize_period};
use crate::application::scheduler::{run_foreground, Scheduler, TickStatus};
use crate::application::sync_engine::{SyncEngine, SyncOutcome, SyncTarget};
use crate::domain::models::{Ledger, SyncPhase, UserAccount, DATE_FORMAT};
use crate::infrastructure::backup::create_backup;
use crate::infrastructure::config::{RemoteSettings, Settings};
use crate::infrastructure::credential_store::{resolve_token, CredentialStore, KeyringCredentialStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_store::{HttpRemoteStore, RemoteTarget};
use chrono::{Datelike, NaiveDate, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_TARGET_HOURS: f64 = 1.0;
const FOREGROUND_TICK: Duration = Duration::from_secs(1);

pub struct AppState {
    paths: WorkspacePaths,
    settings: Settings,
    clock: Clock,
    credentials: Arc<dyn CredentialStore>,
    ledger_remote: RemoteTarget<Ledger>,
    accounts: Arc<AccountService>,
    account_engine: Arc<SyncEngine<AccountSync>>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let clock = Clock::system(bootstrap.settings.timezone);
        let credentials: Arc<dyn CredentialStore> = Arc::new(KeyringCredentialStore::default());
        let (ledger_remote, account_remote) = remote_targets(&bootstrap.settings.remote, credentials.as_ref())?;

        Ok(Self::with_components(
            bootstrap,
            clock,
            credentials,
            ledger_remote,
            account_remote,
        ))
    }

    pub fn with_components(
        bootstrap: BootstrapResult,
        clock: Clock,
        credentials: Arc<dyn CredentialStore>,
        ledger_remote: RemoteTarget<Ledger>,
        account_remote: RemoteTarget<UserAccount>,
    ) -> Self {
        let BootstrapResult { paths, settings } = bootstrap;
        let accounts = Arc::new(AccountService::open(
            &paths.data_dir,
            account_remote.clone(),
            clock.clone(),
        ));
        let account_engine = Arc::new(SyncEngine::new(
            AccountSync::new(Arc::clone(&accounts)),
            account_remote,
            settings.remote.timeout,
            clock.clone(),
        ));

        Self {
            paths,
            settings,
            clock,
            credentials,
            ledger_remote,
            accounts,
            account_engine,
            log_guard: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        tracing::info!(command, "{message}");
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        tracing::error!(command, "{message}");
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.paths.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }

    fn open_ledger(&self, username: &str) -> Result<Arc<LedgerSession>, InfraError> {
        let path = ledger_path(&self.paths.data_dir, username);
        Ok(Arc::new(LedgerSession::open(username, path, self.clock.clone())?))
    }

    fn open_current_ledger(&self) -> Result<Arc<LedgerSession>, InfraError> {
        let username = self.accounts.current_user()?;
        self.open_ledger(&username)
    }

    fn ledger_engine(&self, session: Arc<LedgerSession>) -> SyncEngine<LedgerSync> {
        SyncEngine::new(
            LedgerSync::new(session),
            self.ledger_remote.clone(),
            self.settings.remote.timeout,
            self.clock.clone(),
        )
    }
}

/// Builds both remote targets from settings. No endpoint means both stay
/// unconfigured; a keyring failure only drops the bearer token.
fn remote_targets(
    settings: &RemoteSettings,
    credentials: &dyn CredentialStore,
) -> Result<(RemoteTarget<Ledger>, RemoteTarget<UserAccount>), InfraError> {
    let Some(endpoint) = settings.endpoint.as_ref() else {
        return Ok((RemoteTarget::Unconfigured, RemoteTarget::Unconfigured));
    };
    let token = match resolve_token(settings.token_override.as_deref(), credentials) {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(%error, "continuing without a remote token");
            None
        }
    };

    let ledger = HttpRemoteStore::<Ledger>::new(
        endpoint,
        &settings.ledger_collection,
        token.clone(),
        settings.timeout,
    )?;
    let accounts = HttpRemoteStore::<UserAccount>::new(
        endpoint,
        &settings.account_collection,
        token,
        settings.timeout,
    )?;
    Ok((
        RemoteTarget::configured(Arc::new(ledger)),
        RemoteTarget::configured(Arc::new(accounts)),
    ))
}

/// Upload after a local mutation if the remote answers right now. Never fails
/// the command.
async fn push_best_effort<T: SyncTarget>(engine: &SyncEngine<T>) {
    if !engine.is_configured() {
        return;
    }
    if engine.check_connection().await == SyncPhase::Connected {
        engine.push_after_save().await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<String>,
}

impl From<&UserAccount> for AccountResponse {
    fn from(account: &UserAccount) -> Self {
        Self {
            username: account.username.clone(),
            last_login: account.last_login.map(|at| at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub account: AccountResponse,
    pub ledger_sync: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusResponse {
    pub username: String,
    pub date: String,
    pub elapsed_seconds: f64,
    pub elapsed: String,
    pub is_running: bool,
    pub remote_configured: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsResponse {
    pub start: String,
    pub end: String,
    pub total_seconds: f64,
    pub total: String,
    pub days_worked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
    pub path: String,
    pub rows: usize,
}

pub async fn register_impl(
    state: &AppState,
    username: String,
    password: String,
) -> Result<AccountResponse, InfraError> {
    let account = state.accounts.register(&username, &password).await?;
    push_best_effort(&state.account_engine).await;
    state.log_info("register", &format!("registered account {}", account.username));
    Ok(AccountResponse::from(&account))
}

/// Logs in and remembers the user, then pulls their ledger if the remote
/// is reachable.
pub async fn login_impl(
    state: &AppState,
    username: String,
    password: String,
) -> Result<LoginResponse, InfraError> {
    let account = state.accounts.login(&username, &password).await?;
    push_best_effort(&state.account_engine).await;

    let session = state.open_ledger(&account.username)?;
    let outcome = state.ledger_engine(session).start().await;
    state.log_info("login", &format!("{} logged in; {}", account.username, outcome.message()));
    Ok(LoginResponse {
        account: AccountResponse::from(&account),
        ledger_sync: outcome.message(),
    })
}

pub fn logout_impl(state: &AppState) -> Result<(), InfraError> {
    state.accounts.logout()?;
    state.log_info("logout", "auto-login cleared");
    Ok(())
}

pub fn status_impl(state: &AppState) -> Result<StatusResponse, InfraError> {
    let session = state.open_current_ledger()?;
    status_of(state, &session)
}

fn status_of(state: &AppState, session: &LedgerSession) -> Result<StatusResponse, InfraError> {
    let record = session.today_record()?;
    let elapsed_seconds = record.effective_seconds(state.clock.epoch_seconds());
    Ok(StatusResponse {
        username: session.owner().to_string(),
        date: session.today()?.format(DATE_FORMAT).to_string(),
        elapsed_seconds,
        elapsed: format_duration(elapsed_seconds),
        is_running: record.is_running,
        remote_configured: state.ledger_remote.is_configured(),
    })
}

pub async fn toggle_impl(state: &AppState) -> Result<StatusResponse, InfraError> {
    let session = state.open_current_ledger()?;
    let record = session.toggle()?;
    push_best_effort(&state.ledger_engine(Arc::clone(&session))).await;
    state.log_info(
        "toggle",
        if record.is_running { "timer started" } else { "timer stopped" },
    );
    status_of(state, &session)
}

/// Clears today's record. Destructive, so the caller must pass `confirmed`.
pub async fn reset_impl(state: &AppState, confirmed: bool) -> Result<StatusResponse, InfraError> {
    if !confirmed {
        return Err(InfraError::InvalidState(
            "reset discards today's time; confirm with --yes".to_string(),
        ));
    }
    let session = state.open_current_ledger()?;
    session.reset()?;
    push_best_effort(&state.ledger_engine(Arc::clone(&session))).await;
    state.log_info("reset", "today's time was reset");
    status_of(state, &session)
}

pub async fn sync_ledger_impl(state: &AppState, force: bool) -> Result<SyncOutcome, InfraError> {
    let session = state.open_current_ledger()?;
    let outcome = state.ledger_engine(session).sync_now(force).await;
    log_outcome(state, "sync", &outcome);
    Ok(outcome)
}

pub async fn sync_accounts_impl(state: &AppState, force: bool) -> Result<SyncOutcome, InfraError> {
    let outcome = state.account_engine.sync_now(force).await;
    log_outcome(state, "sync_accounts", &outcome);
    Ok(outcome)
}

fn log_outcome(state: &AppState, command: &str, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Failed(_) => state.log_error(command, &outcome.message()),
        _ => state.log_info(command, &outcome.message()),
    }
}

/// Totals over an inclusive range. Defaults to the current month up to today.
pub fn stats_impl(
    state: &AppState,
    from: Option<String>,
    to: Option<String>,
) -> Result<StatsResponse, InfraError> {
    let session = state.open_current_ledger()?;
    let today = session.today()?;
    let start = match from {
        Some(value) => parse_date_input(&value, "from")?,
        None => today.with_day(1).unwrap_or(today),
    };
    let end = match to {
        Some(value) => parse_date_input(&value, "to")?,
        None => today,
    };

    let summary = summarize_period(
        &session.snapshot()?,
        start,
        end,
        today,
        state.clock.epoch_seconds(),
    )?;
    Ok(StatsResponse {
        start: summary.start.format(DATE_FORMAT).to_string(),
        end: summary.end.format(DATE_FORMAT).to_string(),
        total_seconds: summary.total_seconds,
        total: format_duration(summary.total_seconds),
        days_worked: summary.days_worked,
    })
}

pub fn export_impl(
    state: &AppState,
    output: Option<PathBuf>,
    target_hours: Option<f64>,
) -> Result<ExportResponse, InfraError> {
    let target_hours = target_hours.unwrap_or(DEFAULT_TARGET_HOURS);
    if !target_hours.is_finite() || target_hours < 0.0 {
        return Err(InfraError::InvalidState(format!(
            "target hours must be a non-negative number, got {target_hours}"
        )));
    }
    let session = state.open_current_ledger()?;
    let path = output.unwrap_or_else(|| {
        state.paths.workspace_root.join(format!(
            "work_time_export_{}.csv",
            state.clock.local_now().format("%Y%m%d_%H%M%S")
        ))
    });

    let rows = export_csv(&session.snapshot()?, target_hours, &path)?;
    state.log_info("export", &format!("exported {rows} days to {}", path.display()));
    Ok(ExportResponse {
        path: path.display().to_string(),
        rows,
    })
}

pub fn backup_impl(state: &AppState) -> Result<Option<PathBuf>, InfraError> {
    let session = state.open_current_ledger()?;
    let backup = backup_ledger(state, &session)?;
    match &backup {
        Some(path) => state.log_info("backup", &format!("backup written to {}", path.display())),
        None => state.log_info("backup", "nothing to back up yet"),
    }
    Ok(backup)
}

fn backup_ledger(state: &AppState, session: &LedgerSession) -> Result<Option<PathBuf>, InfraError> {
    create_backup(
        session.path(),
        &state.paths.backups_dir.join(session.owner()),
        &state.clock.local_now(),
        state.settings.backup_retention,
    )
}

/// Stores the remote bearer token. Takes effect on the next start.
pub fn set_token_impl(state: &AppState, token: String) -> Result<(), InfraError> {
    state.credentials.save_token(&token)?;
    state.log_info("token", "remote token stored");
    Ok(())
}

pub fn clear_token_impl(state: &AppState) -> Result<(), InfraError> {
    state.credentials.delete_token()?;
    state.log_info("token", "remote token cleared");
    Ok(())
}

/// Foreground timer plus background sync until Ctrl-C.
pub async fn run_impl<R>(state: &AppState, render: R) -> Result<(), InfraError>
where
    R: FnMut(TickStatus),
{
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for Ctrl-C; stopping");
        }
    };
    run_until(state, shutdown, render).await
}

pub async fn run_until<S, R>(state: &AppState, shutdown: S, render: R) -> Result<(), InfraError>
where
    S: Future<Output = ()>,
    R: FnMut(TickStatus),
{
    let session = state.open_current_ledger()?;
    if let Err(error) = backup_ledger(state, &session) {
        tracing::warn!(%error, "startup backup failed");
    }

    let ledger_engine = Arc::new(state.ledger_engine(Arc::clone(&session)));
    let scheduler = Scheduler::start(
        ledger_engine,
        Arc::clone(&state.account_engine),
        &state.settings.sync,
    )
    .await;
    state.log_info("run", &format!("timer loop started for {}", session.owner()));

    let result = run_foreground(
        session,
        scheduler.handle(),
        FOREGROUND_TICK,
        state.settings.sync.auto_save,
        shutdown,
        render,
    )
    .await;
    scheduler.shutdown().await;

    match &result {
        Ok(()) => state.log_info("run", "timer loop stopped"),
        Err(error) => state.log_error("run", &error.to_string()),
    }
    result
}

fn parse_date_input(value: &str, field_name: &str) -> Result<NaiveDate, InfraError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|error| {
        InfraError::InvalidState(format!("{field_name} must be YYYY-MM-DD: {error}"))
    })
}

pub fn workspace_or_current(root: Option<PathBuf>) -> Result<PathBuf, InfraError> {
    match root {
        Some(path) => Ok(path),
        None => Ok(std::env::current_dir()?),
    }
}
