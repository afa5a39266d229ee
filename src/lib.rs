pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
mod test_support;

use application::commands::{
    backup_impl, clear_token_impl, export_impl, login_impl, logout_impl, register_impl, reset_impl,
    run_impl, set_token_impl, stats_impl, status_impl, sync_accounts_impl, sync_ledger_impl,
    toggle_impl, workspace_or_current, AppState, StatusResponse,
};
use application::reports::format_duration;
use application::scheduler::TickStatus;
use application::sync_engine::SyncOutcome;
use clap::{Parser, Subcommand};
use infrastructure::error::InfraError;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Daily work timer with an offline-first ledger and background sync.
#[derive(Debug, Parser)]
#[command(name = "worktime", version = env!("CARGO_PKG_VERSION"), long_about = None)]
pub struct Cli {
    /// Workspace holding config/, data/, logs/ and backups/ (default: current directory)
    #[arg(global = true, long)]
    pub workspace: Option<PathBuf>,

    /// Print command results as JSON
    #[arg(global = true, long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create an account
    Register {
        username: String,
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Log in and remember the user for later commands
    Login {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the remembered user
    Logout,
    /// Show today's time
    Status,
    /// Start or stop the timer
    Toggle,
    /// Discard today's time
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Run the live timer with background sync until Ctrl-C
    Run,
    /// Reconcile the ledger with the remote store now
    Sync {
        /// Local side wins every conflict
        #[arg(long)]
        force: bool,
    },
    /// Reconcile the account directory with the remote store now
    SyncAccounts {
        #[arg(long)]
        force: bool,
    },
    /// Total time over an inclusive date range (YYYY-MM-DD)
    Stats {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Export the ledger as CSV
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        target_hours: Option<f64>,
    },
    /// Copy the ledger into backups/
    Backup,
    /// Manage the remote store bearer token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum TokenAction {
    Set { token: String },
    Clear,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Login { .. } => "login",
            Self::Logout => "logout",
            Self::Status => "status",
            Self::Toggle => "toggle",
            Self::Reset { .. } => "reset",
            Self::Run => "run",
            Self::Sync { .. } => "sync",
            Self::SyncAccounts { .. } => "sync_accounts",
            Self::Stats { .. } => "stats",
            Self::Export { .. } => "export",
            Self::Backup => "backup",
            Self::Token { .. } => "token",
        }
    }
}

pub fn run() -> Result<(), String> {
    let cli = Cli::parse();
    init_tracing();

    let workspace_root = workspace_or_current(cli.workspace.clone()).map_err(|error| error.to_string())?;
    let state = AppState::new(workspace_root).map_err(|error| error.to_string())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| format!("failed to start async runtime: {error}"))?;

    runtime
        .block_on(dispatch(&state, &cli))
        .map_err(|error| state.command_error(cli.command.name(), &error))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

async fn dispatch(state: &AppState, cli: &Cli) -> Result<(), InfraError> {
    let json = cli.json;
    match &cli.command {
        Commands::Register { username, password } => {
            let password = password_or_prompt(password.as_deref())?;
            let account = register_impl(state, username.clone(), password).await?;
            print_result(json, &account, || format!("registered {}", account.username))
        }
        Commands::Login { username, password } => {
            let password = password_or_prompt(password.as_deref())?;
            let login = login_impl(state, username.clone(), password).await?;
            print_result(json, &login, || {
                format!("logged in as {} ({})", login.account.username, login.ledger_sync)
            })
        }
        Commands::Logout => {
            logout_impl(state)?;
            println!("logged out");
            Ok(())
        }
        Commands::Status => print_status(json, &status_impl(state)?),
        Commands::Toggle => print_status(json, &toggle_impl(state).await?),
        Commands::Reset { yes } => print_status(json, &reset_impl(state, *yes).await?),
        Commands::Run => {
            run_impl(state, render_tick).await?;
            println!();
            Ok(())
        }
        Commands::Sync { force } => print_outcome(json, &sync_ledger_impl(state, *force).await?),
        Commands::SyncAccounts { force } => {
            print_outcome(json, &sync_accounts_impl(state, *force).await?)
        }
        Commands::Stats { from, to } => {
            let stats = stats_impl(state, from.clone(), to.clone())?;
            print_result(json, &stats, || {
                format!(
                    "{} to {}: {} over {} day(s)",
                    stats.start, stats.end, stats.total, stats.days_worked
                )
            })
        }
        Commands::Export { output, target_hours } => {
            let export = export_impl(state, output.clone(), *target_hours)?;
            print_result(json, &export, || format!("exported {} day(s) to {}", export.rows, export.path))
        }
        Commands::Backup => {
            match backup_impl(state)? {
                Some(path) => println!("backup written to {}", path.display()),
                None => println!("nothing to back up yet"),
            }
            Ok(())
        }
        Commands::Token { action } => {
            match action {
                TokenAction::Set { token } => set_token_impl(state, token.clone())?,
                TokenAction::Clear => clear_token_impl(state)?,
            }
            println!("token updated; takes effect on the next start");
            Ok(())
        }
    }
}

fn print_result<T, F>(json: bool, value: &T, human: F) -> Result<(), InfraError>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn print_status(json: bool, status: &StatusResponse) -> Result<(), InfraError> {
    print_result(json, status, || {
        let state = if status.is_running { "running" } else { "stopped" };
        format!("{} {}: {} ({state})", status.username, status.date, status.elapsed)
    })
}

fn print_outcome(json: bool, outcome: &SyncOutcome) -> Result<(), InfraError> {
    if json {
        let value = match outcome {
            SyncOutcome::Completed(report) => serde_json::json!({ "status": "completed", "report": report }),
            SyncOutcome::NoConnection => serde_json::json!({ "status": "no_connection" }),
            SyncOutcome::Coalesced => serde_json::json!({ "status": "coalesced" }),
            SyncOutcome::Failed(message) => serde_json::json!({ "status": "failed", "message": message }),
        };
        println!("{value}");
    } else {
        println!("{}", outcome.message());
    }
    Ok(())
}

fn render_tick(status: TickStatus) {
    let marker = if status.is_running { "running" } else { "stopped" };
    let mut stdout = io::stdout();
    let _ = write!(stdout, "\r{} ({marker})   ", format_duration(status.elapsed_seconds));
    let _ = stdout.flush();
}

fn password_or_prompt(password: Option<&str>) -> Result<String, InfraError> {
    if let Some(password) = password {
        return Ok(password.to_string());
    }
    eprint!("password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_global_workspace_and_subcommands() {
        let cli = Cli::try_parse_from(["worktime", "--workspace", "/tmp/w", "sync", "--force"]).expect("parse");
        assert_eq!(cli.workspace, Some(PathBuf::from("/tmp/w")));
        assert!(matches!(cli.command, Commands::Sync { force: true }));

        let cli = Cli::try_parse_from(["worktime", "stats", "--from", "2024-05-01", "--json"]).expect("parse");
        assert!(cli.json);
        assert_eq!(cli.command.name(), "stats");

        let cli = Cli::try_parse_from(["worktime", "token", "set", "abc"]).expect("parse");
        assert!(matches!(cli.command, Commands::Token { action: TokenAction::Set { ref token } } if token == "abc"));
    }

    #[test]
    fn reset_flag_defaults_to_unconfirmed() {
        let cli = Cli::try_parse_from(["worktime", "reset"]).expect("parse");
        assert!(matches!(cli.command, Commands::Reset { yes: false }));
        assert!(Cli::try_parse_from(["worktime", "frobnicate"]).is_err());
    }
}
