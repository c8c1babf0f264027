//! ProxyEnvSync - keeps shell proxy variables in step with the OS proxy.
//!
//! `proxyenv run` polls the system proxy and mirrors it into the user's
//! shell-startup file (or the per-user environment on Windows). The other
//! subcommands inspect or change the persisted sync policy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use proxyenv_app::{ExitKind, HostSession, StatusReport};
use proxyenv_core::{ProxySyncEngine, SyncPolicy};
use proxyenv_storage::Database;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ProxyEnvSync - mirror the system proxy into your shell environment
#[derive(Parser, Debug)]
#[command(name = "proxyenv", version, about)]
struct Args {
    /// Enable debug logging (also logs to the console)
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Settings database path (defaults to the app data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Poll the system proxy until interrupted (default)
    Run,
    /// Print the detected proxy, persisted variables and policy as JSON
    Status,
    /// Turn environment sync on or off
    Sync { state: Toggle },
    /// Turn change notifications on or off
    Notify { state: Toggle },
    /// Set the poll interval in milliseconds (at least 1000)
    Interval { millis: u64 },
    /// Remove the persisted proxy variables
    Clear,
    /// Print the stored policy as JSON
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        self == Toggle::On
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    Database::data_dir().ok().map(|dir| dir.join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args, console: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxyenv={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("proxyenv")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if console || args.debug {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Waits for Ctrl-C, or SIGTERM on Unix.
async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Run the polling daemon until interrupted.
async fn run_daemon(engine: ProxySyncEngine) -> anyhow::Result<()> {
    let session = HostSession::new(engine);

    session.subscribe(|event| {
        tracing::info!(
            "Proxy {} (forced={}), environment: {}",
            event.system_proxy,
            event.forced,
            event.environment_state.proxy_url().unwrap_or("unset")
        );
    });
    session.on_enter().await;

    tracing::info!(
        "Watching system proxy (sync={}, interval={}ms)",
        session.engine().sync_enabled(),
        session.engine().check_interval().as_millis()
    );

    let result = wait_for_shutdown().await;
    session.on_exit(ExitKind::Forced).await;
    result
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Run);

    let _log_guard = init_logging(&args, !matches!(command, Command::Run));
    tracing::debug!("Args: {:?}", args);

    let db = Database::open(args.db.as_deref())
        .map_err(|e| anyhow::anyhow!("Database error: {}", e))?;
    let store = Arc::new(db);

    if let Command::Config = command {
        return print_json(&SyncPolicy::load(store.as_ref()));
    }

    let engine = ProxySyncEngine::for_current_platform(store).map_err(|e| {
        tracing::error!("Cannot start proxy sync: {}", e);
        anyhow::anyhow!(e)
    })?;

    match command {
        Command::Run => {
            tracing::info!("Starting ProxyEnvSync...");
            run_daemon(engine).await?;
            tracing::info!("ProxyEnvSync shutting down");
        }
        Command::Status => {
            print_json(&StatusReport::detect(&engine).await)?;
        }
        Command::Sync { state } => {
            engine.set_sync_enabled(state.enabled()).await?;
            println!("Sync {}", if state.enabled() { "enabled" } else { "disabled" });
        }
        Command::Notify { state } => {
            engine.set_notification_enabled(state.enabled())?;
            println!(
                "Notifications {}",
                if state.enabled() { "enabled" } else { "disabled" }
            );
        }
        Command::Interval { millis } => {
            engine
                .set_check_interval(Duration::from_millis(millis))
                .await?;
            println!("Check interval set to {}ms", millis);
        }
        Command::Clear => {
            engine.clear_environment().await?;
            println!("Cleared proxy variables from {}", engine.environment_location());
        }
        Command::Config => {}
    }

    Ok(())
}
