//! Quotabar - tracks how much of each AI assistant's quota is used.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quotabar_app::output::{format_credentials, format_peaks, format_report};
use quotabar_app::{refresh_period, Connector, Poller};
use quotabar_core::{CaptureOutcome, Discovery, EndpointDiscovery, Provider};
use quotabar_proxy::{BrowserLauncher, CaManager};
use quotabar_storage::{Database, Settings};

/// Samples older than this are pruned by `watch`.
const HISTORY_RETENTION_DAYS: i64 = 90;

/// Quotabar - AI-assistant quota tracking
#[derive(Parser, Debug)]
#[command(name = "quotabar", version, about)]
struct Args {
    /// Database file (defaults to the app data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable debug logging and echo logs to the console
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in to providers and capture their usage endpoints
    Connect {
        /// Providers to connect (z_ai, claude, codex)
        #[arg(required = true)]
        providers: Vec<Provider>,
    },
    /// Forget a provider's captured endpoint
    Disconnect {
        /// Provider to disconnect
        provider: Provider,
    },
    /// Show which providers are connected
    Status,
    /// Poll every provider once
    Poll,
    /// Poll at the configured interval until interrupted
    Watch,
    /// Show daily usage peaks
    History {
        /// Provider to show
        provider: Provider,
        /// Number of days to include
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Read or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print one setting
    Get {
        /// Setting name
        key: String,
    },
    /// Change a setting (an empty value clears `browser`)
    Set {
        /// Setting name
        key: String,
        /// New value
        value: String,
    },
    /// Print every setting
    List,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "quotabar", "quotabar").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("quotabar={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("quotabar")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if args.debug {
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

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn open_database(path: Option<&PathBuf>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("Failed to open database")
}

async fn connect(db: Database, providers: Vec<Provider>) -> anyhow::Result<()> {
    if let Some(local) = providers.iter().find(|p| !p.uses_capture()) {
        bail!(
            "{} needs no login; start the desktop app and run `quotabar poll`",
            local.display_name()
        );
    }

    let settings = db.settings()?;
    let browser = BrowserLauncher::detect(settings.browser.as_deref())?;
    let connector = Connector::new(db, browser, CaManager::with_default_dir()?);

    println!("Log in and open the usage page in each window that opens.");
    let mut failed = false;
    for (provider, outcome) in connector.connect_all(&providers).await {
        match outcome {
            CaptureOutcome::Connected(_) => println!("{}: connected", provider.display_name()),
            CaptureOutcome::Aborted => {
                failed = true;
                println!("{}: window closed before usage was found", provider.display_name())
            }
            CaptureOutcome::Failed(reason) => {
                failed = true;
                println!("{}: failed ({})", provider.display_name(), reason)
            }
        }
    }

    if failed {
        bail!("Not every provider was connected");
    }
    Ok(())
}

async fn status(db: &Database) -> anyhow::Result<()> {
    for line in format_credentials(&db.list_credentials()?) {
        println!("{}", line);
    }

    let antigravity = Provider::Antigravity.display_name();
    match EndpointDiscovery::system()?.discover().await {
        Discovery::Connected(endpoint) => {
            println!("{:<14} running at {}", antigravity, endpoint.base_url())
        }
        Discovery::NotConnected(reason) => println!("{:<14} {}", antigravity, reason),
    }
    Ok(())
}

async fn poll_once(poller: &Poller) {
    for report in poller.poll_all().await {
        println!("{}", format_report(&report));
    }
}

async fn watch(db: Database) -> anyhow::Result<()> {
    let minutes = db.settings()?.refresh_interval_minutes;
    let poller = Poller::new(db.clone())?;
    let mut interval = tokio::time::interval(refresh_period(minutes));

    tracing::info!("Watching usage every {} minutes", minutes);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                println!("--- {} ---", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
                poll_once(&poller).await;

                let cutoff = Utc::now() - chrono::Duration::days(HISTORY_RETENTION_DAYS);
                match db.prune_history(cutoff) {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Pruned {} old usage samples", n),
                    Err(e) => tracing::warn!("Failed to prune history: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping watch");
                return Ok(());
            }
        }
    }
}

fn history(db: &Database, provider: Provider, days: i64) -> anyhow::Result<()> {
    let since = Utc::now() - chrono::Duration::days(days.max(1));
    let peaks = db.daily_peaks(provider, since)?;
    println!("{}", format_peaks(provider, &peaks));
    Ok(())
}

fn config(db: &Database, action: ConfigAction) -> anyhow::Result<()> {
    let current = serde_json::to_value(db.settings()?)?;

    match action {
        ConfigAction::Get { key } => {
            if !Settings::is_known(&key) {
                bail!("Unknown setting: {}", key);
            }
            println!("{}", current[key.as_str()]);
        }
        ConfigAction::Set { key, value } => {
            db.set_setting(&key, &value)?;
            println!("{} updated", key);
        }
        ConfigAction::List => {
            if let Some(settings) = current.as_object() {
                for (key, value) in settings {
                    println!("{} = {}", key, value);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::debug!("Starting Quotabar v{}", env!("CARGO_PKG_VERSION"));

    let db = open_database(args.db.as_ref())?;

    match args.command {
        Command::Connect { providers } => connect(db, providers).await,
        Command::Disconnect { provider } => {
            if db.delete_credential(provider)? {
                println!("{} disconnected", provider.display_name());
            } else {
                println!("{} was not connected", provider.display_name());
            }
            Ok(())
        }
        Command::Status => status(&db).await,
        Command::Poll => {
            poll_once(&Poller::new(db)?).await;
            Ok(())
        }
        Command::Watch => watch(db).await,
        Command::History { provider, days } => history(&db, provider, days),
        Command::Config { action } => config(&db, action),
    }
}
