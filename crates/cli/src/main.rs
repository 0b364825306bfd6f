use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agg_config::RootConfig;
use agg_connectors::{Publisher, RecordingPublisher, SourceConnector, TelegramPublisher};
use agg_orchestrator::{FetchWindows, Orchestrator};
use agg_state::StateRepo;
use clap::{Parser, Subcommand};
use dotenvy::from_path as dotenv_from_path;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config: {0}")]
    Config(#[from] agg_config::ConfigError),
    #[error("state: {0}")]
    State(#[from] agg_state::StateError),
    #[error("orchestrator: {0}")]
    Orchestrator(#[from] agg_orchestrator::OrchestratorError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not acquire lock on data directory {0}, another instance may be running")]
    Locked(PathBuf),
    #[error("a run failed to complete cleanly: {0} source error(s), {1} publish failure(s)")]
    RunFailed(u64, u64),
}

#[derive(Parser)]
#[command(name = "aggregator", version, about = "Telegram proxy-artifact harvesting and republishing")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one full ingest -> transform -> build -> publish -> export pass.
    Run {
        /// Path to the route/source YAML config.
        #[arg(long)]
        config: PathBuf,

        /// Root directory for raw blobs, artifacts, and dev outputs.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// SQLite state database path.
        #[arg(long, default_value = "data/state.db")]
        db_path: PathBuf,

        /// Hours a message is considered fresh on a source's first run.
        #[arg(long, default_value_t = 2)]
        msg_fresh_hours: u64,

        /// Hours a file is considered fresh on a source's first run.
        #[arg(long, default_value_t = 48)]
        file_fresh_hours: u64,

        /// Hours of message backlog to pull on subsequent runs.
        #[arg(long, default_value_t = 0)]
        msg_subsequent_hours: u64,

        /// Hours of file backlog to pull on subsequent runs.
        #[arg(long, default_value_t = 0)]
        file_subsequent_hours: u64,

        /// Build and export artifacts but skip the publish phase's network calls.
        #[arg(long, default_value_t = false)]
        no_deliver: bool,

        /// Bound on concurrent ingest workers and transform workers.
        #[arg(long, default_value_t = 4)]
        max_workers: usize,

        /// Abort in-flight phases after this many seconds; 0 means no timeout.
        #[arg(long, default_value_t = 0)]
        timeout_secs: u64,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the current route/source/publish state for operators, read-only.
    Inspect {
        /// SQLite state database path.
        #[arg(long, default_value = "data/state.db")]
        db_path: PathBuf,

        /// Path to the route/source YAML config.
        #[arg(long)]
        config: PathBuf,

        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .try_init();
}

fn load_dotenv() {
    let repo_env = PathBuf::from(".env");
    if repo_env.exists() {
        let _ = dotenv_from_path(&repo_env);
        eprintln!("loaded env from {}", repo_env.display());
    } else {
        eprintln!("no .env file found in CWD, continuing without one");
    }
}

/// Acquires an advisory exclusive lock on `<data_dir>/.aggregator.lock` so two
/// instances never write the same raw store / state db concurrently. The
/// returned guard's lifetime must outlive the run; dropping it releases the
/// lock.
fn acquire_data_dir_lock(data_dir: &Path) -> Result<fd_lock::RwLock<std::fs::File>, CliError> {
    std::fs::create_dir_all(data_dir)?;
    let lock_path = data_dir.join(".aggregator.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;
    Ok(fd_lock::RwLock::new(file))
}

async fn run() -> Result<(), CliError> {
    let args = Args::parse();
    match args.cmd {
        Command::Run {
            config,
            data_dir,
            db_path,
            msg_fresh_hours,
            file_fresh_hours,
            msg_subsequent_hours,
            file_subsequent_hours,
            no_deliver,
            max_workers,
            timeout_secs,
            verbose,
        } => {
            init_tracing(verbose);
            load_dotenv();

            let mut lock = acquire_data_dir_lock(&data_dir)?;
            let _guard = lock
                .try_write()
                .map_err(|_| CliError::Locked(data_dir.clone()))?;

            let root_config: RootConfig = agg_config::load_config(&config)?;

            // Concrete Telegram transports are out of scope for this
            // repository; a source with no registered connector is skipped
            // and counted as an ingest error by the orchestrator, mirroring
            // how an unsupported source type is handled upstream.
            let connectors: HashMap<String, Arc<dyn SourceConnector>> = HashMap::new();

            let publisher: Arc<dyn Publisher> = if no_deliver {
                Arc::new(RecordingPublisher::new())
            } else {
                let fallback_token = std::env::var("PUBLISH_BOT_TOKEN")
                    .ok()
                    .or_else(|| std::env::var("TELEGRAM_TOKEN").ok());
                Arc::new(TelegramPublisher::new(fallback_token))
            };

            let fetch_windows = FetchWindows {
                msg_fresh_hours,
                file_fresh_hours,
                msg_subsequent_hours,
                file_subsequent_hours,
            };

            let orchestrator = Orchestrator::new(
                root_config,
                data_dir,
                db_path,
                connectors,
                publisher,
                max_workers,
                fetch_windows,
            )?;

            let timeout = if timeout_secs == 0 { None } else { Some(Duration::from_secs(timeout_secs)) };
            let report = orchestrator.run(timeout).await;

            println!("{}", serde_json::to_string_pretty(&report_to_json(&report))?);

            if report.sources_err > 0 && report.sources_ok == 0 && !report.failed_routes.is_empty() {
                return Err(CliError::RunFailed(report.sources_err, report.publish_failures));
            }
            Ok(())
        }

        Command::Inspect { db_path, config, verbose } => {
            init_tracing(verbose);

            let root_config: RootConfig = agg_config::load_config(&config)?;
            let repo = StateRepo::open(&db_path)?;

            let mut sources = Vec::new();
            for source in &root_config.sources {
                let state = repo.get_source_state(&source.id)?;
                sources.push(serde_json::json!({
                    "id": source.id,
                    "state": state.map(|s| s.state),
                }));
            }

            let mut routes = Vec::new();
            for route in &root_config.publishing.routes {
                let mut last_published = Vec::new();
                for format in &route.formats {
                    let unique_id = format!("{}:{}", route.name, format);
                    let hash = repo.get_last_published_hash(&unique_id)?;
                    last_published.push(serde_json::json!({ "format": format, "last_hash": hash }));
                }
                routes.push(serde_json::json!({
                    "name": route.name,
                    "from_sources": route.from_sources,
                    "formats": last_published,
                }));
            }

            let report = serde_json::json!({ "sources": sources, "routes": routes });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn report_to_json(report: &agg_orchestrator::RunReport) -> serde_json::Value {
    serde_json::json!({
        "sources_ok": report.sources_ok,
        "sources_err": report.sources_err,
        "transform_processed": report.transform_processed,
        "transform_failed": report.transform_failed,
        "transform_ignored": report.transform_ignored,
        "total_artifacts": report.total_artifacts,
        "publish_attempts": report.publish_attempts,
        "publish_failures": report.publish_failures,
        "failed_routes": report.failed_routes,
        "dev_outputs_written": report.dev_outputs_written,
        "pruned_blobs": report.pruned_blobs,
        "pruned_archive": report.pruned_archive,
        "duration_seconds": report.duration_seconds,
    })
}
