use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use feedmonitor::config::{load_applications, load_main_config, Configuration};
use feedmonitor::fetcher::Fetcher;
use feedmonitor::notifications::start_notification_engine;
use feedmonitor::store::bodies::BodyStoreCache;
use feedmonitor::store::results::{start_result_writer, ResultStore};
use feedmonitor::supervisor::Supervisor;
use feedmonitor::watcher::start_config_watcher;
use feedmonitor::web::{start_webserver, TemplateEngine, WebState};

const DATABASE_FILE: &str = "feedmon.db";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "feedmonitor",
    version,
    about = "Periodically fetches HTTP feeds, validates them, and records their history"
)]
struct Args {
    /// Path to the main configuration file.
    #[arg(short, long, default_value = "feedmon.yaml")]
    config: PathBuf,

    /// Minimum log level to output.
    #[arg(short, long, value_parser = ["debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// Development mode for the web tier: templates reload on each request.
    #[arg(short = 'w', long = "webdev")]
    webdev: bool,
}

fn init_logging(config: &Configuration) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if !config.log_file.is_empty() && !config.log_file.eq_ignore_ascii_case("console") {
        let path = Path::new(&config.log_file);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "feedmon.log".to_string());
        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match load_main_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Unable to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.web_dev_mode = args.webdev;

    let _log_guard = init_logging(&config);
    info!("FeedMonitor starting");

    let store = match ResultStore::open(Path::new(DATABASE_FILE)) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "error initializing the database");
            return ExitCode::FAILURE;
        }
    };
    let bodies = BodyStoreCache::new(&config.git_root);

    // Helper scope: web server, notification engine, result writer. It is
    // torn down only after the monitors, so in-flight fetches get to
    // enqueue their final results.
    let primary = CancellationToken::new();
    let helper = CancellationToken::new();

    let (results_tx, writer_handle) = start_result_writer(helper.clone(), store.clone());
    let (notifications_tx, engine_handle) =
        start_notification_engine(helper.clone(), store.clone());

    let fetcher = match Fetcher::new(bodies.clone(), results_tx, notifications_tx) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!(error = %e, "error building HTTP clients");
            return ExitCode::FAILURE;
        }
    };
    let supervisor = Arc::new(Supervisor::new(primary.clone(), fetcher));
    let config = Arc::new(config);

    let apps = load_applications(&config, &store).await;
    if apps.is_empty() {
        error!("no applications found, exiting");
        return ExitCode::FAILURE;
    }
    supervisor.install_all(apps).await;

    let templates = match TemplateEngine::new(config.web_dev_mode) {
        Ok(templates) => templates,
        Err(e) => {
            error!(error = %e, "error loading HTML templates");
            return ExitCode::FAILURE;
        }
    };
    let state = Arc::new(WebState {
        supervisor: supervisor.clone(),
        results: store.clone(),
        bodies,
        templates,
        web_root: config.web_root.clone(),
    });
    let web_handle = match start_webserver(helper.clone(), state, config.web_port).await {
        Ok((addr, handle)) => {
            info!(%addr, "webserver listening");
            handle
        }
        Err(e) => {
            error!(error = %e, port = config.web_port, "unable to start the webserver");
            return ExitCode::FAILURE;
        }
    };

    // Hot reload is best-effort: the service still runs without a watcher.
    let _watcher = match start_config_watcher(config.clone(), supervisor.clone(), store.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            error!(error = %e, "failed to start config directory watcher");
            None
        }
    };

    supervisor.start_all().await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("system interrupt received, shutting down"),
        Err(e) => error!(error = %e, "unable to listen for the shutdown signal"),
    }

    // Primary scope first: monitors stop initiating fetches, then the
    // helpers drain what was enqueued.
    supervisor.stop_all().await;
    primary.cancel();
    if supervisor.wait_monitors(SHUTDOWN_TIMEOUT).await {
        info!("application monitors shut down after timeout");
    } else {
        info!("application monitors shut down cleanly");
    }

    helper.cancel();
    if wait_helpers(vec![web_handle, engine_handle, writer_handle]).await {
        info!("helper tasks shut down after timeout");
    } else {
        info!("helper tasks shut down cleanly");
    }

    ExitCode::SUCCESS
}

/// Waits for the helper tasks, bounded by the shutdown timeout. Returns
/// true when the wait timed out.
async fn wait_helpers(handles: Vec<JoinHandle<()>>) -> bool {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
    for handle in handles {
        if tokio::time::timeout_at(deadline, handle).await.is_err() {
            return true;
        }
    }
    false
}
