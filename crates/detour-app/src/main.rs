//! Detour - local redirecting proxy.
//!
//! This is the main binary. It:
//! - Loads (or creates) the JSON config
//! - Starts the intercepting proxy and registers it as the system proxy
//! - Launches the guardian that reverts the system proxy after a crash
//! - Shuts everything down on Ctrl-C, SIGTERM, or guardian exit

mod guardian;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use detour_core::{
    ensure_config, LifecycleError, LifecycleState, ManualSystemProxy, PolicyConfig, ProxyLifecycle,
    RoutingPolicy, SystemProxy, DEFAULT_CONFIG_PATH,
};
use detour_proxy::HudsuckerEngine;
use detour_sysproxy::{current_system_proxy, OsSystemProxy};
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Detour - redirect selected domains to a local backend
#[derive(Parser, Debug)]
#[command(name = "detour", version, about)]
struct Args {
    /// Path to the JSON config file (created from a template if missing)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the guardian executable (defaults to detour-guardian next to this binary)
    #[arg(long)]
    guardian: Option<PathBuf>,

    /// Do not launch the guardian
    #[arg(long)]
    no_guardian: bool,

    /// Do not register as the OS system proxy
    #[arg(long)]
    no_system_proxy: bool,

    /// Skip the check for an already active system proxy
    #[arg(long)]
    skip_proxy_check: bool,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "detour", "Detour").map(|dirs| dirs.data_dir().join("logs"))
}

/// Default filter directive for the given level.
fn default_filter(level: &str) -> String {
    format!(
        "detour={0},detour_core={0},detour_proxy={0},detour_sysproxy={0},warn",
        level
    )
}

/// Initialize logging: console always, plus a daily rolling file when the
/// data directory is writable.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("detour")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Logs a fatal startup error and exits non-zero.
fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!("{}", message);
    std::process::exit(1);
}

/// Warns about an already active system proxy and waits for the operator.
async fn check_existing_proxy() {
    match current_system_proxy() {
        Ok(Some(proxy)) => {
            tracing::warn!(
                "Another system proxy is active ({}). Disable it, then press Enter to continue.",
                proxy
            );
            let _ = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line)
            })
            .await;
        }
        Ok(None) => tracing::debug!("No system proxy currently active"),
        Err(e) => tracing::debug!("Could not read current system proxy: {}", e),
    }
}

/// Loads the config, creating it from the template first if needed.
fn load_config(path: &std::path::Path) -> anyhow::Result<PolicyConfig> {
    if ensure_config(path)? {
        tracing::warn!(
            "Created {:?} from the bundled template. Edit destinationHost and destinationPort, then restart.",
            path
        );
    }
    Ok(PolicyConfig::load(path)?)
}

/// Resolves when Ctrl-C or (on Unix) SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Shuts the lifecycle down once `signal` resolves.
fn spawn_stopper<F>(lifecycle: Arc<ProxyLifecycle>, signal: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        signal.await;
        lifecycle.shutdown().await;
    })
}

fn launch_guardian(args: &Args, lifecycle: &Arc<ProxyLifecycle>) {
    let path = match &args.guardian {
        Some(path) => path.clone(),
        None => match guardian::default_guardian_path() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Guardian unavailable: {:#}", e);
                return;
            }
        },
    };

    match guardian::spawn(&path, std::process::id()) {
        Ok(child) => {
            tokio::spawn(guardian::watch(child, Arc::clone(lifecycle)));
        }
        Err(e) => {
            tracing::warn!(
                "Failed to launch guardian: {:#}. The system proxy will not be reverted if Detour crashes.",
                e
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Detour v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Args: {:?}", args);

    if !args.skip_proxy_check {
        check_existing_proxy().await;
    }

    let config = load_config(&args.config)
        .unwrap_or_else(|e| fatal(format!("Failed to load config {:?}: {:#}", args.config, e)));
    let policy = RoutingPolicy::new(config)
        .map(Arc::new)
        .unwrap_or_else(|e| fatal(format!("Invalid config: {}", e)));

    let engine = HudsuckerEngine::with_default_dir()
        .unwrap_or_else(|e| fatal(format!("Failed to prepare proxy engine: {}", e)));
    tracing::info!(
        "Trust {:?} on clients to allow HTTPS interception",
        engine.ca_cert_path()
    );

    let system_proxy: Arc<dyn SystemProxy> = if args.no_system_proxy {
        Arc::new(ManualSystemProxy)
    } else {
        Arc::new(OsSystemProxy::new())
    };

    let lifecycle = Arc::new(ProxyLifecycle::new(
        Arc::clone(&policy),
        Box::new(engine),
        system_proxy,
    ));

    // Listen for signals before binding, so an early Ctrl-C still reverts the
    // system proxy. shutdown() waits for an in-flight start() to finish.
    let stopper = spawn_stopper(Arc::clone(&lifecycle), shutdown_signal());

    let endpoint = match lifecycle.start().await {
        Ok(endpoint) => endpoint,
        Err(LifecycleError::InvalidState(LifecycleState::Stopped)) => {
            tracing::info!("Interrupted before the proxy started");
            return Ok(());
        }
        Err(e) => fatal(format!("Failed to start proxy: {}", e)),
    };

    tracing::info!(
        "Detour listening on {}, redirecting {} domain(s) to {}",
        endpoint,
        policy.config().redirect_domains().len(),
        policy.target().base_url()
    );

    if !args.no_guardian && lifecycle.state() == LifecycleState::Listening {
        launch_guardian(&args, &lifecycle);
    }

    if let Err(e) = stopper.await {
        tracing::error!("Signal task failed: {}", e);
        lifecycle.shutdown().await;
    }

    tracing::info!("Detour shutting down");
    Ok(())
}
