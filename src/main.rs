//! slopoverlord CLI entry point: one long-running orchestration process.

use clap::Parser;
use slopoverlord::api::{start_http_server, ApiState};
use slopoverlord::config::{self, ConfigHandle, StorageBackend};
use slopoverlord::persist::{Backend, MemoryBackend, SqliteBackend};
use slopoverlord::Runtime;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "slopoverlord", version)]
#[command(about = "Multi-agent orchestration runtime")]
struct Cli {
    /// Path to the config file. Defaults to `<workspaceRoot>/slopoverlord.json`,
    /// falling back to `slopoverlord.config.json` in the current directory.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

/// Logs go to stderr and to a daily-rolled file under the workspace. The
/// returned guard must stay alive for the process lifetime.
fn init_tracing(debug: bool, workspace_root: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let default_filter = if debug {
        "slopoverlord=debug,info"
    } else {
        "slopoverlord=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let file_appender =
        tracing_appender::rolling::daily(workspace_root.join("logs"), "slopoverlord.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = config::resolve_config_path(cli.config.as_deref());
    let runtime_config = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("fatal: {error}");
            std::process::exit(2);
        }
    };

    if let Err(error) = std::fs::create_dir_all(&runtime_config.workspace_root) {
        eprintln!(
            "fatal: cannot create workspace root {}: {error}",
            runtime_config.workspace_root.display()
        );
        std::process::exit(2);
    }

    let _log_guard = init_tracing(cli.debug, &runtime_config.workspace_root);

    let bind = runtime_config.bind;
    let backend: Arc<dyn Backend> = match runtime_config.storage.backend {
        StorageBackend::Sqlite => {
            let path = runtime_config.sqlite_path();
            match SqliteBackend::connect(&path).await {
                Ok(backend) => backend,
                Err(error) => {
                    eprintln!("fatal: cannot open database {}: {error}", path.display());
                    std::process::exit(2);
                }
            }
        }
        StorageBackend::Memory => MemoryBackend::new(),
    };

    let config_handle = ConfigHandle::new(runtime_config);
    let runtime = Runtime::assemble(config_handle, backend);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = match start_http_server(bind, ApiState::new(runtime), shutdown_rx).await {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("fatal: {error}");
            std::process::exit(1);
        }
    };

    tracing::info!("slopoverlord running; ctrl-c to stop");
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = server.await;
}
