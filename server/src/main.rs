use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use runbridge_core::DuplicatePolicy;
use runbridge_core::Launcher;
use runbridge_core::RegistryConfig;
use runbridge_core::SessionRegistry;
use runbridge_server::AllowAll;
use runbridge_server::AppState;
use runbridge_server::ServerConfig;
use runbridge_server::build_router;
use tracing_subscriber::EnvFilter;

/// Interactive execution-session server: supervises long-running jobs and
/// streams their output to browser sessions.
#[derive(Debug, Parser)]
#[command(name = "runbridge-server")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8334")]
    bind: SocketAddr,

    /// Milliseconds between the graceful signal and the forced kill.
    #[arg(long, default_value_t = 2_000)]
    grace_period_ms: u64,

    /// Idle sessions with no reader are reaped after this many seconds.
    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Refuse a second execute on a live session id instead of superseding
    /// the running job.
    #[arg(long)]
    reject_duplicates: bool,

    /// Kill the job when its stream's client disconnects.
    #[arg(long)]
    kill_on_disconnect: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry_config = RegistryConfig {
        duplicate_policy: if cli.reject_duplicates {
            DuplicatePolicy::Reject
        } else {
            DuplicatePolicy::Supersede
        },
        queue_capacity: cli.queue_capacity,
        grace_period: Duration::from_millis(cli.grace_period_ms),
        idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
        ..RegistryConfig::default()
    };

    let registry = Arc::new(SessionRegistry::new(
        Launcher::subprocess(),
        registry_config,
    ));
    let reaper = registry.spawn_reaper();

    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        guard: Arc::new(AllowAll),
        config: ServerConfig {
            kill_on_disconnect: cli.kill_on_disconnect,
            ..ServerConfig::default()
        },
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    tracing::info!(bind = %cli.bind, "runbridge server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Teardown kills every live session before the process exits.
    reaper.abort();
    registry.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
