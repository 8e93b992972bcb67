use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wellness_gateway::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Logging comes first so configuration errors are reported through it
    let (log_level, log_json) = match &config {
        Ok(config) => (config.log_level.as_str(), config.log_json),
        Err(_) => ("info", false),
    };
    init_tracing(log_level, log_json);

    info!(
        "Starting Wellness Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        ip_filter = config.ip_filter_enabled,
        rate_limit = config.rate_limit_enabled,
        fail_mode = %config.gate_fail_mode,
        upstream = config.upstream_url.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;

    // Seed the block list from BLOCKED_IPS
    if !config.blocked_ips.is_empty() {
        let added = state
            .ip_filter
            .seed(&config.blocked_ips, "configured")
            .await
            .map_err(|e| {
                error!("Failed to seed block list: {e}");
                exitcode::UNAVAILABLE
            })?;
        info!(added, "Block list seeded from BLOCKED_IPS");
        if added < config.blocked_ips.len() {
            warn!(
                skipped = config.blocked_ips.len() - added,
                "Some BLOCKED_IPS entries were invalid"
            );
        }
    }

    let app = build_router(state.clone()).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET    /health                - Health check");
    info!("  GET    /ready                 - Readiness check");
    if config.admin_enabled() {
        info!("  GET    /admin/blocklist       - List blocked addresses");
        info!("  POST   /admin/blocklist       - Block an address or range");
        info!("  DELETE /admin/blocklist       - Unblock an address or range");
        info!("  GET    /admin/security-events - Recent rejected requests");
        info!("  GET    /admin/quota           - Inspect a rate window");
        info!("  DELETE /admin/quota           - Reset a rate window");
    }

    // The gates need the peer address for client identity
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
