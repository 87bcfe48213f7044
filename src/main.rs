use std::panic::PanicHookInfo;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use verify_worker::{
    app::{ComponentRegistry, build_router},
    config::Config,
    scheduler::spawn_sweep_daemon,
};

/// Upper bound on waiting for in-flight verification tasks at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(log_panic));

    let config = Config::from_env().context("failed to load configuration")?;
    let bind_addr = config.http_bind();
    // Telemetry (tracing subscriber included) is set up while building the registry.
    let registry = ComponentRegistry::build(config)
        .await
        .context("failed to build component registry")?;
    let queue = registry.queue().clone();
    let telemetry = registry.telemetry().clone();

    let config = registry.config();
    let sweep_daemon = config.sweep_enabled().then(|| {
        spawn_sweep_daemon(registry.engine().clone(), config.sweep_interval())
    });
    if sweep_daemon.is_none() {
        warn!("automatic verification sweeps disabled, use POST /admin/sweep");
    }

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(%bind_addr, "verify-worker listening");

    let served = axum::serve(listener, build_router(registry))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(error) = served {
        warn!(error = %error, "server exited with error");
    }

    if let Some(daemon) = sweep_daemon {
        daemon.abort();
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, queue.wait_idle()).await {
        Ok(()) => info!("verification queue drained"),
        Err(_) => warn!(
            pending = queue.pending(),
            "shutting down with verification tasks still pending"
        ),
    }
    telemetry.shutdown();

    Ok(())
}

fn log_panic(panic: &PanicHookInfo<'_>) {
    let payload = panic.payload();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    let thread = std::thread::current();
    let location = panic
        .location()
        .map(|location| format!("{}:{}:{}", location.file(), location.line(), location.column()));

    error!(
        thread = thread.name().unwrap_or("unnamed"),
        location = location.as_deref().unwrap_or("unknown"),
        message,
        "panic"
    );
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
