mod buffer_pool;
mod config;
mod connection;
mod control;
mod inbound;
mod listener;
mod pool;
mod protocol;
mod relay;
mod selector;
mod session;
mod upstream;

use crate::config::{BackendSpec, BalancerConfig, Cli};
use crate::connection::SessionTracker;
use crate::control::{ControlServer, ControlState};
use crate::listener::Listener;
use crate::pool::{BackendPool, SharedPool};
use crate::session::{SessionContext, SessionSettings};
use crate::upstream::UpstreamConnector;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// How often the drain loop reports remaining sessions
const DRAIN_LOG_EVERY: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sbal=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = BalancerConfig::from_cli(args)?;

    let pool = Arc::new(SharedPool::new(BackendPool::new(
        config
            .backends
            .iter()
            .cloned()
            .map(BackendSpec::into_backend)
            .collect(),
    )));
    log_pool(&pool.current());

    let tracker = Arc::new(SessionTracker::new(config.max_sessions));
    let ctx = Arc::new(SessionContext {
        pool: Arc::clone(&pool),
        connector: UpstreamConnector::new(config.upstream),
        settings: SessionSettings {
            handshake_timeout: config.handshake_timeout,
            idle_timeout: config.idle_timeout,
            connect_attempts: config.connect_attempts,
            ..SessionSettings::default()
        },
    });

    let control = ControlServer::bind(
        config.metrics_addr,
        ControlState::new(Arc::clone(&pool), Arc::clone(&tracker), config.listen_addr.port()),
    )
    .await
    .wrap_err_with(|| format!("failed to bind control surface on {}", config.metrics_addr))?;
    tokio::spawn(control.serve());

    if let Some(interval) = config.status_interval {
        tokio::spawn(log_status(Arc::clone(&pool), Arc::clone(&tracker), interval));
    }

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(config.backends_path.clone(), Arc::clone(&pool)));

    let listener = Listener::bind(config.listen_addr, ctx, Arc::clone(&tracker))
        .await
        .wrap_err_with(|| format!("failed to bind SOCKS5 listener on {}", config.listen_addr))?;

    // Dropping the accept future closes the listening socket
    tokio::select! {
        _ = listener.serve() => {
            warn!("Accept loop terminated");
        }
        res = signal::ctrl_c() => {
            res.wrap_err("failed to install CTRL+C handler")?;
            info!("Shutdown signal received, no longer accepting connections");
        }
    }

    drain(&tracker, config.drain_timeout).await;
    info!("Server shutdown complete");
    Ok(())
}

fn log_pool(pool: &BackendPool) {
    info!("Backend pool: {} backends, {} enabled", pool.len(), pool.enabled_count());
    for backend in pool.backends() {
        info!(
            "Backend {} at {}:{}{}{}",
            backend.id(),
            backend.host(),
            backend.port(),
            if backend.credentials().is_some() { " (auth)" } else { "" },
            if backend.is_enabled() { "" } else { " [disabled]" }
        );
    }
    if pool.enabled_count() == 0 {
        warn!("No backend is enabled; every CONNECT will be answered with a failure reply");
    }
}

/// Re-read the backend file on every SIGHUP. Running sessions keep the
/// generation they started with.
#[cfg(unix)]
async fn reload_on_hangup(path: std::path::PathBuf, pool: Arc<SharedPool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to install SIGHUP handler, pool reload disabled: {}", e);
            return;
        }
    };

    while hangups.recv().await.is_some() {
        info!("SIGHUP received, reloading {}", path.display());
        match config::reload_pool(&path, &pool) {
            Ok(next) => log_pool(&next),
            Err(e) => warn!("Pool reload failed, keeping current backends: {:#}", e),
        }
    }
}

/// Wait for in-flight sessions to finish, up to `limit`.
async fn drain(tracker: &SessionTracker, limit: Duration) {
    let active = tracker.active();
    if active == 0 {
        return;
    }
    info!("Waiting for {} sessions to close...", active);

    let secs = limit.as_secs();
    for i in 1..=secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = tracker.active();

        if remaining == 0 {
            info!("All sessions closed gracefully");
            return;
        }

        if i % DRAIN_LOG_EVERY == 0 {
            info!("Still waiting for {} sessions... ({}/{}s)", remaining, i, secs);
        }
    }

    let final_count = tracker.active();
    if final_count > 0 {
        warn!("Forced shutdown with {} sessions still active", final_count);
    }
}

/// Periodic one-line-per-backend counter dump
async fn log_status(pool: Arc<SharedPool>, tracker: Arc<SessionTracker>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;

        let pool = pool.current();
        let sessions = tracker.active();
        info!(
            "Status - sessions: {}/{}, uptime: {}s",
            sessions,
            tracker.limit(),
            pool.uptime().as_secs()
        );
        for backend in pool.backends() {
            let stats = backend.stats();
            info!(
                "  {}: {} active / {} total / {} failed",
                backend.id(),
                stats.active_connections,
                stats.total_connections,
                stats.failed_connections
            );
        }

        if tracker.is_above_high_water() {
            warn!(
                "High session load: {} of {} slots in use",
                sessions,
                tracker.limit()
            );
        }
    }
}
