//! Visa Booking Bot
//!
//! Single-binary service that:
//! 1. Loads a pool of booking accounts and the outstanding work
//! 2. Runs booking sessions in an unattended control loop behind a circuit breaker
//! 3. Serves health, metrics and operator endpoints on a separate listener
//! 4. Shuts down on SIGINT/SIGTERM, letting the in-flight iteration drain

mod adapters;
mod admin;
mod alert;
mod config;
mod control;
mod error;
mod health;
mod metrics;
mod schedule;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use account_pool::{AccountPool, MemoryRepository};
use anyhow::{Context, Result};
use circuit_breaker::CircuitBreaker;
use session::SessionOrchestrator;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::adapters::{CommandProcessor, DirWorkerFactory, JsonWorkStore};
use crate::admin::{AdminState, AuthLimit, build_admin_router};
use crate::alert::LogAlerter;
use crate::config::Config;
use crate::control::{BotLoopManager, LoopSignals};
use crate::health::RateLimiterHealth;
use crate::schedule::PeakHoursPolicy;

/// How long the in-flight iteration and admin requests get after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Name the breaker reports in logs, metrics and the admin API.
const BREAKER_NAME: &str = "booking-site";

/// Value of `--config <path>`, if given.
fn config_arg(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting visa-booking-bot");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let config_path = Config::resolve_path(config_arg(&args));
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        accounts_file = %config.pool.accounts_file.display(),
        work_file = %config.session.work_file.display(),
        max_concurrent_missions = config.session.max_concurrent_missions,
        admin_addr = %config.admin.listen_addr,
        admin_enabled = config.admin.token.is_some(),
        redis = config.rate_limit.redis_url.is_some(),
        "configuration loaded"
    );

    let limiter = rate_limit::connect(config.rate_limit.redis_url.as_ref()).await;

    let repository = MemoryRepository::load(&config.pool.accounts_file)
        .await
        .with_context(|| {
            format!(
                "failed to load accounts from {}",
                config.pool.accounts_file.display()
            )
        })?;
    let pool = Arc::new(AccountPool::new(Arc::new(repository), config.pool_config()));

    let processor = CommandProcessor::new(
        &config.session.processor_command,
        Duration::from_secs(config.session.processor_timeout_secs),
    )
    .context("invalid processor command")?;
    let orchestrator = Arc::new(SessionOrchestrator::new(
        Arc::clone(&pool),
        Arc::new(JsonWorkStore::new(
            &config.session.work_file,
            &config.session.usage_log,
        )),
        Arc::new(DirWorkerFactory::new(&config.session.worker_root)),
        Arc::new(processor),
        config.orchestrator_config(),
    ));

    let breaker = Arc::new(CircuitBreaker::new(BREAKER_NAME, config.breaker_config()));
    let signals = LoopSignals::new();
    let scheduler = Arc::new(PeakHoursPolicy::new(
        Duration::from_secs(config.control.base_interval_secs),
        Duration::from_secs(config.control.peak_interval_secs),
        config.control.peak_hours.iter().copied(),
    ));

    let manager = BotLoopManager::new(
        Arc::clone(&breaker),
        orchestrator,
        scheduler,
        Arc::new(LogAlerter),
        signals.clone(),
        config.loop_config(),
    )
    .with_health_check(Arc::new(RateLimiterHealth::new(Arc::clone(&limiter))));

    let auth_window = Duration::from_secs(config.admin.auth_window_secs);
    let cleanup_handle = rate_limit::spawn_cleanup_task(
        Arc::clone(&limiter),
        Duration::from_secs(config.rate_limit.cleanup_interval_secs),
        auth_window,
    );

    let admin_state = AdminState::new(
        pool,
        breaker,
        signals.clone(),
        limiter,
        config.admin.token.as_ref(),
        AuthLimit {
            max_attempts: config.admin.auth_max_attempts,
            window: auth_window,
        },
        prometheus_handle,
    );
    let app = build_admin_router(admin_state, config.admin.max_connections);
    let listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.admin.listen_addr))?;
    info!(addr = %config.admin.listen_addr, "admin API listening");

    let server_shutdown = signals.shutdown_token().clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(server_shutdown.cancelled_owned())
        .await
    });

    let loop_handle = tokio::spawn(async move { manager.run().await });

    shutdown_signal().await;
    signals.request_shutdown();

    // The drain timer starts at signal receipt
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        match loop_handle.await {
            Ok(()) => info!("control loop drained"),
            Err(e) => error!(error = %e, "control loop task panicked"),
        }
        match server_handle.await {
            Ok(Ok(())) => info!("admin API stopped"),
            Ok(Err(e)) => error!(error = %e, "admin API error during shutdown"),
            Err(e) => error!(error = %e, "admin API task panicked"),
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        );
    }

    cleanup_handle.abort();
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_flag_parsed() {
        let a = args(&["visa-booking-bot", "--config", "/etc/bot.toml"]);
        assert_eq!(config_arg(&a), Some("/etc/bot.toml"));
    }

    #[test]
    fn config_flag_absent_or_dangling() {
        assert_eq!(config_arg(&args(&["visa-booking-bot"])), None);
        assert_eq!(config_arg(&args(&["visa-booking-bot", "--config"])), None);
    }
}
