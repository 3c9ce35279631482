//! Proxy Scout - Entry Point
//!
//! Chooses a proxy (disabled, explicit, or discovered), reports the
//! recommended configuration, then smoke-tests the configured targets through
//! it. Ctrl+C or SIGTERM cancels whatever is in flight.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_scout::config::{Config, LogConfig};
use proxy_scout::models::{ProxyConfiguration, RequestResult};
use proxy_scout::proxy::{CancelHandle, Discovery, HttpClient, ProxyRegistry, RequestExecutor};

#[tokio::main]
async fn main() -> proxy_scout::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Proxy Scout");

    let client = Arc::new(HttpClient::new()?);
    let registry = ProxyRegistry::new();

    // Cancel in-flight work on shutdown
    let (cancel_handle, mut cancel) = CancelHandle::new();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        cancel_handle.cancel();
    });

    if !config.selection.use_proxy {
        info!("Proxy use disabled, connecting directly");
    } else if let Some(proxy) = &config.selection.proxy {
        info!("Using configured proxy {}", proxy);
        registry.select(ProxyConfiguration::Selected(proxy.clone()));
    } else {
        let discovery = Discovery::new(config.discovery(), client.clone());
        let mut discovery_cancel = cancel.clone();
        let report = tokio::select! {
            report = discovery.run(&registry) => report?,
            _ = CancelHandle::cancelled(&mut discovery_cancel) => {
                info!("Discovery cancelled");
                return Ok(());
            }
        };
        info!(
            "Discovery finished: {} open port(s), {} verification(s)",
            report.open_ports.len(),
            report.probes.len()
        );
        for probe in report.working() {
            info!(
                "Working proxy: {} (origin {}, {}ms)",
                probe.candidate.url(),
                probe.observed_origin_ip.as_deref().unwrap_or("unknown"),
                probe.latency.map(|l| l.as_millis()).unwrap_or_default()
            );
        }
    }

    match registry.current().candidate() {
        Some(candidate) => info!("Recommended proxy configuration: {}", candidate.url()),
        None => info!("Recommended proxy configuration: direct connection"),
    }

    let executor = RequestExecutor::new(client, config.retry_policy())
        .with_format(config.request.body_format);
    let total = config.request.targets.len();
    let mut succeeded = 0usize;

    for target in &config.request.targets {
        if *cancel.borrow() {
            break;
        }

        let report = executor
            .execute_current(
                target,
                &registry,
                config.request_timeout(),
                config.request.max_attempts,
                &mut cancel,
            )
            .await?;

        match &report.result {
            RequestResult::Ok(body) => {
                succeeded += 1;
                info!(
                    target = %target,
                    attempts = report.attempt_count(),
                    bytes = body.len(),
                    "Target succeeded"
                );
            }
            RequestResult::GivenUp(outcome) => {
                warn!(
                    target = %target,
                    attempts = report.attempt_count(),
                    exhausted_retries = report.exhausted_retries(),
                    "Target failed: {}",
                    outcome
                );
            }
        }
    }

    info!("Smoke test: {}/{} targets succeeded", succeeded, total);
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxy_scout={}", log.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
