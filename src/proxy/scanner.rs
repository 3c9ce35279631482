//! TCP reachability scanning for candidate proxy ports

use std::collections::BTreeSet;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::error::{Result, ScoutError};
use crate::models::{format_tcp_addr, validate_port};

/// Ports commonly used by local proxy software
/// (SOCKS, Clash, V2Ray, generic HTTP, Tor, Squid).
pub const COMMON_PROXY_PORTS: &[u16] = &[
    1080, 1081, 1082, 1087, 7890, 7891, 7892, 10808, 10809, 8080, 8081, 8888, 5000, 5001, 5002,
    9050, 9150, 3128,
];

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Host whose ports are probed
    pub host: String,
    /// Maximum number of probes in flight
    pub workers: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            workers: 16,
        }
    }
}

/// Determines which ports accept a TCP connection
pub struct PortScanner {
    config: ScannerConfig,
}

impl PortScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Return the subset of `ports` that accepted a connection within
    /// `per_port_timeout`.
    ///
    /// Closed, filtered, and unreachable ports are simply absent from the
    /// result. The only error is a port outside `[1, 65535]`, which is
    /// rejected before anything is probed.
    #[instrument(skip(self, ports), fields(host = %self.config.host, count = ports.len()))]
    pub async fn scan(&self, ports: &[u32], per_port_timeout: Duration) -> Result<BTreeSet<u16>> {
        let ports = ports
            .iter()
            .map(|&p| validate_port(p))
            .collect::<Result<Vec<u16>>>()?;

        if per_port_timeout.is_zero() {
            return Err(ScoutError::InvalidArgument(
                "per-port timeout must be greater than zero".into(),
            ));
        }

        let worker_count = self.config.workers.max(1);

        let open = futures::stream::iter(ports)
            .map(|port| async move {
                let reachable = self.is_reachable(port, per_port_timeout).await;
                (port, reachable)
            })
            .buffer_unordered(worker_count)
            .filter_map(|(port, reachable)| async move { reachable.then_some(port) })
            .collect::<BTreeSet<u16>>()
            .await;

        info!("Scan complete: {} open port(s) {:?}", open.len(), open);
        Ok(open)
    }

    /// Probe a single port on the scanner host
    pub async fn is_reachable(&self, port: u16, per_port_timeout: Duration) -> bool {
        probe_port(&self.config.host, port, per_port_timeout).await
    }
}

/// True if `host:port` accepts a TCP connection within the timeout
pub async fn probe_port(host: &str, port: u16, per_port_timeout: Duration) -> bool {
    let addr = format_tcp_addr(host, port);
    match timeout(per_port_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => {
            debug!("Port {} open", addr);
            true
        }
        Ok(Err(e)) => {
            debug!("Port {} closed: {}", addr, e);
            false
        }
        Err(_) => {
            debug!("Port {} timed out", addr);
            false
        }
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new(ScannerConfig::default())
    }
}
