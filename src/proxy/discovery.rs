//! Scan, verify, select.
//!
//! Ties the scanner and verifier together and leaves the first working proxy
//! in the registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use url::Url;

use crate::error::Result;
use crate::models::{ProbeResult, ProxyCandidate, ProxyConfiguration};
use crate::proxy::client::Fetcher;
use crate::proxy::registry::ProxyRegistry;
use crate::proxy::scanner::{PortScanner, ScannerConfig, COMMON_PROXY_PORTS};
use crate::proxy::verifier::{Verifier, DEFAULT_ECHO_URL};

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Host to scan
    pub host: String,
    /// Ports to scan when no explicit candidates are given
    pub ports: Vec<u32>,
    /// Per-port TCP connect timeout, also used for the verifier's reachability probe
    pub scan_timeout: Duration,
    /// Concurrent scan probes
    pub scan_workers: usize,
    pub echo_url: Url,
    /// Per-configuration verification timeout
    pub verify_timeout: Duration,
    /// Explicit candidates; when non-empty, scanning is skipped
    pub candidates: Vec<ProxyCandidate>,
    /// Verify every open port or candidate instead of stopping at the first
    /// working one
    pub collect_all: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let scanner = ScannerConfig::default();
        Self {
            host: scanner.host,
            ports: COMMON_PROXY_PORTS.iter().map(|&p| u32::from(p)).collect(),
            scan_timeout: Duration::from_millis(500),
            scan_workers: scanner.workers,
            echo_url: Url::parse(DEFAULT_ECHO_URL).expect("default echo URL is valid"),
            verify_timeout: Duration::from_secs(3),
            candidates: Vec::new(),
            collect_all: false,
        }
    }
}

/// Outcome of a discovery run
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    /// Open ports found by the scan (empty when explicit candidates were used)
    pub open_ports: BTreeSet<u16>,
    /// Every verification result, in the order tried
    pub probes: Vec<ProbeResult>,
    /// The candidate promoted into the registry, if any
    pub selected: Option<ProxyCandidate>,
}

impl DiscoveryReport {
    /// Every verified probe, in the order tried
    pub fn working(&self) -> impl Iterator<Item = &ProbeResult> {
        self.probes.iter().filter(|p| p.verified)
    }
}

pub struct Discovery {
    config: DiscoveryConfig,
    scanner: PortScanner,
    verifier: Verifier,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let scanner = PortScanner::new(ScannerConfig {
            host: config.host.clone(),
            workers: config.scan_workers,
        });
        let verifier = Verifier::new(config.host.clone(), fetcher, config.scan_timeout);

        Self {
            config,
            scanner,
            verifier,
        }
    }

    /// Find a working proxy and select it in `registry`.
    ///
    /// Leaves the registry on a direct connection when nothing verifies.
    #[instrument(skip_all, fields(host = %self.config.host))]
    pub async fn run(&self, registry: &ProxyRegistry) -> Result<DiscoveryReport> {
        let (open_ports, probes) = if self.config.candidates.is_empty() {
            self.scan_and_verify().await?
        } else {
            info!(
                "Verifying {} configured candidate(s)",
                self.config.candidates.len()
            );
            (BTreeSet::new(), self.verify_listed().await?)
        };

        let selected = match probes.iter().find(|p| p.verified) {
            Some(winner) => {
                registry.promote(winner)?;
                info!("Recommended proxy: {}", winner.candidate.url());
                Some(winner.candidate.clone())
            }
            None => {
                warn!("No working proxy found, using a direct connection");
                registry.select(ProxyConfiguration::None);
                None
            }
        };

        Ok(DiscoveryReport {
            open_ports,
            probes,
            selected,
        })
    }

    /// Scan, then verify open ports in ascending order until one works (or
    /// all of them, with `collect_all`)
    async fn scan_and_verify(&self) -> Result<(BTreeSet<u16>, Vec<ProbeResult>)> {
        let open_ports = self
            .scanner
            .scan(&self.config.ports, self.config.scan_timeout)
            .await?;

        let mut probes = Vec::new();
        for &port in &open_ports {
            let probe = self
                .verifier
                .verify(
                    u32::from(port),
                    &self.config.echo_url,
                    self.config.verify_timeout,
                )
                .await?;
            let verified = probe.verified;
            probes.push(probe);
            if verified && !self.config.collect_all {
                break;
            }
        }

        Ok((open_ports, probes))
    }

    /// Verify the configured candidates in order
    async fn verify_listed(&self) -> Result<Vec<ProbeResult>> {
        let echo_url = &self.config.echo_url;
        let timeout = self.config.verify_timeout;

        if !self.config.collect_all {
            return self
                .verifier
                .verify_candidates(&self.config.candidates, echo_url, timeout)
                .await;
        }

        let mut probes = Vec::with_capacity(self.config.candidates.len());
        for candidate in &self.config.candidates {
            let results = self
                .verifier
                .verify_candidates(std::slice::from_ref(candidate), echo_url, timeout)
                .await?;
            probes.extend(results);
        }
        Ok(probes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyKind;
    use crate::proxy::client::HttpClient;
    use crate::test_support::{closed_port, spawn_http_server, spawn_socks5_server, CannedResponse};

    fn config(ports: Vec<u32>) -> DiscoveryConfig {
        DiscoveryConfig {
            ports,
            echo_url: Url::parse("http://echo.test/ip").unwrap(),
            verify_timeout: Duration::from_secs(2),
            ..DiscoveryConfig::default()
        }
    }

    fn discovery(config: DiscoveryConfig) -> Discovery {
        Discovery::new(config, Arc::new(HttpClient::new().unwrap()))
    }

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.ports.len(), COMMON_PROXY_PORTS.len());
        assert_eq!(config.echo_url.as_str(), DEFAULT_ECHO_URL);
        assert!(config.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_discovers_and_selects_http_proxy() {
        let dead = closed_port().await;
        let proxy = spawn_http_server(vec![CannedResponse::json(200, r#"{"origin": "1.2.3.4"}"#)]).await;
        let port = proxy.addr.port();

        let registry = ProxyRegistry::new();
        let report = discovery(config(vec![u32::from(dead), u32::from(port)]))
            .run(&registry)
            .await
            .unwrap();

        assert_eq!(report.open_ports, BTreeSet::from([port]));
        assert_eq!(report.probes.len(), 1);
        let selected = report.selected.unwrap();
        assert_eq!(selected.kind(), ProxyKind::Http);
        assert_eq!(selected.port(), port);
        assert_eq!(
            *registry.current(),
            ProxyConfiguration::Selected(selected)
        );
    }

    #[tokio::test]
    async fn test_stops_at_lowest_working_port() {
        let a = spawn_http_server(vec![CannedResponse::json(200, r#"{"origin": "1.1.1.1"}"#)]).await;
        let b = spawn_http_server(vec![CannedResponse::json(200, r#"{"origin": "2.2.2.2"}"#)]).await;
        let (low, high) = if a.addr.port() < b.addr.port() { (&a, &b) } else { (&b, &a) };

        let registry = ProxyRegistry::new();
        let report = discovery(config(vec![
            u32::from(high.addr.port()),
            u32::from(low.addr.port()),
        ]))
        .run(&registry)
        .await
        .unwrap();

        assert_eq!(report.open_ports.len(), 2);
        assert_eq!(report.selected.map(|c| c.port()), Some(low.addr.port()));
        assert!(high.requests().is_empty());
    }

    #[tokio::test]
    async fn test_collect_all_lists_every_working_port() {
        let a = spawn_http_server(vec![CannedResponse::json(200, r#"{"origin": "1.1.1.1"}"#)]).await;
        let b = spawn_socks5_server(vec![CannedResponse::json(200, r#"{"origin": "2.2.2.2"}"#)]).await;
        let dead = closed_port().await;
        let low = a.addr.port().min(b.addr.port());

        let mut cfg = config(vec![
            u32::from(a.addr.port()),
            u32::from(dead),
            u32::from(b.addr.port()),
        ]);
        cfg.collect_all = true;

        let registry = ProxyRegistry::new();
        let report = discovery(cfg).run(&registry).await.unwrap();

        let working: Vec<_> = report.working().map(|p| p.candidate.clone()).collect();
        assert_eq!(working.len(), 2);
        assert_eq!(working[0].port(), low);
        assert!(working.iter().any(|c| c.port() == a.addr.port() && c.kind() == ProxyKind::Http));
        assert!(working.iter().any(|c| c.port() == b.addr.port() && c.kind() == ProxyKind::Socks5));
        assert_eq!(a.requests().len(), 1);
        assert_eq!(b.requests().len(), 1);

        assert_eq!(report.selected.as_ref().map(|c| c.port()), Some(low));
        assert_eq!(registry.current().candidate().map(|c| c.port()), Some(low));
    }

    #[tokio::test]
    async fn test_collect_all_with_explicit_candidates() {
        let first = spawn_http_server(vec![CannedResponse::json(200, r#"{"origin": "1.1.1.1"}"#)]).await;
        let second = spawn_socks5_server(vec![CannedResponse::json(200, r#"{"origin": "2.2.2.2"}"#)]).await;

        let mut cfg = config(Vec::new());
        cfg.collect_all = true;
        cfg.candidates = vec![
            ProxyCandidate::from_url(&format!("http://127.0.0.1:{}", first.addr.port())).unwrap(),
            ProxyCandidate::from_url(&format!("socks5://127.0.0.1:{}", second.addr.port())).unwrap(),
        ];

        let registry = ProxyRegistry::new();
        let report = discovery(cfg).run(&registry).await.unwrap();

        assert_eq!(report.working().count(), 2);
        assert_eq!(
            report.selected.map(|c| c.port()),
            Some(first.addr.port())
        );
    }

    #[tokio::test]
    async fn test_nothing_verified_leaves_direct() {
        let server = spawn_http_server(vec![CannedResponse::text(200, "<html>router login</html>")]).await;
        let candidate = ProxyCandidate::new("127.0.0.1", 7890, ProxyKind::Http).unwrap();
        let registry = ProxyRegistry::with_configuration(ProxyConfiguration::Selected(candidate));

        let report = discovery(config(vec![u32::from(server.addr.port())]))
            .run(&registry)
            .await
            .unwrap();

        assert!(report.selected.is_none());
        assert_eq!(report.probes.len(), 1);
        assert!(report.probes[0].reachable);
        assert!(registry.current().is_direct());
    }

    #[tokio::test]
    async fn test_explicit_candidates_skip_scan() {
        let dead = closed_port().await;
        let socks = spawn_socks5_server(vec![CannedResponse::json(200, r#"{"origin": "5.6.7.8"}"#)]).await;

        let mut cfg = config(Vec::new());
        cfg.candidates = vec![
            ProxyCandidate::from_url(&format!("http://127.0.0.1:{}", dead)).unwrap(),
            ProxyCandidate::from_url(&format!("socks5://127.0.0.1:{}", socks.addr.port())).unwrap(),
        ];

        let registry = ProxyRegistry::new();
        let report = discovery(cfg).run(&registry).await.unwrap();

        assert!(report.open_ports.is_empty());
        assert_eq!(report.probes.len(), 2);
        assert_eq!(
            report.selected.as_ref().map(|c| c.kind()),
            Some(ProxyKind::Socks5)
        );
        assert_eq!(report.probes[1].observed_origin_ip.as_deref(), Some("5.6.7.8"));
        assert!(!registry.current().is_direct());
    }

    #[tokio::test]
    async fn test_invalid_port_fails_run() {
        let registry = ProxyRegistry::new();
        let result = discovery(config(vec![0])).run(&registry).await;
        assert!(result.is_err());
        assert!(registry.current().is_direct());
    }
}
