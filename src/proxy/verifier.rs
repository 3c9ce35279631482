//! Proxy protocol verification
//!
//! An open port is only useful if something on it actually relays traffic.
//! Each candidate configuration gets exactly one GET to a trusted echo
//! endpoint; the first one answering 200 with a JSON body wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{Result, ScoutError};
use crate::models::{ProbeResult, ProxyCandidate, ProxyConfiguration, ProxyKind};
use crate::proxy::client::{Fetcher, Target};
use crate::proxy::scanner::probe_port;

/// Default echo endpoint
pub const DEFAULT_ECHO_URL: &str = "https://httpbin.org/ip";

/// Protocols tried on a bare port, in order
const PROTOCOL_ORDER: [ProxyKind; 2] = [ProxyKind::Http, ProxyKind::Socks5];

/// Body returned by the echo endpoint
#[derive(Debug, Deserialize)]
struct EchoBody {
    #[serde(default)]
    origin: Option<String>,
}

/// Verifies that open ports speak a working proxy protocol
pub struct Verifier {
    host: String,
    fetcher: Arc<dyn Fetcher>,
    reachability_timeout: Duration,
}

impl Verifier {
    /// `host` is where bare ports passed to [`Verifier::verify`] live
    pub fn new(
        host: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        reachability_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            fetcher,
            reachability_timeout,
        }
    }

    /// Try an HTTP forward proxy, then SOCKS5, on `port` of the scanner host.
    ///
    /// Takes at most one reachability probe plus `2 * timeout`. Nothing is
    /// retried here.
    #[instrument(skip(self, echo_url), fields(host = %self.host, echo = %echo_url))]
    pub async fn verify(&self, port: u32, echo_url: &Url, timeout: Duration) -> Result<ProbeResult> {
        let candidates = PROTOCOL_ORDER
            .iter()
            .map(|&kind| ProxyCandidate::new(self.host.as_str(), port, kind))
            .collect::<Result<Vec<_>>>()?;

        let mut results = self.verify_candidates(&candidates, echo_url, timeout).await?;
        results.pop().ok_or_else(|| {
            ScoutError::InvalidArgument("no candidate configurations to verify".into())
        })
    }

    /// Try caller-supplied candidates in order, stopping at the first that
    /// verifies. Returns one result per candidate tried; when any candidate
    /// verified, it is the last element.
    #[instrument(skip(self, candidates, echo_url), fields(count = candidates.len(), echo = %echo_url))]
    pub async fn verify_candidates(
        &self,
        candidates: &[ProxyCandidate],
        echo_url: &Url,
        timeout: Duration,
    ) -> Result<Vec<ProbeResult>> {
        Target::parse(echo_url)?;
        if timeout.is_zero() {
            return Err(ScoutError::InvalidArgument(
                "verification timeout must be greater than zero".into(),
            ));
        }

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let result = self.check_candidate(candidate, echo_url, timeout).await;
            let verified = result.verified;
            results.push(result);
            if verified {
                break;
            }
        }

        match results.iter().find(|r| r.verified) {
            Some(winner) => info!(
                "Verified {} proxy at {} (origin {})",
                winner.candidate.kind(),
                winner.candidate.address(),
                winner.observed_origin_ip.as_deref().unwrap_or("unknown")
            ),
            None => info!("No working proxy among {} candidate(s)", results.len()),
        }

        Ok(results)
    }

    /// Check a single candidate
    #[instrument(skip(self, echo_url), fields(proxy = %candidate))]
    async fn check_candidate(
        &self,
        candidate: &ProxyCandidate,
        echo_url: &Url,
        check_timeout: Duration,
    ) -> ProbeResult {
        let reachable =
            probe_port(candidate.host(), candidate.port(), self.reachability_timeout).await;

        if !reachable {
            debug!("Proxy {} is not reachable", candidate);
            return ProbeResult::unreachable(candidate.clone());
        }

        let proxy = ProxyConfiguration::Selected(candidate.clone());
        let start = Instant::now();

        match timeout(check_timeout, self.fetcher.get(echo_url, &proxy)).await {
            Ok(Ok(response)) if response.status == 200 => {
                match serde_json::from_slice::<EchoBody>(&response.body) {
                    Ok(echo) => {
                        let latency = start.elapsed();
                        debug!(
                            "Proxy {} verified in {}ms",
                            candidate,
                            latency.as_millis()
                        );
                        ProbeResult {
                            candidate: candidate.clone(),
                            reachable: true,
                            verified: true,
                            observed_origin_ip: echo.origin,
                            latency: Some(latency),
                        }
                    }
                    Err(e) => {
                        warn!("Proxy {} returned an unparseable echo body: {}", candidate, e);
                        ProbeResult::rejected(candidate.clone())
                    }
                }
            }
            Ok(Ok(response)) => {
                warn!("Proxy {} answered with status {}", candidate, response.status);
                ProbeResult::rejected(candidate.clone())
            }
            Ok(Err(e)) => {
                warn!("Proxy {} failed verification: {}", candidate, e);
                ProbeResult::rejected(candidate.clone())
            }
            Err(_) => {
                warn!("Proxy {} verification timed out", candidate);
                ProbeResult::rejected(candidate.clone())
            }
        }
    }
}
