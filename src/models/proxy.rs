use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, ScoutError};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }

    /// Parse a proxy URL scheme.
    ///
    /// `https` names an HTTP forward proxy reached over plain TCP, the way
    /// proxy environment variables use it. `socks5h` is accepted as SOCKS5:
    /// target hostnames are always resolved by the proxy.
    pub fn from_scheme(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Some(ProxyKind::Http),
            "socks5" | "socks5h" => Some(ProxyKind::Socks5),
            _ => None,
        }
    }

    /// Port assumed when a proxy URL omits one
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyKind::Http => 80,
            ProxyKind::Socks5 => 1080,
        }
    }

}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A host/port/protocol triple that may be running a forward proxy.
///
/// Fields are private so a candidate can only exist with a valid port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProxyCandidate {
    host: String,
    port: u16,
    kind: ProxyKind,
}

impl ProxyCandidate {
    /// Create a candidate, rejecting ports outside `[1, 65535]`
    pub fn new(host: impl Into<String>, port: u32, kind: ProxyKind) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ScoutError::InvalidArgument(
                "proxy host must not be empty".into(),
            ));
        }
        let port = validate_port(port)?;
        Ok(Self { host, port, kind })
    }

    /// Parse a proxy URL such as `socks5://127.0.0.1:5001`
    pub fn from_url(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| {
            ScoutError::InvalidArgument(format!("proxy '{}' must be a valid URL: {}", raw, e))
        })?;

        // Reject URLs that carry request-specific components.
        if url.fragment().is_some() || url.query().is_some() {
            return Err(ScoutError::InvalidArgument(format!(
                "proxy '{}' must not include query/fragment",
                raw
            )));
        }
        if !(url.path().is_empty() || url.path() == "/") {
            return Err(ScoutError::InvalidArgument(format!(
                "proxy '{}' must not include a path",
                raw
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ScoutError::InvalidArgument(format!(
                "proxy '{}' must not carry credentials",
                raw
            )));
        }

        let kind = ProxyKind::from_scheme(url.scheme()).ok_or_else(|| {
            ScoutError::InvalidArgument(format!(
                "proxy '{}' has unsupported scheme: {}",
                raw,
                url.scheme()
            ))
        })?;

        let host = url.host_str().ok_or_else(|| {
            ScoutError::InvalidArgument(format!("proxy '{}' must include a host", raw))
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        // `Url::port` hides a port equal to the scheme default (`https://h:443`).
        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| kind.default_port());

        Self::new(host, u32::from(port), kind)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        format_tcp_addr(&self.host, self.port)
    }

    /// Proxy URL, suitable for pasting into another tool's proxy setting
    pub fn url(&self) -> String {
        format!("{}://{}", self.kind.as_str(), self.address())
    }
}

impl std::fmt::Display for ProxyCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// The routing applied to outbound calls
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "mode", content = "proxy", rename_all = "lowercase")]
pub enum ProxyConfiguration {
    /// Direct connection
    #[default]
    None,
    Selected(ProxyCandidate),
}

impl ProxyConfiguration {
    pub fn candidate(&self) -> Option<&ProxyCandidate> {
        match self {
            ProxyConfiguration::None => None,
            ProxyConfiguration::Selected(candidate) => Some(candidate),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyConfiguration::None)
    }
}

impl std::fmt::Display for ProxyConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyConfiguration::None => write!(f, "direct"),
            ProxyConfiguration::Selected(candidate) => write!(f, "{}", candidate),
        }
    }
}

/// Outcome of verifying one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub candidate: ProxyCandidate,
    pub reachable: bool,
    pub verified: bool,
    pub observed_origin_ip: Option<String>,
    pub latency: Option<Duration>,
}

impl ProbeResult {
    pub fn unreachable(candidate: ProxyCandidate) -> Self {
        Self {
            candidate,
            reachable: false,
            verified: false,
            observed_origin_ip: None,
            latency: None,
        }
    }

    pub fn rejected(candidate: ProxyCandidate) -> Self {
        Self {
            candidate,
            reachable: true,
            verified: false,
            observed_origin_ip: None,
            latency: None,
        }
    }
}

/// Validate a port number given in a wider integer type
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ScoutError::InvalidArgument(format!(
            "port {} is outside [1, 65535]",
            port
        ))),
    }
}

pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
