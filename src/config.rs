use crate::error::{Result, ScoutError};
use crate::models::{validate_port, ProxyCandidate};
use crate::proxy::discovery::DiscoveryConfig;
use crate::proxy::executor::{BodyFormat, RetryPolicy};
use crate::proxy::scanner::COMMON_PROXY_PORTS;
use crate::proxy::verifier::DEFAULT_ECHO_URL;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Endpoints called by the post-selection smoke test
pub const DEFAULT_TARGETS: &[&str] = &[
    "https://official-joke-api.appspot.com/random_joke",
    "https://randomuser.me/api/",
    "https://catfact.ninja/fact",
];

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Port scan configuration
    pub scan: ScanConfig,
    /// Proxy verification configuration
    pub verify: VerifyConfig,
    /// How the active proxy is chosen
    pub selection: SelectionConfig,
    /// Request execution configuration
    pub request: RequestConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Host whose ports are scanned (default: 127.0.0.1)
    pub host: String,
    /// Candidate ports, already range-checked
    pub ports: Vec<u32>,
    /// Per-port connect timeout in milliseconds
    pub timeout_ms: u64,
    /// Concurrent probes
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Echo endpoint returning `{"origin": "..."}`
    pub echo_url: Url,
    /// Per-protocol timeout in seconds
    pub timeout: u64,
}

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// `false` forces a direct connection
    pub use_proxy: bool,
    /// Explicit proxy; skips discovery
    pub proxy: Option<ProxyCandidate>,
    /// Candidates verified in order instead of scanning
    pub candidates: Vec<ProxyCandidate>,
    /// Verify every open port instead of stopping at the first working one
    pub collect_all: bool,
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Per-attempt timeout in seconds
    pub timeout: u64,
    /// Attempt budget per request
    pub max_attempts: u32,
    /// Linear backoff unit in milliseconds
    pub backoff_base_ms: u64,
    /// Extra wait after a 429, in milliseconds
    pub rate_limit_cooldown_ms: u64,
    /// What a 2xx body must parse as
    pub body_format: BodyFormat,
    /// Smoke-test URLs
    pub targets: Vec<Url>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            scan: ScanConfig {
                host: get_env_or("SCOUT_HOST", "127.0.0.1"),
                ports: parse_ports()?,
                timeout_ms: parse_env("SCOUT_SCAN_TIMEOUT_MS", "500")?,
                workers: parse_env("SCOUT_SCAN_WORKERS", "16")?,
            },
            verify: VerifyConfig {
                echo_url: parse_http_url("SCOUT_ECHO_URL", &get_env_or("SCOUT_ECHO_URL", DEFAULT_ECHO_URL))?,
                timeout: parse_env("SCOUT_VERIFY_TIMEOUT", "3")?,
            },
            selection: SelectionConfig {
                use_proxy: parse_env("SCOUT_USE_PROXY", "true")?,
                proxy: parse_proxy()?,
                candidates: parse_candidates()?,
                collect_all: parse_env("SCOUT_COLLECT_ALL", "false")?,
            },
            request: RequestConfig {
                timeout: parse_env("SCOUT_REQUEST_TIMEOUT", "10")?,
                max_attempts: parse_env("SCOUT_MAX_ATTEMPTS", "3")?,
                backoff_base_ms: parse_env("SCOUT_BACKOFF_BASE_MS", "1000")?,
                rate_limit_cooldown_ms: parse_env("SCOUT_RATE_LIMIT_COOLDOWN_MS", "5000")?,
                body_format: parse_env("SCOUT_BODY_FORMAT", "json")?,
                targets: parse_targets()?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("SCOUT_SCAN_TIMEOUT_MS", self.scan.timeout_ms),
            ("SCOUT_VERIFY_TIMEOUT", self.verify.timeout),
            ("SCOUT_REQUEST_TIMEOUT", self.request.timeout),
            ("SCOUT_BACKOFF_BASE_MS", self.request.backoff_base_ms),
            ("SCOUT_MAX_ATTEMPTS", u64::from(self.request.max_attempts)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ScoutError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    key
                )));
            }
        }
        if self.scan.workers == 0 {
            return Err(ScoutError::InvalidConfig(
                "SCOUT_SCAN_WORKERS must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Settings for the scan-and-verify workflow
    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            host: self.scan.host.clone(),
            ports: self.scan.ports.clone(),
            scan_timeout: Duration::from_millis(self.scan.timeout_ms),
            scan_workers: self.scan.workers,
            echo_url: self.verify.echo_url.clone(),
            verify_timeout: Duration::from_secs(self.verify.timeout),
            candidates: self.selection.candidates.clone(),
            collect_all: self.selection.collect_all,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.request.backoff_base_ms),
            rate_limit_cooldown: Duration::from_millis(self.request.rate_limit_cooldown_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request.timeout)
    }
}

fn parse_ports() -> Result<Vec<u32>> {
    let raw = env::var("SCOUT_PORTS").unwrap_or_default();
    if raw.trim().is_empty() {
        return Ok(COMMON_PROXY_PORTS.iter().map(|&p| u32::from(p)).collect());
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let port: u32 = s.parse().map_err(|_| {
                ScoutError::InvalidConfig(format!("SCOUT_PORTS entry '{}' is not a number", s))
            })?;
            validate_port(port)
                .map_err(|_| ScoutError::InvalidConfig(format!("SCOUT_PORTS entry {} is out of range", port)))?;
            Ok(port)
        })
        .collect()
}

fn parse_proxy() -> Result<Option<ProxyCandidate>> {
    let raw = env::var("SCOUT_PROXY").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    ProxyCandidate::from_url(raw)
        .map(Some)
        .map_err(|e| ScoutError::InvalidConfig(format!("SCOUT_PROXY: {}", e)))
}

fn parse_candidates() -> Result<Vec<ProxyCandidate>> {
    env::var("SCOUT_CANDIDATES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            ProxyCandidate::from_url(s)
                .map_err(|e| ScoutError::InvalidConfig(format!("SCOUT_CANDIDATES: {}", e)))
        })
        .collect()
}

fn parse_targets() -> Result<Vec<Url>> {
    let raw = env::var("SCOUT_TARGETS").unwrap_or_default();
    if raw.trim().is_empty() {
        return DEFAULT_TARGETS
            .iter()
            .map(|t| parse_http_url("SCOUT_TARGETS", t))
            .collect();
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_http_url("SCOUT_TARGETS", s))
        .collect()
}

fn parse_http_url(key: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ScoutError::InvalidConfig(format!("{} must be a valid URL: {}", key, e)))?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ScoutError::InvalidConfig(format!(
            "{} must be an http(s) URL with a host: {}",
            key, raw
        )));
    }
    Ok(url)
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim()
        .parse()
        .map_err(|_| ScoutError::InvalidConfig(format!("{} has an invalid value: {}", key, raw)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyKind;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "SCOUT_HOST",
        "SCOUT_PORTS",
        "SCOUT_SCAN_TIMEOUT_MS",
        "SCOUT_SCAN_WORKERS",
        "SCOUT_ECHO_URL",
        "SCOUT_VERIFY_TIMEOUT",
        "SCOUT_USE_PROXY",
        "SCOUT_PROXY",
        "SCOUT_CANDIDATES",
        "SCOUT_COLLECT_ALL",
        "SCOUT_REQUEST_TIMEOUT",
        "SCOUT_MAX_ATTEMPTS",
        "SCOUT_BACKOFF_BASE_MS",
        "SCOUT_RATE_LIMIT_COOLDOWN_MS",
        "SCOUT_BODY_FORMAT",
        "SCOUT_TARGETS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.scan.host, "127.0.0.1");
        assert_eq!(config.scan.ports.len(), COMMON_PROXY_PORTS.len());
        assert_eq!(config.scan.timeout_ms, 500);
        assert_eq!(config.scan.workers, 16);

        assert_eq!(config.verify.echo_url.as_str(), DEFAULT_ECHO_URL);
        assert_eq!(config.verify.timeout, 3);

        assert!(config.selection.use_proxy);
        assert!(config.selection.proxy.is_none());
        assert!(config.selection.candidates.is_empty());
        assert!(!config.selection.collect_all);

        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.request.max_attempts, 3);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                base_delay: Duration::from_secs(1),
                rate_limit_cooldown: Duration::from_secs(5),
            }
        );
        assert_eq!(config.request.body_format, BodyFormat::Json);
        assert_eq!(config.request.targets.len(), DEFAULT_TARGETS.len());

        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SCOUT_HOST", "192.168.1.10");
        env::set_var("SCOUT_PORTS", "1080, 7890,10808");
        env::set_var("SCOUT_USE_PROXY", "false");
        env::set_var("SCOUT_PROXY", "socks5h://127.0.0.1:5001");
        env::set_var("SCOUT_CANDIDATES", "http://127.0.0.1:5000,socks5://127.0.0.1:5001");
        env::set_var("SCOUT_MAX_ATTEMPTS", "5");
        env::set_var("SCOUT_COLLECT_ALL", "true");
        env::set_var("SCOUT_TARGETS", "https://catfact.ninja/fact");
        env::set_var("SCOUT_BODY_FORMAT", "Text");
        env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.scan.ports, vec![1080, 7890, 10808]);
        assert!(!config.selection.use_proxy);
        let proxy = config.selection.proxy.clone().unwrap();
        assert_eq!(proxy.kind(), ProxyKind::Socks5);
        assert_eq!(proxy.port(), 5001);
        assert_eq!(
            config
                .selection
                .candidates
                .iter()
                .map(|c| c.kind())
                .collect::<Vec<_>>(),
            vec![ProxyKind::Http, ProxyKind::Socks5]
        );
        assert_eq!(config.request.max_attempts, 5);
        assert_eq!(config.request.targets.len(), 1);
        assert_eq!(config.request.body_format, BodyFormat::Text);
        assert_eq!(config.log.format, "json");

        let discovery = config.discovery();
        assert_eq!(discovery.host, "192.168.1.10");
        assert_eq!(discovery.candidates.len(), 2);
        assert!(discovery.collect_all);
        assert_eq!(discovery.verify_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();

        let cases = [
            ("SCOUT_PORTS", "8080,70000"),
            ("SCOUT_PORTS", "http"),
            ("SCOUT_MAX_ATTEMPTS", "0"),
            ("SCOUT_BACKOFF_BASE_MS", "0"),
            ("SCOUT_REQUEST_TIMEOUT", "-1"),
            ("SCOUT_USE_PROXY", "maybe"),
            ("SCOUT_BODY_FORMAT", "xml"),
            ("SCOUT_PROXY", "ftp://127.0.0.1:21"),
            ("SCOUT_CANDIDATES", "http://127.0.0.1:0"),
            ("SCOUT_ECHO_URL", "file:///etc/hosts"),
            ("SCOUT_TARGETS", "not a url"),
        ];

        for (key, value) in cases {
            let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
            env::set_var(key, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ScoutError::InvalidConfig(_)),
                "{}={} gave {:?}",
                key,
                value,
                err
            );
        }
    }
}
