//! Proxy discovery and request execution
//!
//! This module provides:
//! - TCP port scanning for local proxy software
//! - HTTP and SOCKS5 proxy verification against an echo endpoint
//! - The active proxy registry
//! - Resilient GET execution with classified outcomes and bounded retries

pub mod client;
pub mod discovery;
pub mod executor;
pub mod registry;
pub mod scanner;
pub mod transport;
pub mod verifier;

pub use client::{FetchedResponse, Fetcher, HttpClient};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryReport};
pub use executor::{BodyFormat, CancelHandle, RequestExecutor, RetryPolicy};
pub use registry::ProxyRegistry;
pub use scanner::{PortScanner, ScannerConfig, COMMON_PROXY_PORTS};
pub use verifier::Verifier;
