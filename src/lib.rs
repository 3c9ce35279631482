//! Proxy Scout - local proxy discovery and resilient HTTP client
//!
//! Finds a working forward proxy on a host and calls flaky upstream APIs
//! through it.
//!
//! ## Features
//!
//! - Concurrent TCP scan of common proxy ports
//! - HTTP forward proxy and SOCKS5 verification via an IP echo endpoint
//! - Single active proxy configuration with snapshot reads
//! - GET execution with per-attempt timeouts, linear backoff, rate-limit
//!   cooldown, and cooperative cancellation

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Result, ScoutError};
