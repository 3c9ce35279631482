use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::{Result, ScoutError};
use crate::models::{ProbeResult, ProxyConfiguration};

/// Holds the one active proxy configuration.
///
/// Owned by whatever drives the workflow and passed by reference. Readers get
/// an `Arc` snapshot, so a call that started with one configuration keeps it
/// even if a new one is selected meanwhile.
pub struct ProxyRegistry {
    active: ArcSwap<ProxyConfiguration>,
}

impl ProxyRegistry {
    /// Start with a direct connection
    pub fn new() -> Self {
        Self::with_configuration(ProxyConfiguration::None)
    }

    pub fn with_configuration(config: ProxyConfiguration) -> Self {
        Self {
            active: ArcSwap::from_pointee(config),
        }
    }

    /// Replace the active configuration (last writer wins)
    pub fn select(&self, config: ProxyConfiguration) {
        info!("Active proxy configuration: {}", config);
        self.active.store(Arc::new(config));
    }

    /// Select the candidate of a verified probe.
    ///
    /// An unverified probe is refused even if its port was reachable.
    pub fn promote(&self, probe: &ProbeResult) -> Result<()> {
        if !probe.verified {
            return Err(ScoutError::InvalidArgument(format!(
                "refusing to select unverified proxy {}",
                probe.candidate
            )));
        }
        self.select(ProxyConfiguration::Selected(probe.candidate.clone()));
        Ok(())
    }

    /// Snapshot of the active configuration
    pub fn current(&self) -> Arc<ProxyConfiguration> {
        self.active.load_full()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
