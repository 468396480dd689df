use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

use super::service::Flock;
use super::types::FlockConfig;
use crate::error::FlockError;
use crate::transport::TransportCapabilities;

/// Multiton of flocks keyed by channel name.
///
/// Every member joining a channel through the same registry shares one
/// coordinator, so one process can host several independent flocks side by
/// side. The first member to reach a channel fixes its timings; later
/// joiners' overrides are ignored.
///
/// Production code normally uses [`FlockRegistry::global`]; tests construct
/// their own registries so they can isolate channels and tear them down.
pub struct FlockRegistry {
    flocks: DashMap<String, Arc<Flock>>,
    capabilities: TransportCapabilities,
}

impl FlockRegistry {
    pub fn new() -> Self {
        Self::with_capabilities(TransportCapabilities::default())
    }

    pub fn with_capabilities(capabilities: TransportCapabilities) -> Self {
        Self {
            flocks: DashMap::new(),
            capabilities,
        }
    }

    /// The process-wide default registry.
    pub fn global() -> &'static FlockRegistry {
        static GLOBAL: OnceLock<FlockRegistry> = OnceLock::new();
        GLOBAL.get_or_init(FlockRegistry::new)
    }

    /// Returns the coordinator for the channel, constructing it on first
    /// use. Must be called from within a tokio runtime.
    pub fn get_or_join(&self, config: FlockConfig) -> Result<Arc<Flock>, FlockError> {
        match self.flocks.entry(config.channel_name.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                if *existing.config() != config.normalized() {
                    tracing::debug!(
                        "Ignoring config overrides for existing channel {}",
                        existing.config().channel_name
                    );
                }
                Ok(existing)
            }
            Entry::Vacant(slot) => {
                let flock = Flock::new(config.normalized(), &self.capabilities)?;
                slot.insert(flock.clone());
                Ok(flock)
            }
        }
    }

    pub fn get(&self, channel_name: &str) -> Option<Arc<Flock>> {
        self.flocks.get(channel_name).map(|entry| entry.clone())
    }

    pub fn channel_count(&self) -> usize {
        self.flocks.len()
    }

    /// Shuts down and forgets every flock. Intended for test suites and
    /// embedded hosts; the global registry is never reset by the fabric.
    pub fn reset(&self) {
        let channels: Vec<String> = self
            .flocks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for channel in channels {
            if let Some((_, flock)) = self.flocks.remove(&channel) {
                flock.shutdown();
            }
        }
    }
}

impl Default for FlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
