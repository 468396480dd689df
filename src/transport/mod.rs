//! Transport Layer
//!
//! Publishes envelopes to every participant on a channel, including the
//! publishing context itself (loopback), and delivers inbound envelopes to a
//! single subscriber: the flock's receive loop.
//!
//! ## Variants
//! - **Broadcast bus** (`bus`): preferred. A process-global registry of
//!   broadcast channels keyed by channel name; frames carry serialized
//!   envelopes. The medium does not self-deliver, so the transport loops a
//!   copy back to its own inbox explicitly.
//! - **Shared store** (`store`): fallback. A process-global string store
//!   with per-key change watchers; the writer removes the key shortly after
//!   writing so repeated equal writes still notify.
//! - **Loopback** (`loopback`): degraded mode for hosts with no shared
//!   medium at all; only local members of this flock see the messages.
//!
//! Selection happens once at flock construction and is a pure function of
//! the environment's [`TransportCapabilities`]. Transports never surface
//! errors to callers: an envelope that cannot be serialized or delivered is
//! dropped.

pub mod bus;
pub mod loopback;
pub mod store;


use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::FlockError;
use crate::flock::protocol::Envelope;

/// One publisher per flock; delivery goes to the inbox handed over at
/// construction. `post` is fire-and-forget.
pub trait Transport: Send + Sync {
    /// Publishes to every subscriber on the channel, then enqueues the
    /// loopback copy, so a context observes its own envelopes in publish
    /// order relative to its other traffic.
    fn post(&self, envelope: &Envelope);

    /// Variant name, for startup logging.
    fn name(&self) -> &'static str;
}

/// Which media the current environment offers. All present by default;
/// tests and embedded hosts narrow this down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    pub broadcast_bus: bool,
    pub shared_store: bool,
    pub loopback: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            broadcast_bus: true,
            shared_store: true,
            loopback: true,
        }
    }
}

impl TransportCapabilities {
    /// Pure in-process harness: local members only.
    pub fn loopback_only() -> Self {
        Self {
            broadcast_bus: false,
            shared_store: false,
            loopback: true,
        }
    }
}

/// One-shot transport selection: bus, then store, then loopback.
pub(crate) fn select_transport(
    channel_name: &str,
    capabilities: &TransportCapabilities,
    inbox: UnboundedSender<Envelope>,
) -> Result<Arc<dyn Transport>, FlockError> {
    if capabilities.broadcast_bus {
        return Ok(Arc::new(bus::BusTransport::new(channel_name, inbox)));
    }
    if capabilities.shared_store {
        return Ok(Arc::new(store::StoreTransport::new(channel_name, inbox)));
    }
    if capabilities.loopback {
        return Ok(Arc::new(loopback::LoopbackTransport::new(inbox)));
    }
    Err(FlockError::TransportUnavailable(channel_name.to_string()))
}
