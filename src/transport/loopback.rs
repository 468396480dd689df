use tokio::sync::mpsc::UnboundedSender;

use super::Transport;
use crate::flock::protocol::Envelope;

/// Degraded medium for hosts with no shared facility at all: envelopes are
/// delivered straight back to this flock's own inbox, so only its local
/// members ever see them.
pub struct LoopbackTransport {
    inbox: UnboundedSender<Envelope>,
}

impl LoopbackTransport {
    pub fn new(inbox: UnboundedSender<Envelope>) -> Self {
        Self { inbox }
    }
}

impl Transport for LoopbackTransport {
    fn post(&self, envelope: &Envelope) {
        let _ = self.inbox.send(envelope.clone());
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}
