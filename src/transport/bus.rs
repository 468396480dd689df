use dashmap::DashMap;
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::Transport;
use crate::flock::protocol::Envelope;

/// Frames kept per receiver before the slowest one starts losing messages.
/// A lagging flock just misses heartbeats and re-elects; that is the
/// tolerated failure mode of the medium.
const BUS_CAPACITY: usize = 256;

/// One frame on the bus: the publishing context's id plus the encoded
/// envelope. Envelopes carry opaque JSON payloads, so the encoding must be
/// self-describing. Receivers drop their own frames; the medium does not
/// self-deliver.
#[derive(Debug, Clone)]
struct BusFrame {
    origin: Uuid,
    bytes: Vec<u8>,
}

fn buses() -> &'static DashMap<String, broadcast::Sender<BusFrame>> {
    static BUSES: OnceLock<DashMap<String, broadcast::Sender<BusFrame>>> = OnceLock::new();
    BUSES.get_or_init(DashMap::new)
}

fn bus_for(channel_name: &str) -> broadcast::Sender<BusFrame> {
    buses()
        .entry(channel_name.to_string())
        .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
        .clone()
}

/// Preferred medium: an in-process broadcast channel per flock channel name,
/// shared by every context in the process.
pub struct BusTransport {
    origin: Uuid,
    sender: broadcast::Sender<BusFrame>,
    inbox: UnboundedSender<Envelope>,
}

impl BusTransport {
    pub fn new(channel_name: &str, inbox: UnboundedSender<Envelope>) -> Self {
        let sender = bus_for(channel_name);
        let origin = Uuid::new_v4();

        let mut receiver = sender.subscribe();
        let channel = channel_name.to_string();
        let reader_inbox = inbox.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        if frame.origin == origin {
                            continue;
                        }
                        match serde_json::from_slice::<Envelope>(&frame.bytes) {
                            Ok(envelope) => {
                                if reader_inbox.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Dropping undecodable frame on channel {}: {}",
                                    channel,
                                    e
                                );
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Bus receiver on channel {} lagged by {} frames", channel, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            origin,
            sender,
            inbox,
        }
    }
}

impl Transport for BusTransport {
    fn post(&self, envelope: &Envelope) {
        match serde_json::to_vec(envelope) {
            Ok(bytes) => {
                // Err means no other context is subscribed right now.
                let _ = self.sender.send(BusFrame {
                    origin: self.origin,
                    bytes,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to serialize envelope, dropping: {}", e);
                return;
            }
        }
        let _ = self.inbox.send(envelope.clone());
    }

    fn name(&self) -> &'static str {
        "broadcast-bus"
    }
}
