use dashmap::DashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::Transport;
use crate::flock::protocol::Envelope;

/// How long a written value stays in the store. The write is the signal;
/// removing the key shortly afterwards keeps a later write of the same
/// serialized value observable as a fresh change.
const CLEANUP_DELAY: Duration = Duration::from_millis(50);

const WATCHER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct KeyChange {
    origin: Uuid,
    value: String,
}

/// Process-global string store with per-key change watchers. Stands in for
/// a shared-storage facility whose key-change notifications reach every
/// context on the host except the writer.
struct SharedStore {
    entries: DashMap<String, String>,
    watchers: DashMap<String, broadcast::Sender<KeyChange>>,
}

impl SharedStore {
    fn watcher(&self, key: &str) -> broadcast::Sender<KeyChange> {
        self.watchers
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(WATCHER_CAPACITY).0)
            .clone()
    }

    fn write(&self, key: &str, origin: Uuid, value: String) {
        self.entries.insert(key.to_string(), value.clone());
        let _ = self.watcher(key).send(KeyChange { origin, value });
    }

    fn remove_if_unchanged(&self, key: &str, value: &str) {
        self.entries.remove_if(key, |_, current| current == value);
    }
}

fn shared_store() -> &'static SharedStore {
    static STORE: OnceLock<SharedStore> = OnceLock::new();
    STORE.get_or_init(|| SharedStore {
        entries: DashMap::new(),
        watchers: DashMap::new(),
    })
}

#[cfg(test)]
pub(super) fn store_key_present(key: &str) -> bool {
    shared_store().entries.contains_key(key)
}

/// Fallback medium: envelopes are serialized as JSON strings into the
/// well-known key named after the channel; key-change watchers deliver them
/// to the other contexts.
pub struct StoreTransport {
    key: String,
    origin: Uuid,
    inbox: UnboundedSender<Envelope>,
}

impl StoreTransport {
    pub fn new(channel_name: &str, inbox: UnboundedSender<Envelope>) -> Self {
        let origin = Uuid::new_v4();
        let mut receiver = shared_store().watcher(channel_name).subscribe();
        let key = channel_name.to_string();
        let reader_key = key.clone();
        let reader_inbox = inbox.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => {
                        if change.origin == origin {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(&change.value) {
                            Ok(envelope) => {
                                if reader_inbox.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "Dropping undecodable value on key {}: {}",
                                    reader_key,
                                    e
                                );
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Store watcher on key {} lagged by {} changes", reader_key, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { key, origin, inbox }
    }
}

impl Transport for StoreTransport {
    fn post(&self, envelope: &Envelope) {
        let value = match serde_json::to_string(envelope) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to serialize envelope, dropping: {}", e);
                return;
            }
        };

        shared_store().write(&self.key, self.origin, value.clone());

        let key = self.key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_DELAY).await;
            shared_store().remove_if_unchanged(&key, &value);
        });

        let _ = self.inbox.send(envelope.clone());
    }

    fn name(&self) -> &'static str {
        "shared-store"
    }
}
