use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::types::{PendingEntry, QueueDepths, Responder, RetryEntry, SendKind};
use crate::error::FlockError;
use crate::flock::protocol::{RequestId, WireMessage};
use crate::flock::registry::FlockRegistry;
use crate::flock::service::Flock;
use crate::flock::types::{FlockConfig, MemberCallbacks, MemberHooks, MemberId};

/// Resend attempts granted per queued send before it fails.
const MAX_RETRIES: u32 = 3;
/// How often parked sends are resent while a leader exists.
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Slack added to the heartbeat TTL for the default request timeout.
const RESPONSE_GRACE: Duration = Duration::from_millis(500);

/// A participant in a flock.
///
/// Joining registers the member with its channel's coordinator; from then
/// on the member can exchange requests and messages with whichever member
/// currently leads, and is itself eligible for election. `resign` leaves
/// the flock permanently.
pub struct Member {
    inner: Arc<MemberInner>,
}

struct MemberInner {
    id: MemberId,
    flock: Arc<Flock>,
    callbacks: MemberCallbacks,
    pending: DashMap<RequestId, PendingEntry>,
    retry: DashMap<RequestId, RetryEntry>,
    last_known_leader: Mutex<Option<MemberId>>,
    resigned: AtomicBool,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<MemberInner>,
}

impl Member {
    /// Joins the channel named in `config` via the process-global registry.
    pub fn join(config: FlockConfig, callbacks: MemberCallbacks) -> Result<Self, FlockError> {
        Self::join_with_registry(config, callbacks, FlockRegistry::global())
    }

    /// Joins via an explicit registry. Test suites and embedded hosts use
    /// this to keep flocks isolated and tear them down afterwards.
    pub fn join_with_registry(
        config: FlockConfig,
        callbacks: MemberCallbacks,
        registry: &FlockRegistry,
    ) -> Result<Self, FlockError> {
        let flock = registry.get_or_join(config)?;
        let id = MemberId::new();

        let inner = Arc::new_cyclic(|weak| MemberInner {
            id: id.clone(),
            flock: flock.clone(),
            callbacks,
            pending: DashMap::new(),
            retry: DashMap::new(),
            last_known_leader: Mutex::new(None),
            resigned: AtomicBool::new(false),
            sweep_task: Mutex::new(None),
            weak_self: weak.clone(),
        });

        *inner.sweep_task.lock().unwrap() = Some(spawn_retry_sweep(&inner));
        flock.register(id, inner.clone());

        Ok(Self { inner })
    }

    pub fn id(&self) -> &MemberId {
        &self.inner.id
    }

    pub fn channel_name(&self) -> &str {
        &self.inner.flock.config().channel_name
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    /// Sends an awaited request to the current leader with the default
    /// timeout (heartbeat TTL plus a grace period).
    ///
    /// The returned future resolves with the leader's reply, fails with
    /// [`FlockError::MaxRetriesReached`] once the retry budget is spent, or
    /// stays pending while no leader exists.
    pub async fn send_request(&self, payload: Value) -> Result<Value, FlockError> {
        self.send_request_with_timeout(payload, self.inner.default_timeout())
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, FlockError> {
        let request_id = RequestId::new();
        if self.inner.resigned.load(Ordering::SeqCst) {
            return Err(FlockError::Abandoned(request_id));
        }
        let (responder, receiver) = oneshot::channel();
        self.inner.enqueue_send(
            request_id.clone(),
            SendKind::Request,
            payload,
            Some(responder),
            timeout,
            0,
        );
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(FlockError::Abandoned(request_id)),
        }
    }

    /// Sends a one-way message to the current leader. Delivery is confirmed
    /// internally by the leader's ack and retried across leader transitions;
    /// after the retry budget is spent the message is silently dropped.
    pub fn send_message_to_leader(&self, payload: Value) {
        if self.inner.resigned.load(Ordering::SeqCst) {
            return;
        }
        self.inner.enqueue_send(
            RequestId::new(),
            SendKind::LeaderMessage,
            payload,
            None,
            self.inner.default_timeout(),
            0,
        );
    }

    /// Leader-only: message one member directly. A no-op on followers.
    pub fn send_to_member(&self, target: &MemberId, payload: Value) {
        if !self.is_leader() {
            tracing::trace!("Ignoring send_to_member from non-leader {}", self.inner.id);
            return;
        }
        self.inner.flock.publish(WireMessage::DirectMessage {
            sender: self.inner.id.clone(),
            target: target.clone(),
            payload,
        });
    }

    /// Leader-only: message every member of the flock. A no-op on followers.
    pub fn broadcast_to_members(&self, payload: Value) {
        if !self.is_leader() {
            tracing::trace!(
                "Ignoring broadcast_to_members from non-leader {}",
                self.inner.id
            );
            return;
        }
        self.inner.flock.publish(WireMessage::Broadcast {
            sender: self.inner.id.clone(),
            payload,
        });
    }

    /// Known flock participants: local members plus remote senders heard
    /// from within the heartbeat TTL.
    pub fn get_members_info(&self) -> Vec<MemberId> {
        self.inner.flock.global_members()
    }

    /// Relinquishes leadership while staying in the flock. The exclusion
    /// window keeps this member from immediately re-electing itself.
    pub fn cede_leadership(&self) {
        if !self.is_leader() {
            return;
        }
        self.inner.flock.cede_leadership(&self.inner.id);
    }

    /// Leaves the flock permanently: stops the retry sweep, discards queued
    /// sends (their futures fail as abandoned), and unregisters. If this
    /// member led, the flock announces the resignation and re-elects.
    pub fn resign(&self) {
        if self.inner.resigned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.sweep_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.discard_queues();
        self.inner.flock.unregister(&self.inner.id);
    }

    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            pending: self.inner.pending.len(),
            retry: self.inner.retry.len(),
        }
    }
}

impl MemberInner {
    fn is_leader(&self) -> bool {
        !self.resigned.load(Ordering::SeqCst)
            && self.flock.leader_id().as_ref() == Some(&self.id)
    }

    fn default_timeout(&self) -> Duration {
        self.flock.config().heartbeat_ttl + RESPONSE_GRACE
    }

    /// Installs a pending entry with a fresh timeout and publishes the
    /// matching wire message. Used for first sends and resends alike; a
    /// resend keeps its request id and attempt count.
    fn enqueue_send(
        &self,
        request_id: RequestId,
        kind: SendKind,
        payload: Value,
        responder: Option<Responder>,
        timeout: Duration,
        attempts: u32,
    ) {
        if self.resigned.load(Ordering::SeqCst) {
            return;
        }

        let weak = self.weak_self.clone();
        let expiring = request_id.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_pending(&expiring);
            }
        });

        self.pending.insert(
            request_id.clone(),
            PendingEntry {
                kind,
                payload: payload.clone(),
                responder,
                timeout,
                attempts,
                timeout_task,
            },
        );

        let message = match kind {
            SendKind::Request => WireMessage::Request {
                sender: self.id.clone(),
                request_id,
                payload,
            },
            SendKind::LeaderMessage => WireMessage::MessageToLeader {
                sender: self.id.clone(),
                request_id,
                payload,
            },
        };
        self.flock.publish(message);
    }

    /// Timeout path: the send is parked for the next leader change or sweep.
    fn expire_pending(&self, request_id: &RequestId) {
        let Some((request_id, entry)) = self.pending.remove(request_id) else {
            return;
        };
        tracing::debug!("Send {} timed out, queueing for retry", request_id);
        self.retry.insert(
            request_id,
            RetryEntry {
                kind: entry.kind,
                payload: entry.payload,
                responder: entry.responder,
                timeout: entry.timeout,
                attempts: entry.attempts,
            },
        );
    }

    fn requeue_pending(&self) {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((id, entry)) = self.pending.remove(&id) {
                entry.timeout_task.abort();
                self.retry.insert(
                    id,
                    RetryEntry {
                        kind: entry.kind,
                        payload: entry.payload,
                        responder: entry.responder,
                        timeout: entry.timeout,
                        attempts: 0,
                    },
                );
            }
        }
    }

    fn process_retry(&self) {
        if self.resigned.load(Ordering::SeqCst) {
            return;
        }
        if self.is_leader() {
            // Work queued for the leader is now addressed to ourselves;
            // nothing useful can come of resending it.
            let dropped = self.retry.len();
            self.retry.clear();
            if dropped > 0 {
                tracing::trace!("Dropped {} queued sends addressed to self", dropped);
            }
            return;
        }

        let ids: Vec<RequestId> = self.retry.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            let Some((id, mut item)) = self.retry.remove(&id) else {
                continue;
            };
            item.attempts += 1;
            if item.attempts > MAX_RETRIES {
                match item.kind {
                    SendKind::Request => {
                        tracing::warn!("Request {} failed after {} attempts", id, MAX_RETRIES);
                        if let Some(responder) = item.responder.take() {
                            let _ = responder.send(Err(FlockError::MaxRetriesReached(id.clone())));
                        }
                    }
                    SendKind::LeaderMessage => {
                        tracing::debug!(
                            "Dropping leader message {} after {} attempts",
                            id,
                            MAX_RETRIES
                        );
                    }
                }
                continue;
            }
            self.enqueue_send(id, item.kind, item.payload, item.responder, item.timeout, item.attempts);
        }
    }

    fn discard_queues(&self) {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.timeout_task.abort();
            }
        }
        self.retry.clear();
    }
}

impl MemberHooks for MemberInner {
    fn callbacks(&self) -> &MemberCallbacks {
        &self.callbacks
    }

    fn resolve_pending(&self, request_id: &RequestId, payload: Option<Value>) {
        let Some((_, mut entry)) = self.pending.remove(request_id) else {
            return;
        };
        entry.timeout_task.abort();
        match entry.kind {
            SendKind::Request => {
                if let Some(responder) = entry.responder.take() {
                    let _ = responder.send(Ok(payload.unwrap_or(Value::Null)));
                }
            }
            // The ack itself is the whole outcome.
            SendKind::LeaderMessage => {}
        }
    }

    fn leadership_changed(&self, new_leader: Option<MemberId>) {
        let am_leader = new_leader.as_ref() == Some(&self.id);
        let initial_discovery = {
            let known = self.last_known_leader.lock().unwrap();
            known.is_none() && new_leader.is_some()
        };

        // On first discovery the original sends may still be answered by
        // the incumbent, so they stay pending. Every later transition (and
        // becoming leader ourselves) re-lines them up behind the new leader.
        if !self.resigned.load(Ordering::SeqCst) && (am_leader || !initial_discovery) {
            self.requeue_pending();
            self.process_retry();
        }

        *self.last_known_leader.lock().unwrap() = new_leader.clone();

        if let Some(handler) = self.callbacks.on_leadership_change.clone() {
            tokio::spawn(handler(new_leader));
        }
    }
}

fn spawn_retry_sweep(inner: &Arc<MemberInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETRY_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.resigned.load(Ordering::SeqCst) {
                break;
            }
            // Covers intermittent failures that clear without a leader
            // change ever firing.
            if inner.flock.leader_id().is_some() && !inner.retry.is_empty() {
                inner.process_retry();
            }
        }
    })
}
