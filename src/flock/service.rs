use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::{Envelope, RequestId, WireMessage};
use super::types::{
    FlockConfig, FlockSnapshot, IncomingKind, IncomingMessage, MemberDescriptor, MemberHooks,
    MemberId,
};
use crate::error::FlockError;
use crate::transport::{select_transport, Transport, TransportCapabilities};

const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const DISCOVERY_DELAY: Duration = Duration::from_millis(500);
const EXCLUSION_WINDOW: Duration = Duration::from_millis(1500);

struct Exclusion {
    id: MemberId,
    expiry: JoinHandle<()>,
}

/// Per-channel coordinator. Owns the election state machine, the heartbeat
/// and monitor timers, the member registry, and message dispatch. Exactly
/// one instance exists per channel name in a registry.
pub struct Flock {
    config: FlockConfig,
    transport: Arc<dyn Transport>,
    local_members: DashMap<MemberId, Arc<MemberDescriptor>>,
    join_counter: AtomicU64,
    /// Last time each sender was heard from, local loopback included.
    /// Entries older than the heartbeat TTL are pruned lazily on read.
    remote_members: DashMap<MemberId, Instant>,
    leader_id: RwLock<Option<MemberId>>,
    last_heartbeat_at: Mutex<Instant>,
    /// At most one member barred from candidacy; a new exclusion cancels
    /// the previous expiry.
    excluded: Mutex<Option<Exclusion>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Flock {
    pub(crate) fn new(
        config: FlockConfig,
        capabilities: &TransportCapabilities,
    ) -> Result<Arc<Self>, FlockError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let transport = select_transport(&config.channel_name, capabilities, inbox_tx)?;
        tracing::info!(
            "Channel {} using {} transport",
            config.channel_name,
            transport.name()
        );

        let flock = Arc::new(Self {
            config,
            transport,
            local_members: DashMap::new(),
            join_counter: AtomicU64::new(0),
            remote_members: DashMap::new(),
            leader_id: RwLock::new(None),
            last_heartbeat_at: Mutex::new(Instant::now()),
            excluded: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        flock.start(inbox_rx);
        Ok(flock)
    }

    fn start(self: &Arc<Self>, inbox: UnboundedReceiver<Envelope>) {
        let receive = {
            let flock = self.clone();
            tokio::spawn(async move { flock.receive_loop(inbox).await })
        };
        let monitor = {
            let flock = self.clone();
            tokio::spawn(async move { flock.monitor_loop().await })
        };
        let heartbeat = {
            let flock = self.clone();
            tokio::spawn(async move { flock.heartbeat_loop().await })
        };
        self.tasks
            .lock()
            .unwrap()
            .extend([receive, monitor, heartbeat]);
    }

    /// Stops the receive, monitor, and heartbeat tasks. A shut-down flock
    /// goes silent immediately; peers evict its leadership via the TTL.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(exclusion) = self.excluded.lock().unwrap().take() {
            exclusion.expiry.abort();
        }
        tracing::info!("Flock on channel {} shut down", self.config.channel_name);
    }

    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    pub fn leader_id(&self) -> Option<MemberId> {
        self.leader_id.read().unwrap().clone()
    }

    pub fn is_leader_local(&self) -> bool {
        match self.leader_id() {
            Some(leader) => self.local_members.contains_key(&leader),
            None => false,
        }
    }

    /// Every member currently participating: local members plus remote
    /// senders heard from within the heartbeat TTL, deduplicated.
    pub fn global_members(&self) -> Vec<MemberId> {
        let ttl = self.config.heartbeat_ttl;
        self.remote_members.retain(|_, seen| seen.elapsed() <= ttl);

        let mut ids: BTreeSet<MemberId> = self
            .remote_members
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for entry in self.local_members.iter() {
            ids.insert(entry.key().clone());
        }
        ids.into_iter().collect()
    }

    pub fn snapshot(&self) -> FlockSnapshot {
        let ttl = self.config.heartbeat_ttl;
        let mut locals: Vec<(u64, MemberId)> = self
            .local_members
            .iter()
            .map(|entry| (entry.value().join_seq, entry.key().clone()))
            .collect();
        locals.sort_by_key(|(seq, _)| *seq);

        FlockSnapshot {
            channel_name: self.config.channel_name.clone(),
            leader_id: self.leader_id(),
            leader_is_local: self.is_leader_local(),
            local_members: locals.into_iter().map(|(_, id)| id).collect(),
            fresh_remote_members: self
                .remote_members
                .iter()
                .filter(|entry| entry.value().elapsed() <= ttl)
                .count(),
        }
    }

    // ---- registry -------------------------------------------------------

    pub(crate) fn register(self: &Arc<Self>, id: MemberId, hooks: Arc<dyn MemberHooks>) {
        let join_seq = self.join_counter.fetch_add(1, Ordering::Relaxed);
        let descriptor = Arc::new(MemberDescriptor {
            id: id.clone(),
            join_seq,
            hooks,
        });
        self.local_members.insert(id.clone(), descriptor.clone());
        tracing::info!("Member {} joined channel {}", id, self.config.channel_name);

        if let Some(leader) = self.leader_id() {
            // Newcomer learns the incumbent on the next turn.
            tokio::spawn(async move {
                descriptor.hooks.leadership_changed(Some(leader));
            });
        }

        self.publish(WireMessage::LeaderSync { sender: id });

        let flock = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCOVERY_DELAY).await;
            if flock.leader_id().is_none() {
                flock.trigger_election();
            }
        });
    }

    pub(crate) fn unregister(&self, id: &MemberId) {
        let Some((_, descriptor)) = self.local_members.remove(id) else {
            return;
        };
        tracing::info!("Member {} left channel {}", id, self.config.channel_name);

        if self.leader_id().as_ref() == Some(id) {
            // The resign handler owns the leader-state transition; here we
            // only tell the departing member and announce the departure.
            descriptor.hooks.leadership_changed(None);
            self.publish(WireMessage::Resign { sender: id.clone() });
        }
    }

    /// Steps the given leader down without removing it: the member stays
    /// registered but cannot win the next candidate scan until the
    /// exclusion window passes.
    pub(crate) fn cede_leadership(self: &Arc<Self>, id: &MemberId) {
        if self.leader_id().as_ref() != Some(id) {
            return;
        }
        self.set_exclusion(id.clone());
        self.publish(WireMessage::Resign { sender: id.clone() });
    }

    fn set_exclusion(self: &Arc<Self>, id: MemberId) {
        let flock = self.clone();
        let expiring = id.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(EXCLUSION_WINDOW).await;
            let mut guard = flock.excluded.lock().unwrap();
            if guard.as_ref().map(|e| &e.id) == Some(&expiring) {
                *guard = None;
            }
        });

        let mut guard = self.excluded.lock().unwrap();
        if let Some(previous) = guard.take() {
            previous.expiry.abort();
        }
        *guard = Some(Exclusion { id, expiry });
    }

    // ---- election -------------------------------------------------------

    fn trigger_election(&self) {
        if let Some(candidate) = self.pick_candidate() {
            tracing::debug!(
                "Proposing {} as leader of channel {}",
                candidate,
                self.config.channel_name
            );
            self.publish(WireMessage::Claim { sender: candidate });
        }
    }

    /// Stable leadership preferred: a still-local current leader is reused.
    /// Otherwise the first local member in join order that is not excluded.
    fn pick_candidate(&self) -> Option<MemberId> {
        if let Some(leader) = self.leader_id() {
            if self.local_members.contains_key(&leader) {
                return Some(leader);
            }
        }
        let excluded = self
            .excluded
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.id.clone());
        self.local_members
            .iter()
            .filter(|entry| Some(entry.key()) != excluded.as_ref())
            .min_by_key(|entry| entry.value().join_seq)
            .map(|entry| entry.key().clone())
    }

    fn set_leader(&self, new_leader: MemberId) {
        {
            let mut guard = self.leader_id.write().unwrap();
            if guard.as_ref() == Some(&new_leader) {
                return;
            }
            *guard = Some(new_leader.clone());
        }
        tracing::info!(
            "Channel {} leader is now {}",
            self.config.channel_name,
            new_leader
        );

        // A freshly local leader asserts itself at once; the heartbeat loop
        // takes over from there.
        if self.local_members.contains_key(&new_leader) {
            self.publish_heartbeat();
        }

        let members: Vec<Arc<MemberDescriptor>> = self
            .local_members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for descriptor in members {
            descriptor.hooks.leadership_changed(Some(new_leader.clone()));
        }
    }

    fn clear_leader(&self) {
        *self.leader_id.write().unwrap() = None;
    }

    fn publish_heartbeat(&self) {
        if let Some(leader) = self.leader_id() {
            if self.local_members.contains_key(&leader) {
                self.publish(WireMessage::Heartbeat { sender: leader });
            }
        }
    }

    pub(crate) fn publish(&self, message: WireMessage) {
        if self.config.debug {
            tracing::debug!("[{}] -> {}", self.config.channel_name, message.kind());
        }
        self.transport.post(&Envelope::new(message));
    }

    // ---- timers ---------------------------------------------------------

    async fn monitor_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        // The first tick is immediate; a fresh flock gets one full period to
        // hear from an incumbent before it may call an election.
        interval.tick().await;
        loop {
            interval.tick().await;
            if self.is_leader_local() {
                continue;
            }
            let stale =
                self.last_heartbeat_at.lock().unwrap().elapsed() > self.config.heartbeat_ttl;
            if self.leader_id().is_none() || stale {
                if stale && self.leader_id().is_some() {
                    tracing::warn!(
                        "Channel {} leader went silent, calling election",
                        self.config.channel_name
                    );
                }
                self.clear_leader();
                self.trigger_election();
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if self.is_leader_local() {
                self.publish_heartbeat();
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut inbox: UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            self.handle_envelope(envelope);
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        if let Some(sender) = envelope.message.sender() {
            self.remote_members.insert(sender.clone(), Instant::now());
        }
        if self.config.debug {
            tracing::debug!(
                "[{}] <- {}",
                self.config.channel_name,
                envelope.message.kind()
            );
        }

        match envelope.message {
            WireMessage::Claim { sender } => self.handle_claim(sender),
            WireMessage::Heartbeat { sender } => self.handle_heartbeat(sender),
            WireMessage::Resign { sender } => self.handle_resign(sender),
            WireMessage::LeaderSync { .. } => self.handle_leader_sync(),
            WireMessage::Request {
                sender,
                request_id,
                payload,
            } => self.handle_request(sender, request_id, payload),
            WireMessage::MessageToLeader {
                sender,
                request_id,
                payload,
            } => self.handle_message_to_leader(sender, request_id, payload),
            WireMessage::Response {
                target,
                request_id,
                payload,
            } => self.handle_response(target, request_id, payload),
            WireMessage::Broadcast { sender, payload } => self.handle_broadcast(sender, payload),
            WireMessage::DirectMessage {
                sender,
                target,
                payload,
            } => self.handle_direct_message(sender, target, payload),
        }
    }

    fn handle_claim(&self, claimant: MemberId) {
        if self.is_leader_local() && self.leader_id().as_ref() != Some(&claimant) {
            // The incumbent answers a foreign claim with a heartbeat; the
            // claimant deposes itself on receipt.
            self.publish_heartbeat();
        } else {
            self.set_leader(claimant);
        }
    }

    fn handle_heartbeat(&self, leader: MemberId) {
        *self.last_heartbeat_at.lock().unwrap() = Instant::now();
        if self.leader_id().as_ref() != Some(&leader) {
            self.set_leader(leader);
        }
    }

    fn handle_resign(&self, sender: MemberId) {
        if self.leader_id().as_ref() != Some(&sender) {
            return;
        }
        tracing::info!(
            "Channel {} leader {} resigned",
            self.config.channel_name,
            sender
        );
        self.clear_leader();
        self.trigger_election();
    }

    fn handle_leader_sync(&self) {
        if self.is_leader_local() {
            self.publish_heartbeat();
        }
    }

    fn local_leader_descriptor(&self) -> Option<Arc<MemberDescriptor>> {
        let leader = self.leader_id()?;
        self.local_members
            .get(&leader)
            .map(|entry| entry.value().clone())
    }

    fn handle_request(self: &Arc<Self>, sender: MemberId, request_id: RequestId, payload: Value) {
        let Some(descriptor) = self.local_leader_descriptor() else {
            return;
        };
        let Some(handler) = descriptor.hooks.callbacks().on_request.clone() else {
            return;
        };
        let flock = self.clone();
        tokio::spawn(async move {
            let reply = handler(payload).await;
            flock.publish(WireMessage::Response {
                target: sender,
                request_id,
                payload: Some(reply),
            });
        });
    }

    fn handle_message_to_leader(
        self: &Arc<Self>,
        sender: MemberId,
        request_id: RequestId,
        payload: Value,
    ) {
        let Some(descriptor) = self.local_leader_descriptor() else {
            return;
        };
        if let Some(handler) = descriptor.hooks.callbacks().on_message.clone() {
            tokio::spawn(handler(IncomingMessage {
                sender: sender.clone(),
                kind: IncomingKind::LeaderMessage,
                payload,
            }));
        }
        // Synthetic ack so the sender's timeout is cancelled.
        self.publish(WireMessage::Response {
            target: sender,
            request_id,
            payload: None,
        });
    }

    fn handle_response(&self, target: MemberId, request_id: RequestId, payload: Option<Value>) {
        if let Some(descriptor) = self.local_members.get(&target).map(|e| e.value().clone()) {
            descriptor.hooks.resolve_pending(&request_id, payload);
        }
    }

    fn handle_broadcast(&self, sender: MemberId, payload: Value) {
        let members: Vec<Arc<MemberDescriptor>> = self
            .local_members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for descriptor in members {
            if let Some(handler) = descriptor.hooks.callbacks().on_message.clone() {
                tokio::spawn(handler(IncomingMessage {
                    sender: sender.clone(),
                    kind: IncomingKind::Broadcast,
                    payload: payload.clone(),
                }));
            }
        }
    }

    fn handle_direct_message(&self, sender: MemberId, target: MemberId, payload: Value) {
        let Some(descriptor) = self.local_members.get(&target).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(handler) = descriptor.hooks.callbacks().on_message.clone() {
            tokio::spawn(handler(IncomingMessage {
                sender,
                kind: IncomingKind::DirectMessage,
                payload,
            }));
        }
    }
}
