use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::protocol::RequestId;

/// Default channel joined when no name is given.
pub const DEFAULT_CHANNEL: &str = "flock_channel_v1";

/// Unique identifier for a member of a flock.
/// Wrapper around a UUID string, generated once at member construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub String);

impl MemberId {
    /// Generates a new random UUID v4-based MemberId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timing and identity settings for one flock.
///
/// The first member to join a channel fixes these for every later member of
/// the same channel in this process; later overrides are ignored so that all
/// participants share one set of timings.
#[derive(Debug, Clone, PartialEq)]
pub struct FlockConfig {
    /// Multiton key; isolates flocks from each other.
    pub channel_name: String,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
    /// Silence window after which followers call an election.
    /// Must exceed `heartbeat_interval`.
    pub heartbeat_ttl: Duration,
    /// Enables per-envelope diagnostic logging.
    pub debug: bool,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL.to_string(),
            heartbeat_interval: Duration::from_millis(2000),
            heartbeat_ttl: Duration::from_millis(5000),
            debug: false,
        }
    }
}

impl FlockConfig {
    pub fn for_channel(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    /// Returns a config with valid timings, falling back to the defaults
    /// when the TTL does not exceed the heartbeat interval.
    pub fn normalized(self) -> Self {
        if self.heartbeat_ttl > self.heartbeat_interval {
            return self;
        }
        let fallback = Self::default();
        tracing::warn!(
            "heartbeat_ttl {:?} must exceed heartbeat_interval {:?}; using default timings",
            self.heartbeat_ttl,
            self.heartbeat_interval
        );
        Self {
            heartbeat_interval: fallback.heartbeat_interval,
            heartbeat_ttl: fallback.heartbeat_ttl,
            ..self
        }
    }
}

/// A user-level message delivered to a member's `on_message` handler.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub sender: MemberId,
    pub kind: IncomingKind,
    pub payload: Value,
}

/// How an incoming user-level message reached this member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingKind {
    /// One-way message forwarded to the leader.
    LeaderMessage,
    /// Leader fan-out to every member.
    Broadcast,
    /// Leader fan-out to exactly this member.
    DirectMessage,
}

pub type RequestHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Value> + Send>> + Send + Sync>;
pub type MessageHandler =
    Arc<dyn Fn(IncomingMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
pub type LeadershipHandler =
    Arc<dyn Fn(Option<MemberId>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The capabilities a member advertises to its flock.
///
/// Only the handlers that are present are ever dispatched; a member without
/// `on_request` simply never answers requests.
#[derive(Clone, Default)]
pub struct MemberCallbacks {
    pub on_request: Option<RequestHandler>,
    pub on_message: Option<MessageHandler>,
    pub on_leadership_change: Option<LeadershipHandler>,
}

impl MemberCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles follower requests while this member leads. The returned value
    /// is published back to the requester; the reply may complete at any
    /// later time.
    pub fn on_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let boxed: RequestHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.on_request = Some(boxed);
        self
    }

    /// Handles leader messages, broadcasts, and direct messages.
    pub fn on_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: MessageHandler = Arc::new(move |message| Box::pin(handler(message)));
        self.on_message = Some(boxed);
        self
    }

    /// Observes leadership transitions. Receives the new leader's id, or
    /// `None` when this member departs while leading.
    pub fn on_leadership_change<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Option<MemberId>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: LeadershipHandler = Arc::new(move |leader| Box::pin(handler(leader)));
        self.on_leadership_change = Some(boxed);
        self
    }
}

impl fmt::Debug for MemberCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberCallbacks")
            .field("on_request", &self.on_request.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_leadership_change", &self.on_leadership_change.is_some())
            .finish()
    }
}

/// Hooks the flock uses to drive a registered member.
///
/// Implemented by the member internals; the flock never sees pending-queue
/// state directly, it only routes responses and leadership transitions.
pub trait MemberHooks: Send + Sync {
    /// The member's advertised handler capabilities.
    fn callbacks(&self) -> &MemberCallbacks;

    /// Routes a response or ack to the member's pending table.
    fn resolve_pending(&self, request_id: &RequestId, payload: Option<Value>);

    /// Applies a leadership transition: requeues in-flight sends where
    /// required, then invokes the user callback.
    fn leadership_changed(&self, new_leader: Option<MemberId>);
}

/// A member as the flock sees it: identity, join order, and hooks.
pub struct MemberDescriptor {
    pub id: MemberId,
    /// Monotone per-flock sequence; candidate selection walks join order.
    pub join_seq: u64,
    pub hooks: Arc<dyn MemberHooks>,
}

impl fmt::Debug for MemberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberDescriptor")
            .field("id", &self.id)
            .field("join_seq", &self.join_seq)
            .finish()
    }
}

/// Point-in-time view of one flock, for diagnostics and status endpoints.
#[derive(Debug, Clone)]
pub struct FlockSnapshot {
    pub channel_name: String,
    pub leader_id: Option<MemberId>,
    pub leader_is_local: bool,
    pub local_members: Vec<MemberId>,
    pub fresh_remote_members: usize,
}
