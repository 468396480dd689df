use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::types::MemberId;

/// Correlates a request with its response across leader transitions.
/// Wrapper around a UUID string; a resend keeps its original id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The wire protocol exchanged over the channel's broadcast medium.
///
/// A closed sum: envelopes that do not deserialize into one of these
/// variants are dropped by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    /// "I propose myself as leader."
    Claim { sender: MemberId },

    /// Liveness and identity assertion by the current leader.
    Heartbeat { sender: MemberId },

    /// Leadership released by a departing or ceding leader.
    Resign { sender: MemberId },

    /// Joiner asking the incumbent (if any) to identify itself.
    LeaderSync { sender: MemberId },

    /// Follower RPC addressed to whichever member currently leads.
    Request {
        sender: MemberId,
        request_id: RequestId,
        payload: Value,
    },

    /// One-way follower message to the leader; acknowledged with a
    /// payload-less `Response`.
    MessageToLeader {
        sender: MemberId,
        request_id: RequestId,
        payload: Value,
    },

    /// RPC reply or synthetic ack, routed to the original sender.
    Response {
        target: MemberId,
        request_id: RequestId,
        payload: Option<Value>,
    },

    /// Leader fan-out to all members.
    Broadcast { sender: MemberId, payload: Value },

    /// Leader fan-out to one member.
    DirectMessage {
        sender: MemberId,
        target: MemberId,
        payload: Value,
    },
}

impl WireMessage {
    /// The originating member, where the variant carries one.
    pub fn sender(&self) -> Option<&MemberId> {
        match self {
            WireMessage::Claim { sender }
            | WireMessage::Heartbeat { sender }
            | WireMessage::Resign { sender }
            | WireMessage::LeaderSync { sender }
            | WireMessage::Request { sender, .. }
            | WireMessage::MessageToLeader { sender, .. }
            | WireMessage::Broadcast { sender, .. }
            | WireMessage::DirectMessage { sender, .. } => Some(sender),
            WireMessage::Response { .. } => None,
        }
    }

    /// Short name for traffic logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Claim { .. } => "claim",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Resign { .. } => "resign",
            WireMessage::LeaderSync { .. } => "leader-sync",
            WireMessage::Request { .. } => "request",
            WireMessage::MessageToLeader { .. } => "message-to-leader",
            WireMessage::Response { .. } => "response",
            WireMessage::Broadcast { .. } => "broadcast",
            WireMessage::DirectMessage { .. } => "direct-message",
        }
    }
}

/// One published unit on the medium. The timestamp is the sender's
/// wall clock in millis, carried for debugging only; receivers never
/// validate it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub message: WireMessage,
    pub sent_at_ms: u64,
}

impl Envelope {
    pub fn new(message: WireMessage) -> Self {
        Self {
            message,
            sent_at_ms: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
