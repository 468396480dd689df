use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::FlockError;

/// Completes the future a caller is awaiting on `send_request`.
pub(crate) type Responder = oneshot::Sender<Result<Value, FlockError>>;

/// What kind of send an in-flight entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// Awaited RPC to the leader.
    Request,
    /// One-way message to the leader; only the ack is tracked.
    LeaderMessage,
}

/// An in-flight send awaiting a response or ack. Destroyed on resolution,
/// or moved to the retry queue when its timeout fires or leadership moves.
pub(crate) struct PendingEntry {
    pub kind: SendKind,
    pub payload: Value,
    pub responder: Option<Responder>,
    pub timeout: Duration,
    pub attempts: u32,
    pub timeout_task: JoinHandle<()>,
}

/// A timed-out send parked until a leader change or retry sweep resends it.
pub(crate) struct RetryEntry {
    pub kind: SendKind,
    pub payload: Value,
    pub responder: Option<Responder>,
    pub timeout: Duration,
    pub attempts: u32,
}

/// Sizes of a member's in-flight and parked queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    pub pending: usize,
    pub retry: usize,
}
