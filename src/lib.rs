//! Intra-Host Leader Election and Coordination Fabric
//!
//! This library crate coordinates a "flock" of cooperating members that
//! share a broadcast medium inside one host. Exactly one member at a time
//! is the leader and handles the flock's critical work; the others follow
//! and route their requests to it.
//!
//! ## Architecture Modules
//! The fabric is composed of three loosely coupled subsystems:
//!
//! - **`flock`**: The per-channel coordinator. Owns the election state
//!   machine (claim / heartbeat / resign), the failure-detector timers, the
//!   member registry, and message dispatch, plus the multiton registry that
//!   maps channel names to coordinators.
//! - **`member`**: The user-facing participant. Tracks in-flight requests
//!   and messages, enforces per-send timeouts, and retries across leader
//!   transitions until a response arrives or the retry budget is spent.
//! - **`transport`**: The pub/sub medium abstraction with self-loopback.
//!   Prefers the in-process broadcast bus, falls back to a shared
//!   key-value store with change notifications, and degrades to pure
//!   loopback when neither is available.

pub mod error;
pub mod flock;
pub mod member;
pub mod transport;

pub use error::FlockError;
pub use flock::protocol::RequestId;
pub use flock::registry::FlockRegistry;
pub use flock::service::Flock;
pub use flock::types::{
    FlockConfig, FlockSnapshot, IncomingKind, IncomingMessage, MemberCallbacks, MemberId,
    DEFAULT_CHANNEL,
};
pub use member::service::Member;
pub use member::types::QueueDepths;
pub use transport::TransportCapabilities;
