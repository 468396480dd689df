use thiserror::Error;

use crate::flock::protocol::RequestId;

/// Failures that reach user code.
///
/// Everything else in the fabric is absorbed and retried internally:
/// transport serialization failures drop the envelope, malformed envelopes
/// are discarded, and leader-only methods called by followers are no-ops.
#[derive(Debug, Error)]
pub enum FlockError {
    /// A request was resent across leader changes and retry sweeps until the
    /// attempt budget ran out without any leader replying.
    #[error("max retries reached for request {0}")]
    MaxRetriesReached(RequestId),

    /// The pending entry was discarded before a response could arrive, e.g.
    /// because the sending member became leader itself or resigned.
    #[error("request {0} was abandoned before a response arrived")]
    Abandoned(RequestId),

    /// No transport capability is available for the channel. The only fatal
    /// error in the system; raised at flock construction.
    #[error("no usable transport for channel {0}")]
    TransportUnavailable(String),
}
