//! Member Module
//!
//! The user-facing participant handle. A member joins a channel, advertises
//! its handler capabilities, and from then on can talk to whichever member
//! currently leads the flock.
//!
//! ## Delivery guarantees
//! - Requests and leader messages are tracked in a pending table with a
//!   per-send timeout; a timed-out send parks in the retry queue.
//! - Leadership transitions and a periodic sweep drain the retry queue,
//!   resending each entry with its original request id.
//! - After the retry budget is spent, a request fails with a max-retries
//!   error; a one-way message is silently dropped.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
