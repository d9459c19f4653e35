//! Operator fusion negotiation.
//!
//! Fusion lets adjacent stages share a queue instead of re-queueing every
//! element. A downstream asks its upstream for a mode via
//! [`FusedSubscription::request_fusion`](crate::flow::FusedSubscription::request_fusion)
//! and the upstream answers with the mode it can actually honour:
//!
//! - [`FusionMode::Sync`]: the upstream is a finite, synchronous source
//!   exposed through `poll`; exhaustion is detected by `poll` returning
//!   `None`.
//! - [`FusionMode::Async`]: the upstream pushes into a shared queue and pokes
//!   the downstream with `on_ready`; the downstream drains via `poll` and
//!   termination is a terminal signal plus an empty queue.
//! - [`FusionMode::None`]: no sharing, standard push (`on_next`) and pull
//!   (`request`).

/// Outcome (and request vocabulary) of fusion negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FusionMode {
    /// Standard push/pull, no queue sharing.
    None = 0,

    /// Synchronous poll-driven fusion.
    Sync = 1,

    /// Asynchronous shared-queue fusion.
    Async = 2,

    /// Negotiation wildcard: the requester accepts either fused mode.
    Any = 3,
}

impl FusionMode {
    /// Returns true if this requested mode allows a SYNC answer.
    #[must_use]
    pub fn accepts_sync(self) -> bool {
        matches!(self, Self::Sync | Self::Any)
    }

    /// Returns true if this requested mode allows an ASYNC answer.
    #[must_use]
    pub fn accepts_async(self) -> bool {
        matches!(self, Self::Async | Self::Any)
    }

    /// Returns true if this is one of the fused answers.
    #[must_use]
    pub fn is_fused(self) -> bool {
        matches!(self, Self::Sync | Self::Async)
    }
}
