//! Reactive flow contracts.
//!
//! The protocol is the usual reactive-streams handshake: a [`Publisher`]
//! accepts a [`Subscriber`], hands it a [`SubscriptionHandle`] exactly once,
//! then delivers at most as many `on_next` calls as the subscriber has
//! requested, followed by at most one terminal signal (`on_error` or
//! `on_complete`). Signals to a given subscriber are serialised; `request`
//! and `cancel` may arrive from any thread.
//!
//! Fuseable stages additionally expose [`FusedSubscription`], which lets the
//! downstream negotiate queue sharing (see [`crate::fusion`]) and then drain
//! by `poll` instead of receiving pushed values.

use std::sync::Arc;

use crate::error::FlowError;
use crate::fusion::FusionMode;

/// Link from a subscriber back to its upstream.
pub trait Subscription: Send + Sync {
    /// Asks the upstream for `n` more elements. `n` must be positive;
    /// implementations surface a [`FlowError::InvalidRequest`] downstream
    /// when it is not.
    fn request(&self, n: u64);

    /// Tells the upstream to stop producing and release resources.
    /// Idempotent and safe from any thread.
    fn cancel(&self);
}

/// A subscription that can additionally act as a shared queue.
///
/// `poll`, `len`, `is_empty` and `clear` are only meaningful after
/// [`request_fusion`](Self::request_fusion) has negotiated a fused mode.
pub trait FusedSubscription<T>: Subscription {
    /// Negotiates a fusion mode. The answer is at most what `requested`
    /// allows and what the stage can honour; [`FusionMode::None`] declines.
    fn request_fusion(&self, requested: FusionMode) -> FusionMode;

    /// Dequeues the next element.
    ///
    /// In SYNC mode, `Ok(None)` means the source is exhausted. In ASYNC mode
    /// it merely means the queue is momentarily empty.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying source, if any.
    fn poll(&self) -> Result<Option<T>, FlowError>;

    /// Returns true if no element is currently available.
    fn is_empty(&self) -> bool;

    /// Number of currently buffered elements.
    fn len(&self) -> usize;

    /// Discards everything still buffered.
    fn clear(&self);
}

/// Either a plain subscription or a fuseable one.
///
/// Rust has no downcast-based capability discovery, so the handshake carries
/// the capability in the handle itself.
pub enum SubscriptionHandle<T> {
    /// Push/pull only.
    Plain(Arc<dyn Subscription>),
    /// Queue-sharing capable.
    Fused(Arc<dyn FusedSubscription<T>>),
}

impl<T> SubscriptionHandle<T> {
    /// Requests `n` more elements from the upstream.
    pub fn request(&self, n: u64) {
        match self {
            Self::Plain(subscription) => subscription.request(n),
            Self::Fused(subscription) => subscription.request(n),
        }
    }

    /// Cancels the upstream.
    pub fn cancel(&self) {
        match self {
            Self::Plain(subscription) => subscription.cancel(),
            Self::Fused(subscription) => subscription.cancel(),
        }
    }

    /// Returns the fuseable surface, if the upstream has one.
    #[must_use]
    pub fn fused(&self) -> Option<&Arc<dyn FusedSubscription<T>>> {
        match self {
            Self::Plain(_) => None,
            Self::Fused(subscription) => Some(subscription),
        }
    }
}

impl<T> Clone for SubscriptionHandle<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(subscription) => Self::Plain(Arc::clone(subscription)),
            Self::Fused(subscription) => Self::Fused(Arc::clone(subscription)),
        }
    }
}

impl<T> std::fmt::Debug for SubscriptionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("SubscriptionHandle::Plain"),
            Self::Fused(_) => f.write_str("SubscriptionHandle::Fused"),
        }
    }
}

/// Receiver side of a flow.
pub trait Subscriber<T>: Send + Sync {
    /// Called exactly once, before any other signal.
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>);

    /// Delivers the next element. Never called after a terminal signal, and
    /// never beyond the requested demand.
    fn on_next(&self, value: T);

    /// Fusion poke: "data may be available, come `poll`".
    ///
    /// Only delivered to subscribers that negotiated ASYNC output fusion
    /// (and by ASYNC-fused upstreams to their operator). Plain subscribers
    /// can ignore it.
    fn on_ready(&self) {}

    /// Terminal failure. At most one terminal signal is ever delivered.
    fn on_error(&self, error: FlowError);

    /// Terminal completion. At most one terminal signal is ever delivered.
    fn on_complete(&self);
}

/// A subscriber that may decline an element without consuming demand.
///
/// `try_on_next` returning `false` means "processed but not counted": the
/// upstream window moves on, the downstream demand does not shrink.
pub trait ConditionalSubscriber<T>: Subscriber<T> {
    /// Offers `value`; returns whether it consumed one unit of demand.
    fn try_on_next(&self, value: T) -> bool;
}

/// Producer side of a flow. One subscriber per `subscribe` call.
pub trait Publisher<T>: Send + Sync {
    /// Wires `subscriber` to this publisher.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}
