//! # rivulet
//!
//! Reactive-streams building blocks centred on a prefetch operator: a
//! one-in-one-out stage that keeps a bounded in-memory window between an
//! upstream producer and a downstream consumer so each side runs at its own
//! pace, with full backpressure.
//!
//! This crate provides:
//! - **Flow contracts**: `Publisher` / `Subscriber` / `Subscription` with
//!   serialised signals and explicit demand
//! - **Fusion**: queue-sharing negotiation between adjacent stages
//!   (`SYNC` poll-driven, `ASYNC` poke-and-poll)
//! - **Prefetch operator**: lock-free drain loop built on a work-in-progress
//!   counter, eager/lazy window priming, low-tide replenishment, per-element
//!   discard accounting
//! - **Queues**: a lock-free SPSC ring with exact capacity plus an unbounded
//!   fallback
//!
//! ## Design principles
//!
//! 1. **No locks on the hot path** - atomics and a wip counter serialise the
//!    drain; contenders never block
//! 2. **No owned threads** - the operator reacts on whichever thread calls it
//! 3. **Per-subscription state only** - nothing process-wide
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rivulet_core::{from_iter, Prefetch, PrefetchConfig, RequestMode};
//!
//! let source = Arc::new(from_iter(0..10_000u64));
//! let config = PrefetchConfig::builder()
//!     .prefetch(256)
//!     .low_tide(192)
//!     .request_mode(RequestMode::Eager)
//!     .build();
//!
//! Prefetch::new(source, config).subscribe(my_subscriber);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Allow unsafe in the queue module for the lock-free ring.
#![allow(unsafe_code)]

pub mod config;
pub mod demand;
pub mod error;
pub mod flow;
pub mod fusion;
pub mod prefetch;
pub mod queue;
pub mod source;

// Re-export key types
pub use config::{PrefetchConfig, RequestMode, DEFAULT_PREFETCH};
pub use error::FlowError;
pub use flow::{
    ConditionalSubscriber, FusedSubscription, Publisher, Subscriber, Subscription,
    SubscriptionHandle,
};
pub use fusion::FusionMode;
pub use prefetch::Prefetch;
pub use queue::{BoundedQueue, QueueFactory, SpscQueue, UnboundedQueue};
pub use source::{from_iter, FromIter};
