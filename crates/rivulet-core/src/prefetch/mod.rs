//! The prefetch operator.
//!
//! `Prefetch` interposes a bounded in-memory queue between an upstream
//! producer and a downstream consumer, decoupling their demand: the upstream
//! runs ahead by a fixed window while the downstream pulls at its own pace
//! with full backpressure.
//!
//! ```text
//! ┌──────────┐  on_next / on_ready   ┌─────────────────┐  on_next   ┌────────────┐
//! │ upstream │──────────────────────▶│    prefetch      │───────────▶│ downstream │
//! │          │◀──────────────────────│  window + drain  │◀───────────│            │
//! └──────────┘  request(prefetch),   └─────────────────┘  request(n) └────────────┘
//!               replenish(low tide)
//! ```
//!
//! One subscriber is created per subscription; it owns its queue, its demand
//! accounting and its lifecycle. Delivery to the downstream is serialised by
//! a lock-free work-in-progress counter — on contention the losing thread
//! records that more work exists and leaves, and the winning thread re-reads
//! state before it exits.
//!
//! The operator is itself fuseable: a downstream may negotiate ASYNC output
//! fusion and drain the window by `poll`, and a SYNC-fuseable upstream is
//! adopted as the queue outright (no buffering, no upstream requests).

mod subscriber;


use std::sync::Arc;

use crate::config::PrefetchConfig;
use crate::flow::{ConditionalSubscriber, Publisher, Subscriber};

use self::subscriber::PrefetchSubscriber;

/// Prefetch operator factory. See the [module docs](self).
pub struct Prefetch<T> {
    source: Arc<dyn Publisher<T>>,
    config: PrefetchConfig<T>,
}

impl<T: Send + 'static> Prefetch<T> {
    /// Wraps `source` with a prefetch window described by `config`.
    ///
    /// # Panics
    ///
    /// Panics if `config.prefetch` is 0.
    #[must_use]
    pub fn new(source: Arc<dyn Publisher<T>>, config: PrefetchConfig<T>) -> Self {
        assert!(config.prefetch > 0, "prefetch must be > 0");
        Self { source, config }
    }

    /// Wraps `source` with a window of `prefetch` and default settings.
    ///
    /// # Panics
    ///
    /// Panics if `prefetch` is 0.
    #[must_use]
    pub fn with_prefetch(source: Arc<dyn Publisher<T>>, prefetch: usize) -> Self {
        Self::new(source, PrefetchConfig::new(prefetch))
    }

    /// Subscribes a downstream that may decline elements without consuming
    /// demand (`try_on_next`).
    pub fn subscribe_conditional(&self, subscriber: Arc<dyn ConditionalSubscriber<T>>) {
        let inner = PrefetchSubscriber::conditional(subscriber, &self.config);
        self.source.subscribe(inner);
    }
}

impl<T: Send + 'static> Publisher<T> for Prefetch<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let inner = PrefetchSubscriber::plain(subscriber, &self.config);
        self.source.subscribe(inner);
    }
}
