//! Prefetch operator configuration.

use std::sync::Arc;

use crate::queue::QueueFactory;

/// Default in-flight window when none is specified.
pub const DEFAULT_PREFETCH: usize = 32;

/// When the operator issues its initial upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Request the whole prefetch window during `on_subscribe`.
    #[default]
    Eager,

    /// Defer the initial request until the downstream first shows demand
    /// (first drain entry or first fused `poll`).
    Lazy,
}

/// Callback receiving every element that reached the operator but will never
/// reach the downstream (cancellation, overflow, terminal error).
pub type DiscardHook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Configuration for a [`Prefetch`](crate::prefetch::Prefetch) operator.
///
/// - `prefetch` sizes the in-flight window, the initial upstream request and
///   the default queue capacity. `usize::MAX` means unbounded.
/// - `low_tide` is the replenish threshold; `0` selects the default of
///   `prefetch - prefetch / 4`, and values above `prefetch` are clamped back
///   to the default. Smaller values mean more frequent, smaller upstream
///   requests.
/// - `request_mode` picks eager or lazy priming of the upstream.
pub struct PrefetchConfig<T> {
    /// Desired in-flight window. Must be positive.
    pub prefetch: usize,

    /// Replenish threshold; `0` selects the default.
    pub low_tide: usize,

    /// Initial-request policy.
    pub request_mode: RequestMode,

    pub(crate) queue_factory: Option<QueueFactory<T>>,
    pub(crate) on_discard: Option<DiscardHook<T>>,
}

impl<T> PrefetchConfig<T> {
    /// Creates a configuration with the given window and defaults otherwise.
    #[must_use]
    pub fn new(prefetch: usize) -> Self {
        Self {
            prefetch,
            ..Self::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> PrefetchConfigBuilder<T> {
        PrefetchConfigBuilder::default()
    }
}

impl<T> Default for PrefetchConfig<T> {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            low_tide: 0,
            request_mode: RequestMode::default(),
            queue_factory: None,
            on_discard: None,
        }
    }
}

impl<T> Clone for PrefetchConfig<T> {
    fn clone(&self) -> Self {
        Self {
            prefetch: self.prefetch,
            low_tide: self.low_tide,
            request_mode: self.request_mode,
            queue_factory: self.queue_factory.clone(),
            on_discard: self.on_discard.clone(),
        }
    }
}

impl<T> std::fmt::Debug for PrefetchConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchConfig")
            .field("prefetch", &self.prefetch)
            .field("low_tide", &self.low_tide)
            .field("request_mode", &self.request_mode)
            .field("custom_queue", &self.queue_factory.is_some())
            .field("discard_hook", &self.on_discard.is_some())
            .finish()
    }
}

/// Builder for [`PrefetchConfig`].
pub struct PrefetchConfigBuilder<T> {
    prefetch: Option<usize>,
    low_tide: Option<usize>,
    request_mode: Option<RequestMode>,
    queue_factory: Option<QueueFactory<T>>,
    on_discard: Option<DiscardHook<T>>,
}

impl<T> Default for PrefetchConfigBuilder<T> {
    fn default() -> Self {
        Self {
            prefetch: None,
            low_tide: None,
            request_mode: None,
            queue_factory: None,
            on_discard: None,
        }
    }
}

impl<T> PrefetchConfigBuilder<T> {
    /// Sets the in-flight window.
    #[must_use]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Sets the replenish threshold.
    #[must_use]
    pub fn low_tide(mut self, low_tide: usize) -> Self {
        self.low_tide = Some(low_tide);
        self
    }

    /// Sets the initial-request policy.
    #[must_use]
    pub fn request_mode(mut self, mode: RequestMode) -> Self {
        self.request_mode = Some(mode);
        self
    }

    /// Supplies the SPSC queue implementation.
    #[must_use]
    pub fn queue_factory(mut self, factory: QueueFactory<T>) -> Self {
        self.queue_factory = Some(factory);
        self
    }

    /// Installs a hook observing discarded elements.
    #[must_use]
    pub fn on_discard(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_discard = Some(Arc::new(hook));
        self
    }

    /// Builds the configuration. An out-of-range `low_tide` is clamped back
    /// to the default threshold.
    #[must_use]
    pub fn build(self) -> PrefetchConfig<T> {
        let prefetch = self.prefetch.unwrap_or(DEFAULT_PREFETCH);
        let low_tide = match self.low_tide {
            Some(low_tide) if low_tide <= prefetch => low_tide,
            _ => 0,
        };
        PrefetchConfig {
            prefetch,
            low_tide,
            request_mode: self.request_mode.unwrap_or_default(),
            queue_factory: self.queue_factory,
            on_discard: self.on_discard,
        }
    }
}
