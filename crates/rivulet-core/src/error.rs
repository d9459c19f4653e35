//! Error types for the flow layer.

use std::sync::Arc;

/// Errors delivered through a flow's terminal `on_error` signal.
///
/// Terminal errors are stored once per subscription and may be observed from
/// more than one code path (drain, fused `poll`, late inspection), so the
/// type is cheaply cloneable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// `request` was called with a demand of zero.
    #[error("request amount must be positive")]
    InvalidRequest,

    /// A bounded queue rejected an element: the upstream produced beyond the
    /// negotiated prefetch window.
    #[error("backpressure overflow: prefetch window of {0} exceeded")]
    Overflow(usize),

    /// A subscription arrived for a subscriber that is already wired to an
    /// upstream.
    #[error("upstream already subscribed")]
    AlreadySubscribed,

    /// Failure raised by a source while producing or being polled.
    #[error("{0}")]
    Source(Arc<dyn std::error::Error + Send + Sync>),

    /// Free-form failure description.
    #[error("{0}")]
    Message(Arc<str>),
}

impl FlowError {
    /// Wraps an arbitrary error for delivery through the flow.
    pub fn source<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Source(Arc::new(error))
    }

    /// Builds an error from a plain message.
    pub fn message(message: impl Into<Arc<str>>) -> Self {
        Self::Message(message.into())
    }
}
