//! Per-subscription state machine of the prefetch operator.
//!
//! Three independent signal sources feed one subscriber: upstream
//! (`on_next`/`on_ready`/`on_error`/`on_complete`), downstream demand
//! (`request`) and downstream cancellation (`cancel`), each possibly on its
//! own thread. A work-in-progress counter serialises the drain: the thread
//! that bumps `wip` from zero owns the loop; everyone else merely records
//! that more work exists. The owner re-reads `wip` before leaving and keeps
//! going until it can retire every recorded tick.
//!
//! Discard rules depend on who owns the queue:
//!
//! - ASYNC-fused upstream owns it: `clear()` only, never iterate from this
//!   side (the producer may still be writing).
//! - SYNC-fused or plain upstream: this subscriber owns consumption, so it
//!   polls every leftover element through the discard hook, under the wip
//!   guard (or `discard_guard` on the fused-downstream `clear` path).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::config::{DiscardHook, PrefetchConfig, RequestMode};
use crate::demand::{self, UNBOUNDED};
use crate::error::FlowError;
use crate::flow::{
    ConditionalSubscriber, FusedSubscription, Subscriber, Subscription, SubscriptionHandle,
};
use crate::fusion::FusionMode;
use crate::queue::{default_queue_factory, BoundedQueue, CachePadded, QueueFactory};

/// Where values come from after fusion negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SourceMode {
    /// Negotiation has not run yet.
    Unset = 0,
    /// Plain push upstream; this subscriber owns the queue.
    Push = 1,
    /// SYNC-fused upstream: a finite poll-driven source is the queue.
    Sync = 2,
    /// ASYNC-fused upstream: the upstream owns the queue and pokes
    /// `on_ready` after enqueueing.
    Async = 3,
}

impl From<u8> for SourceMode {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Push,
            2 => Self::Sync,
            3 => Self::Async,
            _ => Self::Unset,
        }
    }
}

/// The two downstream shapes, sharing one drain.
///
/// `emit` is the only place they differ: a plain downstream always consumes
/// demand, a conditional one only when it accepts the element.
pub(crate) enum Downstream<T> {
    Plain(Arc<dyn Subscriber<T>>),
    Conditional(Arc<dyn ConditionalSubscriber<T>>),
}

impl<T> Downstream<T> {
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>) {
        match self {
            Self::Plain(subscriber) => subscriber.on_subscribe(subscription),
            Self::Conditional(subscriber) => subscriber.on_subscribe(subscription),
        }
    }

    /// Delivers `value`; returns whether one unit of demand was consumed.
    fn emit(&self, value: T) -> bool {
        match self {
            Self::Plain(subscriber) => {
                subscriber.on_next(value);
                true
            }
            Self::Conditional(subscriber) => subscriber.try_on_next(value),
        }
    }

    fn on_ready(&self) {
        match self {
            Self::Plain(subscriber) => subscriber.on_ready(),
            Self::Conditional(subscriber) => subscriber.on_ready(),
        }
    }

    fn on_error(&self, error: FlowError) {
        match self {
            Self::Plain(subscriber) => subscriber.on_error(error),
            Self::Conditional(subscriber) => subscriber.on_error(error),
        }
    }

    fn on_complete(&self) {
        match self {
            Self::Plain(subscriber) => subscriber.on_complete(),
            Self::Conditional(subscriber) => subscriber.on_complete(),
        }
    }
}

/// The buffer between upstream and downstream: owned in push mode, borrowed
/// from the upstream when fused.
enum FlowQueue<T> {
    Own(Box<dyn BoundedQueue<T>>),
    Fused(Arc<dyn FusedSubscription<T>>),
}

impl<T> FlowQueue<T> {
    fn poll(&self) -> Result<Option<T>, FlowError> {
        match self {
            Self::Own(queue) => Ok(queue.poll()),
            Self::Fused(queue) => queue.poll(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Own(queue) => queue.is_empty(),
            Self::Fused(queue) => queue.is_empty(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Own(queue) => queue.len(),
            Self::Fused(queue) => queue.len(),
        }
    }

    /// Drops buffered elements without the discard hook.
    fn clear(&self) {
        match self {
            Self::Own(queue) => queue.clear(),
            Self::Fused(queue) => queue.clear(),
        }
    }
}

/// State machine for one prefetch subscription.
pub(crate) struct PrefetchSubscriber<T> {
    me: Weak<Self>,
    downstream: Downstream<T>,

    prefetch: usize,
    /// Replenish threshold; [`UNBOUNDED`] when the window is unbounded.
    limit: u64,
    request_mode: RequestMode,
    queue_factory: QueueFactory<T>,
    on_discard: Option<DiscardHook<T>>,

    /// Set once in `on_subscribe`.
    upstream: OnceLock<SubscriptionHandle<T>>,
    /// Set once during fusion negotiation / push-mode initialisation.
    queue: OnceLock<FlowQueue<T>>,
    source_mode: AtomicU8,
    output_fused: AtomicBool,
    /// LAZY policy: upstream not yet primed. Consumed under the wip guard
    /// (or on the fused poll path, which is single-consumer).
    first_request: AtomicBool,

    /// Outstanding downstream demand, saturating at [`UNBOUNDED`].
    requested: CachePadded<AtomicU64>,
    /// Work-in-progress counter; non-zero means a drain owner exists.
    wip: CachePadded<AtomicU32>,
    /// Serialises the fused-downstream `clear` against in-flight drains.
    discard_guard: AtomicU32,
    cancelled: AtomicBool,
    done: AtomicBool,
    /// Written before the release store of `done`; the `OnceLock` makes the
    /// publication explicit.
    error: OnceLock<FlowError>,

    /// Emission count carried across drain entries. Owned by the drain.
    produced: AtomicU64,
    /// Poll count carried across drain entries and the fused poll path.
    consumed: AtomicU64,
}

impl<T: Send + 'static> PrefetchSubscriber<T> {
    pub(crate) fn plain(
        subscriber: Arc<dyn Subscriber<T>>,
        config: &PrefetchConfig<T>,
    ) -> Arc<Self> {
        Self::new(Downstream::Plain(subscriber), config)
    }

    pub(crate) fn conditional(
        subscriber: Arc<dyn ConditionalSubscriber<T>>,
        config: &PrefetchConfig<T>,
    ) -> Arc<Self> {
        Self::new(Downstream::Conditional(subscriber), config)
    }

    fn new(downstream: Downstream<T>, config: &PrefetchConfig<T>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            downstream,
            prefetch: config.prefetch,
            limit: demand::unbounded_or_limit(config.prefetch, config.low_tide),
            request_mode: config.request_mode,
            queue_factory: config
                .queue_factory
                .clone()
                .unwrap_or_else(|| default_queue_factory(config.prefetch)),
            on_discard: config.on_discard.clone(),
            upstream: OnceLock::new(),
            queue: OnceLock::new(),
            source_mode: AtomicU8::new(SourceMode::Unset as u8),
            output_fused: AtomicBool::new(false),
            first_request: AtomicBool::new(true),
            requested: CachePadded::new(AtomicU64::new(0)),
            wip: CachePadded::new(AtomicU32::new(0)),
            discard_guard: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: OnceLock::new(),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        })
    }

    fn source_mode(&self) -> SourceMode {
        SourceMode::from(self.source_mode.load(Ordering::Acquire))
    }

    fn set_source_mode(&self, mode: SourceMode) {
        self.source_mode.store(mode as u8, Ordering::Release);
    }

    fn is_output_fused(&self) -> bool {
        self.output_fused.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn handle(&self) -> Option<SubscriptionHandle<T>> {
        let me = self.me.upgrade()?;
        let fused: Arc<dyn FusedSubscription<T>> = me;
        Some(SubscriptionHandle::Fused(fused))
    }

    fn upstream_request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    fn upstream_cancel(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    fn discard_value(&self, value: T) {
        match &self.on_discard {
            Some(hook) => hook(value),
            None => drop(value),
        }
    }

    fn discard(&self, value: Option<T>) {
        if let Some(value) = value {
            self.discard_value(value);
        }
    }

    fn queue_poll(&self) -> Result<Option<T>, FlowError> {
        self.queue.get().map_or(Ok(None), FlowQueue::poll)
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.get().map_or(true, FlowQueue::is_empty)
    }

    fn queue_clear_raw(&self) {
        if let Some(queue) = self.queue.get() {
            queue.clear();
        }
    }

    /// Reclaims everything still buffered. An ASYNC-fused queue belongs to
    /// the upstream producer, so it is cleared without iteration; otherwise
    /// leftovers go through the discard hook one by one.
    fn discard_queue(&self) {
        let Some(queue) = self.queue.get() else {
            return;
        };
        if self.source_mode() == SourceMode::Async {
            queue.clear();
            return;
        }
        loop {
            match queue.poll() {
                Ok(Some(value)) => self.discard_value(value),
                Ok(None) | Err(_) => break,
            }
        }
        queue.clear();
    }

    /// Cancellation-path discard, gated on who drains the queue afterwards.
    /// An output-fused downstream of a push-mode window still owns polling,
    /// so the queue is left for its `clear()`.
    fn discard_for_cancel(&self) {
        match (self.source_mode(), self.is_output_fused()) {
            (SourceMode::Async, _) | (SourceMode::Sync, true) => self.queue_clear_raw(),
            (_, true) => {}
            (_, false) => self.discard_queue(),
        }
    }

    /// LAZY priming: issue the first upstream request on the first drain
    /// entry or the first fused poll, for any source that takes requests.
    fn maybe_first_request(&self) {
        if self.request_mode == RequestMode::Lazy
            && self.source_mode() != SourceMode::Sync
            && self.first_request.swap(false, Ordering::AcqRel)
        {
            self.upstream_request(demand::unbounded_or_prefetch(self.prefetch));
        }
    }

    /// Push-mode initialisation: own queue plus eager priming.
    fn init_push(&self) {
        self.set_source_mode(SourceMode::Push);
        let _ = self.queue.set(FlowQueue::Own((self.queue_factory)()));
        if self.request_mode == RequestMode::Eager {
            self.upstream_request(demand::unbounded_or_prefetch(self.prefetch));
        }
    }

    /// Terminal failure raised by the operator itself.
    fn fail(&self, error: FlowError) {
        if self.is_done() {
            tracing::debug!(%error, "terminal error dropped");
            return;
        }
        let _ = self.error.set(error);
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    /// Drain entry point. The thread that moves `wip` off zero owns the
    /// loop; contenders just record the tick. A contender observing
    /// cancellation clears an ASYNC-fused queue on the owner's behalf (the
    /// upstream holds no reference that would otherwise reclaim it).
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            if self.is_cancelled() && self.source_mode() == SourceMode::Async {
                self.queue_clear_raw();
            }
            return;
        }
        self.drain_for_mode();
    }

    /// Dispatch for a thread that already owns the wip guard.
    fn drain_for_mode(&self) {
        self.maybe_first_request();
        if self.is_output_fused() {
            self.drain_output();
        } else if self.source_mode() == SourceMode::Sync {
            self.drain_sync();
        } else {
            self.drain_async();
        }
    }

    /// Drain for push-mode and ASYNC-fused sources.
    fn drain_async(&self) {
        let mut emitted = self.produced.load(Ordering::Relaxed);
        let mut polled = self.consumed.load(Ordering::Relaxed);
        let mut missed = 1u32;

        loop {
            let mut requested = self.requested.load(Ordering::Acquire);

            while emitted != requested {
                // Terminal state must be read before the poll: seeing `done`
                // here guarantees every preceding offer is visible below.
                let done = self.is_done();

                let mut value = match self.queue_poll() {
                    Ok(value) => value,
                    Err(error) => {
                        self.upstream_cancel();
                        self.discard_queue();
                        self.downstream.on_error(error);
                        return;
                    }
                };
                let empty = value.is_none();

                if self.check_terminated(done, empty, &mut value) {
                    return;
                }
                let Some(value) = value else {
                    break;
                };

                if self.downstream.emit(value) {
                    emitted += 1;
                }
                polled += 1;

                if polled == self.limit {
                    if requested != UNBOUNDED {
                        requested = demand::produced(self.requested.get(), emitted);
                    }
                    self.upstream_request(polled);
                    emitted = 0;
                    polled = 0;
                }
            }

            if emitted == requested {
                let done = self.is_done();
                let mut nothing = None;
                if self.check_terminated(done, self.queue_is_empty(), &mut nothing) {
                    return;
                }
            }

            let wip = self.wip.load(Ordering::Acquire);
            if missed == wip {
                self.produced.store(emitted, Ordering::Relaxed);
                self.consumed.store(polled, Ordering::Relaxed);
                missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
                if missed == 0 {
                    break;
                }
            } else {
                missed = wip;
            }
        }
    }

    /// Drain for a SYNC-fused source: poll-driven, no upstream requests,
    /// completion when the source runs dry.
    fn drain_sync(&self) {
        let mut emitted = self.produced.load(Ordering::Relaxed);
        let mut missed = 1u32;

        loop {
            let requested = self.requested.load(Ordering::Acquire);

            while emitted != requested {
                let value = match self.queue_poll() {
                    Ok(value) => value,
                    Err(error) => {
                        self.upstream_cancel();
                        self.discard_queue();
                        self.downstream.on_error(error);
                        return;
                    }
                };

                if self.is_cancelled() {
                    self.discard(value);
                    self.discard_queue();
                    return;
                }
                let Some(value) = value else {
                    self.downstream.on_complete();
                    return;
                };

                if self.downstream.emit(value) {
                    emitted += 1;
                }
            }

            if self.is_cancelled() {
                self.discard_queue();
                return;
            }
            if self.queue_is_empty() {
                self.downstream.on_complete();
                return;
            }

            let wip = self.wip.load(Ordering::Acquire);
            if missed == wip {
                self.produced.store(emitted, Ordering::Relaxed);
                missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
                if missed == 0 {
                    break;
                }
            } else {
                missed = wip;
            }
        }
    }

    /// Drain for an output-fused downstream: signal availability once per
    /// pass and let the downstream poll, forwarding terminals.
    fn drain_output(&self) {
        let mut missed = 1u32;

        loop {
            if self.is_cancelled() {
                FusedSubscription::clear(self);
                return;
            }

            self.downstream.on_ready();

            if self.is_done() {
                match self.error.get() {
                    Some(error) => self.downstream.on_error(error.clone()),
                    None => self.downstream.on_complete(),
                }
                return;
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    /// Terminal decision for the async drain. `value` is an element polled
    /// but not yet emitted; on a terminal outcome it is discarded together
    /// with the queue.
    fn check_terminated(&self, done: bool, empty: bool, value: &mut Option<T>) -> bool {
        if self.is_cancelled() {
            self.discard(value.take());
            self.discard_queue();
            return true;
        }
        if done {
            if let Some(error) = self.error.get() {
                self.discard(value.take());
                self.discard_queue();
                self.downstream.on_error(error.clone());
                return true;
            }
            if empty {
                self.downstream.on_complete();
                return true;
            }
        }
        false
    }
}

impl<T: Send + 'static> Subscriber<T> for PrefetchSubscriber<T> {
    fn on_subscribe(&self, subscription: SubscriptionHandle<T>) {
        if self.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            tracing::warn!("second subscription rejected");
            self.fail(FlowError::AlreadySubscribed);
            return;
        }

        // Hold the drain shut while the downstream learns about us and
        // fusion is negotiated.
        self.wip.store(1, Ordering::Release);

        let Some(handle) = self.handle() else {
            return;
        };
        self.downstream.on_subscribe(handle);

        if self.is_cancelled() {
            self.discard_for_cancel();
            return;
        }

        if self.source_mode() == SourceMode::Unset {
            // The downstream did not fuse; negotiate with the upstream.
            match self.upstream.get().and_then(SubscriptionHandle::fused) {
                Some(fused) => match fused.request_fusion(FusionMode::Any) {
                    FusionMode::Sync => {
                        self.set_source_mode(SourceMode::Sync);
                        let _ = self.queue.set(FlowQueue::Fused(Arc::clone(fused)));
                        // A SYNC source terminates by running dry, not by a
                        // terminal signal.
                        self.done.store(true, Ordering::Release);
                    }
                    FusionMode::Async => {
                        self.set_source_mode(SourceMode::Async);
                        let _ = self.queue.set(FlowQueue::Fused(Arc::clone(fused)));
                        if self.request_mode == RequestMode::Eager {
                            self.upstream_request(demand::unbounded_or_prefetch(self.prefetch));
                        }
                    }
                    _ => self.init_push(),
                },
                None => self.init_push(),
            }
        } else if self.request_mode == RequestMode::Eager
            && self.source_mode() != SourceMode::Sync
        {
            self.upstream_request(demand::unbounded_or_prefetch(self.prefetch));
        }

        // Single release point for the initialisation guard: either nothing
        // happened during setup and the drain opens idle, or this thread
        // inherits the recorded work and runs it now.
        if self.wip.load(Ordering::Acquire) == 1 && self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
            return;
        }
        self.drain_for_mode();
    }

    fn on_next(&self, value: T) {
        if self.is_done() {
            tracing::debug!("value dropped after terminal signal");
            return;
        }
        if self.is_cancelled() {
            self.discard(Some(value));
            return;
        }

        match self.queue.get() {
            Some(FlowQueue::Own(queue)) => {
                if let Err(value) = queue.offer(value) {
                    // The upstream ran past the window it was granted.
                    self.discard(Some(value));
                    self.upstream_cancel();
                    tracing::warn!(prefetch = self.prefetch, "prefetch queue overflow");
                    self.fail(FlowError::Overflow(self.prefetch));
                    return;
                }
            }
            _ => {
                // Fused upstreams enqueue on their own side and poke
                // `on_ready`; a pushed value has nowhere to go.
                self.discard(Some(value));
                return;
            }
        }
        self.drain();
    }

    fn on_ready(&self) {
        self.drain();
    }

    fn on_error(&self, error: FlowError) {
        self.fail(error);
    }

    fn on_complete(&self) {
        if self.is_done() {
            return;
        }
        self.done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T: Send + 'static> Subscription for PrefetchSubscriber<T> {
    fn request(&self, n: u64) {
        match demand::validate(n) {
            Ok(n) => {
                demand::add_cap(self.requested.get(), n);
                self.drain();
            }
            Err(error) => {
                tracing::warn!("non-positive request");
                self.upstream_cancel();
                self.fail(error);
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream_cancel();

        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.discard_for_cancel();
        }
    }
}

impl<T: Send + 'static> FusedSubscription<T> for PrefetchSubscriber<T> {
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        let fused = self.upstream.get().and_then(SubscriptionHandle::fused);
        let upstream_mode = match &fused {
            Some(upstream) => upstream.request_fusion(requested),
            None => FusionMode::None,
        };

        match (upstream_mode, fused) {
            (FusionMode::Sync, Some(upstream)) => {
                self.set_source_mode(SourceMode::Sync);
                let _ = self.queue.set(FlowQueue::Fused(Arc::clone(upstream)));
                self.output_fused.store(true, Ordering::Release);
                self.done.store(true, Ordering::Release);
                FusionMode::Sync
            }
            (FusionMode::Async, Some(upstream)) => {
                self.set_source_mode(SourceMode::Async);
                let _ = self.queue.set(FlowQueue::Fused(Arc::clone(upstream)));
                self.output_fused.store(true, Ordering::Release);
                FusionMode::Async
            }
            _ => {
                self.set_source_mode(SourceMode::Push);
                let _ = self.queue.set(FlowQueue::Own((self.queue_factory)()));
                if requested.accepts_async() {
                    self.output_fused.store(true, Ordering::Release);
                    FusionMode::Async
                } else {
                    FusionMode::None
                }
            }
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        self.maybe_first_request();

        let value = self.queue_poll()?;
        if value.is_some() && self.source_mode() != SourceMode::Sync {
            let consumed = self.consumed.load(Ordering::Relaxed) + 1;
            if consumed == self.limit {
                self.consumed.store(0, Ordering::Relaxed);
                self.upstream_request(self.limit);
            } else {
                self.consumed.store(consumed, Ordering::Relaxed);
            }
        }
        Ok(value)
    }

    fn is_empty(&self) -> bool {
        self.queue_is_empty()
    }

    fn len(&self) -> usize {
        self.queue.get().map_or(0, FlowQueue::len)
    }

    fn clear(&self) {
        if self.source_mode() == SourceMode::Async {
            // The upstream owns the queue; it guarantees a safe clear.
            self.queue_clear_raw();
            return;
        }

        // A downstream clear may race an in-flight drain's own discard; the
        // guard turns the overlap into a second pass by the first caller.
        if self.discard_guard.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1u32;
        loop {
            self.discard_queue();

            let guard = self.discard_guard.load(Ordering::Acquire);
            if missed == guard {
                missed = self.discard_guard.fetch_sub(missed, Ordering::AcqRel) - missed;
                if missed == 0 {
                    break;
                }
            } else {
                missed = guard;
            }
        }
    }
}

impl<T> Drop for PrefetchSubscriber<T> {
    fn drop(&mut self) {
        // Anything still buffered was delivered to the operator but never
        // reached the downstream; hand it to the discard hook.
        if let (Some(FlowQueue::Own(queue)), Some(hook)) = (self.queue.get(), &self.on_discard) {
            while let Some(value) = queue.poll() {
                hook(value);
            }
        }
    }
}
