//! Source constructors.
//!
//! [`from_iter`] turns any cloneable collection into a publisher. The
//! subscription it hands out is fuseable: a downstream that negotiates
//! [`FusionMode::Sync`] drains the iterator by `poll` and never issues
//! upstream requests; a downstream that stays plain gets a push-mode
//! trampoline honouring its demand.

use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::demand;
use crate::error::FlowError;
use crate::flow::{FusedSubscription, Publisher, Subscriber, Subscription, SubscriptionHandle};
use crate::fusion::FusionMode;

/// Creates a publisher replaying `collection` to every subscriber.
///
/// Each subscription iterates a fresh clone, so the publisher can be
/// subscribed any number of times.
pub fn from_iter<C>(collection: C) -> FromIter<C>
where
    C: IntoIterator + Clone + Send + Sync + 'static,
    C::IntoIter: Send + 'static,
    C::Item: Send + 'static,
{
    FromIter { collection }
}

/// Publisher over a cloneable collection. See [`from_iter`].
#[derive(Debug, Clone)]
pub struct FromIter<C> {
    collection: C,
}

impl<C> Publisher<C::Item> for FromIter<C>
where
    C: IntoIterator + Clone + Send + Sync + 'static,
    C::IntoIter: Send + 'static,
    C::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<C::Item>>) {
        let subscription = Arc::new(IterSubscription {
            iter: Mutex::new(Some(self.collection.clone().into_iter().peekable())),
            downstream: Arc::clone(&subscriber),
            requested: AtomicU64::new(0),
            produced: AtomicU64::new(0),
            wip: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            fused: AtomicBool::new(false),
        });
        subscriber.on_subscribe(SubscriptionHandle::Fused(subscription));
    }
}

struct IterSubscription<I: Iterator> {
    /// `None` once cleared.
    iter: Mutex<Option<Peekable<I>>>,
    downstream: Arc<dyn Subscriber<I::Item>>,
    requested: AtomicU64,
    /// Emission counter carried across push-mode drain entries.
    produced: AtomicU64,
    wip: AtomicU32,
    cancelled: AtomicBool,
    fused: AtomicBool,
}

impl<I> IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn next(&self) -> Option<I::Item> {
        self.iter.lock().as_mut().and_then(Iterator::next)
    }

    fn exhausted(&self) -> bool {
        self.iter.lock().as_mut().map_or(true, |iter| iter.peek().is_none())
    }

    /// Push-mode emission loop, serialised by the wip counter.
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut emitted = self.produced.load(Ordering::Relaxed);
        let mut missed = 1u32;
        loop {
            let requested = self.requested.load(Ordering::Acquire);

            while emitted != requested {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                match self.next() {
                    Some(value) => {
                        self.downstream.on_next(value);
                        emitted += 1;
                    }
                    None => {
                        self.downstream.on_complete();
                        return;
                    }
                }
            }

            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            if self.exhausted() {
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
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request(&self, n: u64) {
        if self.fused.load(Ordering::Acquire) {
            // A SYNC-fused downstream drains by poll; demand is meaningless.
            return;
        }
        match demand::validate(n) {
            Ok(n) => {
                demand::add_cap(&self.requested, n);
                self.drain();
            }
            Err(error) => {
                self.cancel();
                self.downstream.on_error(error);
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<I> FusedSubscription<I::Item> for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request_fusion(&self, requested: FusionMode) -> FusionMode {
        if requested.accepts_sync() {
            self.fused.store(true, Ordering::Release);
            FusionMode::Sync
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<I::Item>, FlowError> {
        Ok(self.next())
    }

    fn is_empty(&self) -> bool {
        self.exhausted()
    }

    fn len(&self) -> usize {
        self.iter.lock().as_ref().map_or(0, |iter| iter.size_hint().0)
    }

    fn clear(&self) {
        *self.iter.lock() = None;
    }
}
