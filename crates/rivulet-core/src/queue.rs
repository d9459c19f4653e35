//! Bounded FIFO queues for operator buffering.
//!
//! The prefetch operator buffers in-flight elements in a single-producer
//! single-consumer queue: the upstream thread offers, whichever thread
//! currently owns the drain polls. [`BoundedQueue`] is the contract the
//! operator needs; [`SpscQueue`] is the default lock-free implementation and
//! [`UnboundedQueue`] backs the unbounded-window case.
//!
//! ## Design
//!
//! - Cache-line padded head/tail indices prevent false sharing
//! - Power-of-2 slot count for fast modulo via bitmask
//! - Acquire/Release memory ordering for lock-free operation
//! - Exact caller-visible capacity: a queue built for `capacity` elements
//!   accepts exactly that many offers before rejecting

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A wrapper that pads a value to a cache line boundary to prevent false
/// sharing between producer-side and consumer-side fields.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Returns a reference to the inner value.
    #[must_use]
    pub const fn get(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

/// Single-producer single-consumer bounded FIFO.
///
/// Exactly one thread may call [`offer`](Self::offer) at a time and exactly
/// one thread may call [`poll`](Self::poll)/[`clear`](Self::clear) at a time;
/// the two sides may run concurrently with each other.
pub trait BoundedQueue<T>: Send + Sync {
    /// Enqueues `value`, or hands it back if the queue is at capacity.
    ///
    /// # Errors
    ///
    /// Returns the rejected value when the queue is full.
    fn offer(&self, value: T) -> Result<(), T>;

    /// Dequeues the oldest element, or `None` if the queue is empty.
    fn poll(&self) -> Option<T>;

    /// Number of buffered elements. A concurrent snapshot.
    fn len(&self) -> usize;

    /// Returns true if no elements are buffered. A concurrent snapshot.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered elements.
    fn capacity(&self) -> usize;

    /// Drops every buffered element. Consumer-side operation.
    fn clear(&self);
}

/// Factory producing one queue per subscription.
pub type QueueFactory<T> = Arc<dyn Fn() -> Box<dyn BoundedQueue<T>> + Send + Sync>;

/// Returns the queue factory used when the caller does not supply one:
/// a lock-free [`SpscQueue`] of the given capacity, or an [`UnboundedQueue`]
/// when the capacity is `usize::MAX`.
pub fn default_queue_factory<T: Send + 'static>(capacity: usize) -> QueueFactory<T> {
    Arc::new(move || {
        if capacity == usize::MAX {
            Box::new(UnboundedQueue::new())
        } else {
            Box::new(SpscQueue::new(capacity))
        }
    })
}

/// A lock-free single-producer single-consumer bounded queue.
///
/// Head and tail are monotonically increasing counters; the slot index is
/// the counter masked by the (power-of-2) slot count. One extra slot is
/// allocated so the full/empty distinction never costs a usable slot and the
/// queue holds exactly `capacity` elements.
///
/// # Safety
///
/// Safe only with one producer thread and one consumer thread at a time.
/// Multiple concurrent producers or consumers cause data races.
pub struct SpscQueue<T> {
    /// Ring storage.
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Consumer cursor (monotonic).
    head: CachePadded<AtomicUsize>,
    /// Producer cursor (monotonic).
    tail: CachePadded<AtomicUsize>,
    /// Slot-count mask for fast modulo.
    mask: usize,
    /// Caller-visible capacity.
    capacity: usize,
}

// SAFETY: the queue hands elements across threads, so T must be Send; the
// head/tail protocol makes concurrent one-producer/one-consumer access sound.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for SpscQueue<T> {}

// SAFETY: same as above; shared references only expose the SPSC protocol.
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Creates a queue that accepts exactly `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");

        let slots = capacity
            .saturating_add(1)
            .next_power_of_two();
        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> =
            (0..slots).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: slots - 1,
            capacity,
        }
    }

    fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.capacity {
            return Err(value);
        }

        // SAFETY: We have exclusive write access to this slot because:
        // 1. We are the only producer
        // 2. The consumer only reads slots where head < tail
        // 3. We haven't published this slot yet (tail not updated)
        #[allow(unsafe_code)]
        unsafe {
            (*self.buffer[tail & self.mask].get()).write(value);
        }

        // Publish the element by updating tail.
        self.tail.store(tail.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);

        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: We have exclusive read access to this slot because:
        // 1. We are the only consumer
        // 2. The producer only writes to slots where tail > head
        // 3. This slot has been published (we checked tail > head)
        #[allow(unsafe_code)]
        let value = unsafe { (*self.buffer[head & self.mask].get()).assume_init_read() };

        // Release the slot by updating head.
        self.head.store(head.wrapping_add(1), Ordering::Release);

        Some(value)
    }
}

impl<T: Send> BoundedQueue<T> for SpscQueue<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        self.push(value)
    }

    fn poll(&self) -> Option<T> {
        self.pop()
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        while self.pop().is_some() {}
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        // Drop any elements still buffered.
        while self.pop().is_some() {}
    }
}

impl<T: Send> std::fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscQueue")
            .field("capacity", &self.capacity)
            .field("len", &BoundedQueue::len(self))
            .finish()
    }
}

/// Growable FIFO for unbounded prefetch windows.
///
/// A mutex-backed `VecDeque`; contention is one producer against one
/// consumer, and the unbounded window is the cold configuration, so a lock
/// is the simpler trade here.
pub struct UnboundedQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> UnboundedQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> BoundedQueue<T> for UnboundedQueue<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        self.items.lock().push_back(value);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn clear(&self) {
        self.items.lock().clear();
    }
}
