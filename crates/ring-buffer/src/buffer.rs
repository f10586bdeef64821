//! Lock-Free Ring Buffer Implementation

use crate::error::BufferError;
use crate::line::{consume_end, scan_token};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity ring buffer with `S` slots, `S - 1` of them usable.
///
/// One slot stays free so that "empty" (`push_idx == pop_idx`) and "full"
/// (`next(push_idx) == pop_idx`) are told apart by cursor comparison alone.
/// Methods taking `&mut self` are for exclusive use; [`RingBuffer::split`]
/// hands the two cursors to separate execution contexts.
pub struct RingBuffer<T, const S: usize> {
    /// Pre-allocated storage
    storage: Box<[UnsafeCell<T>]>,
    /// Write cursor, only advanced by the producer
    push_idx: AtomicUsize,
    /// Read cursor, only advanced by the consumer
    pop_idx: AtomicUsize,
}

// SAFETY: slots are only written by the single producer outside the occupied
// region and only read by the single consumer inside it. Cursor publication
// uses release/acquire pairs so a slot is fully written before it becomes
// visible. Producer and consumer roles are enforced by `&mut self` or by the
// non-cloneable split handles.
unsafe impl<T: Send, const S: usize> Sync for RingBuffer<T, S> {}

impl<T: Copy + Default, const S: usize> RingBuffer<T, S> {
    const MIN_SLOTS: () = assert!(S >= 2, "ring buffer needs at least two slots");

    /// Create an empty ring buffer with default-filled storage
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::MIN_SLOTS;

        let storage: Vec<UnsafeCell<T>> = (0..S).map(|_| UnsafeCell::new(T::default())).collect();
        Self {
            storage: storage.into_boxed_slice(),
            push_idx: AtomicUsize::new(0),
            pop_idx: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) const fn next_idx(idx: usize) -> usize {
        (idx + 1) % S
    }

    /// Usable capacity (`S - 1`)
    pub const fn capacity(&self) -> usize {
        S - 1
    }

    /// Number of elements waiting to be popped
    pub fn available(&self) -> usize {
        let push = self.push_idx.load(Ordering::Acquire);
        let pop = self.pop_idx.load(Ordering::Acquire);
        (push + S - pop) % S
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.push_idx.load(Ordering::Acquire) == self.pop_idx.load(Ordering::Acquire)
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        Self::next_idx(self.push_idx.load(Ordering::Acquire)) == self.pop_idx.load(Ordering::Acquire)
    }

    /// Push a value, failing when no slot is free
    pub fn push(&mut self, value: T) -> Result<(), BufferError> {
        // SAFETY: `&mut self` makes this the only producer.
        unsafe { self.enqueue(value) }
    }

    /// Push a value, evicting the oldest element when full
    pub fn force_push(&mut self, value: T) -> Option<T> {
        // SAFETY: `&mut self` makes this the only producer and consumer.
        unsafe {
            let evicted = if self.is_full() { self.dequeue() } else { None };
            // Cannot fail: a slot was freed above if needed
            let _ = self.enqueue(value);
            evicted
        }
    }

    /// Remove and return the oldest element
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: `&mut self` makes this the only consumer.
        unsafe { self.dequeue() }
    }

    /// Return the oldest element without removing it
    pub fn peek(&self) -> Option<T> {
        let pop = self.pop_idx.load(Ordering::Relaxed);
        if pop == self.push_idx.load(Ordering::Acquire) {
            return None;
        }
        Some(self.slot(pop))
    }

    /// Reset both cursors to zero. Stored payload is left in place.
    pub fn clear(&mut self) {
        self.push_idx.store(0, Ordering::Release);
        self.pop_idx.store(0, Ordering::Release);
    }

    /// Write one element at the push cursor and publish it.
    ///
    /// # Safety
    /// Caller must be the only producer for the lifetime of the call.
    pub(crate) unsafe fn enqueue(&self, value: T) -> Result<(), BufferError> {
        let push = self.push_idx.load(Ordering::Relaxed);
        let next = Self::next_idx(push);
        if next == self.pop_idx.load(Ordering::Acquire) {
            return Err(BufferError::Full {
                capacity: self.capacity(),
            });
        }

        // The slot at `push` is outside the occupied region, so the consumer
        // does not touch it until the store below publishes it.
        *self.storage[push].get() = value;
        self.push_idx.store(next, Ordering::Release);
        Ok(())
    }

    /// Read the element at the pop cursor and release its slot.
    ///
    /// # Safety
    /// Caller must be the only consumer for the lifetime of the call.
    pub(crate) unsafe fn dequeue(&self) -> Option<T> {
        let pop = self.pop_idx.load(Ordering::Relaxed);
        if pop == self.push_idx.load(Ordering::Acquire) {
            return None;
        }
        let value = self.slot(pop);
        self.pop_idx.store(Self::next_idx(pop), Ordering::Release);
        Some(value)
    }

    /// Discard everything currently queued by moving the pop cursor up to the
    /// push cursor. Only the consumer calls this.
    pub(crate) fn discard_all(&self) -> usize {
        let pop = self.pop_idx.load(Ordering::Relaxed);
        let push = self.push_idx.load(Ordering::Acquire);
        self.pop_idx.store(push, Ordering::Release);
        (push + S - pop) % S
    }

    /// Read a slot inside the occupied region
    #[inline]
    fn slot(&self, idx: usize) -> T {
        // SAFETY: callers only pass indices in `[pop_idx, push_idx)`, which the
        // producer never writes until the consumer releases them.
        unsafe { *self.storage[idx].get() }
    }
}

impl<const S: usize> RingBuffer<u8, S> {
    /// True when a complete, terminated token is waiting
    pub fn has_string(&self) -> bool {
        let pop = self.pop_idx.load(Ordering::Relaxed);
        let push = self.push_idx.load(Ordering::Acquire);
        scan_token::<S>(pop, push, |i| self.slot(i), |_| {}).is_complete()
    }

    /// Extract the next token and at most one trailing terminator.
    ///
    /// Leading terminators are skipped. When no complete token is present the
    /// scanned bytes are still consumed and a partial (or empty) string is
    /// returned, so callers check [`RingBuffer::has_string`] first.
    pub fn pop_string(&mut self) -> String {
        self.take_token()
    }

    /// Consumer-side token extraction shared with [`crate::Consumer`]
    pub(crate) fn take_token(&self) -> String {
        let pop = self.pop_idx.load(Ordering::Relaxed);
        let push = self.push_idx.load(Ordering::Acquire);

        let mut token = Vec::new();
        let scan = scan_token::<S>(pop, push, |i| self.slot(i), |b| token.push(b));
        self.pop_idx.store(consume_end::<S>(&scan), Ordering::Release);

        String::from_utf8_lossy(&token).into_owned()
    }
}

impl<T: Copy + Default, const S: usize> Default for RingBuffer<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const S: usize> std::fmt::Debug for RingBuffer<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("slots", &S)
            .field("push_idx", &self.push_idx.load(Ordering::Relaxed))
            .field("pop_idx", &self.pop_idx.load(Ordering::Relaxed))
            .finish()
    }
}
