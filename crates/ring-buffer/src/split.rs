//! Producer/consumer halves of a shared ring buffer
//!
//! Neither handle is `Clone`, which is what keeps the ring single-producer,
//! single-consumer without a lock.

use crate::buffer::RingBuffer;
use crate::error::BufferError;
use std::sync::Arc;

impl<T: Copy + Default, const S: usize> RingBuffer<T, S> {
    /// Split the ring into its writing and reading halves
    pub fn split(self) -> (Producer<T, S>, Consumer<T, S>) {
        let ring = Arc::new(self);
        (
            Producer {
                ring: Arc::clone(&ring),
            },
            Consumer { ring },
        )
    }
}

/// Writing half, owned by the interrupt or receive task
#[derive(Debug)]
pub struct Producer<T, const S: usize> {
    ring: Arc<RingBuffer<T, S>>,
}

impl<T: Copy + Default, const S: usize> Producer<T, S> {
    /// Push a value, failing when no slot is free
    pub fn push(&mut self, value: T) -> Result<(), BufferError> {
        // SAFETY: the producer handle is unique and `&mut self` serializes calls.
        unsafe { self.ring.enqueue(value) }
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Number of elements waiting to be popped
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    /// Usable capacity
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Whether the consumer half has been dropped
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }
}

/// Reading half, owned by the polling loop
#[derive(Debug)]
pub struct Consumer<T, const S: usize> {
    ring: Arc<RingBuffer<T, S>>,
}

impl<T: Copy + Default, const S: usize> Consumer<T, S> {
    /// Remove and return the oldest element
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: the consumer handle is unique and `&mut self` serializes calls.
        unsafe { self.ring.dequeue() }
    }

    /// Return the oldest element without removing it
    pub fn peek(&self) -> Option<T> {
        self.ring.peek()
    }

    /// Number of elements waiting to be popped
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Usable capacity
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Discard everything queued so far, returning the number of elements
    /// dropped. Unlike [`RingBuffer::clear`] this only moves the read cursor,
    /// so the producer may keep writing concurrently.
    pub fn clear(&mut self) -> usize {
        self.ring.discard_all()
    }
}

impl<const S: usize> Consumer<u8, S> {
    /// True when a complete, terminated token is waiting
    pub fn has_string(&self) -> bool {
        self.ring.has_string()
    }

    /// Extract the next token and at most one trailing terminator
    pub fn pop_string(&mut self) -> String {
        self.ring.take_token()
    }
}
