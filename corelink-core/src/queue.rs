//! Fixed-capacity lock-free queues used for cross-thread handoff.
//!
//! Two shapes appear throughout the runtime: a many-producer /
//! single-consumer queue (sessions posting onto a socket's "just
//! posted" list, read solely by that socket's reactor) and a
//! single-producer / single-consumer queue (one thread's outstanding
//! timer schedule/cancel intents, read solely by the timer thread).
//! Both are implemented on top of [`crossbeam_queue::ArrayQueue`],
//! which already provides a proven fixed-capacity lock-free ring
//! buffer; this module only adds the naming and capacity policy the
//! runtime expects.

use crossbeam_queue::ArrayQueue;

/// Many-producer, single-consumer fixed-capacity queue.
///
/// `push` may be called concurrently from any number of threads;
/// `pop` must only ever be called from the single designated consumer
/// (the socket's reactor, by construction elsewhere in this crate).
pub struct MpscQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> MpscQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Returns the value back on failure (queue full).
    pub fn push(&self, value: T) -> Result<(), T> {
        self.inner.push(value)
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Single-producer, single-consumer fixed-capacity queue.
///
/// Cheaper than [`MpscQueue`] in spirit (a single producer need not
/// race other producers), but `ArrayQueue` does not specialize the
/// single-producer case, so the only difference enforced here is in
/// the API contract: callers must guarantee single-producer /
/// single-consumer discipline themselves (the timer service's
/// per-thread containers do, by construction).
pub struct SpscQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> SpscQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        self.inner.push(value)
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// True once the queue has crossed the high-water mark (2/3 of
    /// capacity by default in callers), signalling the consumer
    /// should be woken early rather than waiting for its next
    /// scheduled drain.
    pub fn at_or_above(&self, mark: usize) -> bool {
        self.len() >= mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpsc_respects_capacity() {
        let q: MpscQueue<u32> = MpscQueue::with_capacity(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn mpsc_concurrent_producers_preserve_count() {
        use std::sync::Arc;
        let q = Arc::new(MpscQueue::with_capacity(1024));
        let mut handles = Vec::new();
        for t in 0..8 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    while q.push(t * 100 + i).is_err() {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut count = 0;
        while q.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 800);
    }

    #[test]
    fn spsc_high_water_mark() {
        let q: SpscQueue<u32> = SpscQueue::with_capacity(6);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        assert!(q.at_or_above(4));
        assert!(!q.at_or_above(5));
    }
}
