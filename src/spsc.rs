use crate::bits;
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_head_not_past_tail, debug_assert_monotonic,
};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// Single-producer single-consumer bounded queue over a power-of-two slot
// array. `head` and `tail` are unbounded u64 sequences; a slot index is
// `sequence & mask`. Wrap-around of the sequence space is not a practical
// concern at any realistic message rate.
//
// Producer (offer):
//   1. Load `tail` Relaxed (producer is the only writer of tail).
//   2. Check space against `cached_head` (producer-private, no ordering).
//   3. If the cache says full, refresh it with an Acquire load of `head`.
//   4. Write the element plainly into its slot.
//   5. Release-store `tail + 1`, publishing the element.
//
// Consumer (poll):
//   1. Load `head` Relaxed (consumer is the only writer of head).
//   2. Check availability against `cached_tail` (consumer-private).
//   3. If the cache says empty, refresh it with an Acquire load of `tail`.
//   4. Move the element out of its slot.
//   5. Release-store `head + 1`, returning the slot to the producer.
//
// `cached_head` is written only on the producer path and `cached_tail` only
// on the consumer path, so both live in UnsafeCell without atomics. The
// element slots themselves need no per-slot ordering: the tail/head
// release-acquire pairs carry the happens-before.
//
// =============================================================================

/// Single-producer single-consumer bounded FIFO queue.
///
/// Capacity is rounded up to the next power of two. `offer` and `poll` are
/// wait-free and allocation-free; a full queue rejects the element rather
/// than blocking. The caller must uphold the single-producer and
/// single-consumer roles; the queue does not police which thread calls
/// which side.
pub struct SpscArrayQueue<E> {
    tail: CachePadded<AtomicU64>,
    cached_head: CachePadded<UnsafeCell<u64>>,
    head: CachePadded<AtomicU64>,
    cached_tail: CachePadded<UnsafeCell<u64>>,
    mask: usize,
    capacity: usize,
    buffer: Box<[UnsafeCell<MaybeUninit<E>>]>,
}

// SAFETY: cross-thread publication goes through the release/acquire pairs on
// head and tail as documented above.
unsafe impl<E: Send> Send for SpscArrayQueue<E> {}
unsafe impl<E: Send> Sync for SpscArrayQueue<E> {}

impl<E> SpscArrayQueue<E> {
    /// Creates a queue with at least `requested_capacity` slots.
    pub fn with_capacity(requested_capacity: usize) -> Self {
        let capacity = bits::next_power_of_two(requested_capacity);
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(UnsafeCell::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(UnsafeCell::new(0)),
            mask: capacity - 1,
            capacity,
            buffer: buffer.into_boxed_slice(),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offers an element, returning it back if the queue is full.
    pub fn offer(&self, element: E) -> Result<(), E> {
        let tail = self.tail.load(Ordering::Relaxed);

        // SAFETY: cached_head is written only on this (producer) path.
        let mut head = unsafe { *self.cached_head.get() };
        if tail.wrapping_sub(head) as usize >= self.capacity {
            head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) as usize >= self.capacity {
                return Err(element);
            }
            // SAFETY: producer-private cache, same single-writer argument.
            unsafe { *self.cached_head.get() = head };
        }

        let index = (tail as usize) & self.mask;
        // SAFETY: the slot at tail is outside [head, tail) so the consumer
        // will not touch it until the release store below publishes it.
        unsafe { (*self.buffer[index].get()).write(element) };

        debug_assert_bounded_count!(tail.wrapping_sub(head) as usize + 1, self.capacity);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Polls the next element, or `None` when nothing is published.
    pub fn poll(&self) -> Option<E> {
        let head = self.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail is written only on this (consumer) path.
        let mut tail = unsafe { *self.cached_tail.get() };
        if tail == head {
            tail = self.tail.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            // SAFETY: consumer-private cache, same single-writer argument.
            unsafe { *self.cached_tail.get() = tail };
        }

        let index = (head as usize) & self.mask;
        // SAFETY: head < tail, so the slot holds an element published by the
        // producer's release store; moving it out leaves the slot logically
        // empty once head advances.
        let element = unsafe { (*self.buffer[index].get()).assume_init_read() };

        let new_head = head.wrapping_add(1);
        debug_assert_monotonic!("head", head, new_head);
        debug_assert_head_not_past_tail!(new_head, tail);
        self.head.store(new_head, Ordering::Release);
        Some(element)
    }

    /// Reads the next element without consuming it. Consumer-side only.
    pub fn peek(&self) -> Option<E>
    where
        E: Clone,
    {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = unsafe { *self.cached_tail.get() };
        if tail == head {
            tail = self.tail.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            unsafe { *self.cached_tail.get() = tail };
        }

        let index = (head as usize) & self.mask;
        // SAFETY: as in poll, but the element stays in place.
        Some(unsafe { (*self.buffer[index].get()).assume_init_ref() }.clone())
    }

    /// True when `tail == head`. Authoritative, unlike a `poll` miss.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::SeqCst) == self.head.load(Ordering::SeqCst)
    }

    /// Consistent size estimate, clamped to `[0, capacity]`.
    ///
    /// Uses a double observation of head with tail read in between, retrying
    /// until two consecutive head reads agree.
    pub fn size(&self) -> usize {
        let mut head_after = self.head.load(Ordering::SeqCst);
        loop {
            let head_before = head_after;
            let tail = self.tail.load(Ordering::SeqCst);
            head_after = self.head.load(Ordering::SeqCst);
            if head_after == head_before {
                let size = tail.wrapping_sub(head_after) as i64;
                return size.clamp(0, self.capacity as i64) as usize;
            }
        }
    }

    /// Drains every currently available element into `handler`.
    pub fn drain<F>(&self, handler: F) -> usize
    where
        F: FnMut(E),
    {
        self.drain_n(handler, usize::MAX)
    }

    /// Drains up to `limit` elements into `handler`. Returns the count.
    pub fn drain_n<F>(&self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(E),
    {
        let mut count = 0;
        while count < limit {
            match self.poll() {
                Some(element) => {
                    count += 1;
                    handler(element);
                }
                None => break,
            }
        }
        count
    }

    /// Drains up to `limit` elements into a collection.
    pub fn drain_to(&self, collection: &mut Vec<E>, limit: usize) -> usize {
        self.drain_n(|element| collection.push(element), limit)
    }
}

impl<E> Drop for SpscArrayQueue<E> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        for sequence in head..tail {
            let index = (sequence as usize) & self.mask;
            // SAFETY: slots in [head, tail) hold live elements and no other
            // thread can touch them during drop.
            unsafe {
                (*self.buffer[index].get()).assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_up() {
        let queue = SpscArrayQueue::<u64>::with_capacity(100);
        assert_eq!(queue.capacity(), 128);
    }

    #[test]
    fn test_offer_poll_fifo() {
        let queue = SpscArrayQueue::with_capacity(8);

        for i in 0..8u64 {
            assert!(queue.offer(i).is_ok());
        }
        assert_eq!(queue.offer(99), Err(99));
        assert_eq!(queue.size(), 8);

        for i in 0..8u64 {
            assert_eq!(queue.peek(), Some(i));
            assert_eq!(queue.poll(), Some(i));
        }
        assert_eq!(queue.poll(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let queue = SpscArrayQueue::with_capacity(4);

        for round in 0..100u64 {
            assert!(queue.offer(round).is_ok());
            assert!(queue.offer(round + 1000).is_ok());
            assert_eq!(queue.poll(), Some(round));
            assert_eq!(queue.poll(), Some(round + 1000));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain() {
        let queue = SpscArrayQueue::with_capacity(16);
        for i in 0..10u64 {
            queue.offer(i).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(queue.drain_to(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);

        let mut sum = 0;
        assert_eq!(queue.drain(|v| sum += v), 6);
        assert_eq!(sum, 4 + 5 + 6 + 7 + 8 + 9);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_releases_unconsumed() {
        use std::sync::atomic::AtomicUsize;

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug)]
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let queue = SpscArrayQueue::with_capacity(8);
            for _ in 0..5 {
                queue.offer(Tracked).unwrap();
            }
            drop(queue.poll());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }
}
