use crate::bits;
use crate::invariants::{debug_assert_head_not_past_tail, debug_assert_monotonic};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// Many-producer single-consumer bounded queue. Producers claim a sequence by
// CAS-incrementing `tail`, write the element, then publish by release-storing
// the slot's sequence word to `claimed + 1`. The consumer detects publication
// with an acquire load of that word: `head + 1` is the commit signal. A slot
// whose sequence word lags is either empty or mid-publish, so `poll` can
// return empty while `size() > 0`; `is_empty` compares tail and head and
// stays authoritative.
//
// `shared_head_cache` keeps the common offer path off the consumer's cache
// line: producers only refresh it from `head` when the cached value says the
// queue is full, and the refresh double-checks before failing the offer.
//
// =============================================================================

/// Many-producer single-consumer bounded FIFO queue.
///
/// Capacity is rounded up to the next power of two. `offer` is lock-free for
/// any number of producers; `poll`, `peek`, and the drain family must only be
/// called from the single consumer thread.
pub struct MpscArrayQueue<E> {
    tail: CachePadded<AtomicU64>,
    shared_head_cache: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    mask: usize,
    capacity: usize,
    sequences: Box<[AtomicU64]>,
    buffer: Box<[UnsafeCell<MaybeUninit<E>>]>,
}

// SAFETY: elements are published through the per-slot release/acquire
// sequence words; control words are atomics.
unsafe impl<E: Send> Send for MpscArrayQueue<E> {}
unsafe impl<E: Send> Sync for MpscArrayQueue<E> {}

impl<E> MpscArrayQueue<E> {
    /// Creates a queue with at least `requested_capacity` slots.
    pub fn with_capacity(requested_capacity: usize) -> Self {
        let capacity = bits::next_power_of_two(requested_capacity);
        let mut sequences = Vec::with_capacity(capacity);
        sequences.resize_with(capacity, || AtomicU64::new(0));
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            shared_head_cache: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            mask: capacity - 1,
            capacity,
            sequences: sequences.into_boxed_slice(),
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
        let mut head = self.shared_head_cache.load(Ordering::Relaxed);
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            if tail.wrapping_sub(head) as usize >= self.capacity {
                head = self.head.load(Ordering::SeqCst);
                if tail.wrapping_sub(head) as usize >= self.capacity {
                    return Err(element);
                }
                self.shared_head_cache.store(head, Ordering::Relaxed);
            }

            match self
                .tail
                .compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }

        let index = (tail as usize) & self.mask;
        // SAFETY: the capacity check above guarantees the consumer has moved
        // past this slot's previous occupant; the CAS gives this producer
        // exclusive claim on the sequence.
        unsafe { (*self.buffer[index].get()).write(element) };
        self.sequences[index].store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Polls the next element. Returns `None` when the head slot is not yet
    /// published, which can happen while `size() > 0`.
    pub fn poll(&self) -> Option<E> {
        let head = self.head.load(Ordering::Relaxed);
        let index = (head as usize) & self.mask;

        let committed = head.wrapping_add(1);
        if self.sequences[index].load(Ordering::Acquire) != committed {
            return None;
        }

        // SAFETY: the acquire load above observed the producer's release
        // store for this sequence, so the element is fully written and owned
        // by the single consumer until head advances.
        let element = unsafe { (*self.buffer[index].get()).assume_init_read() };

        debug_assert_monotonic!("head", head, committed);
        debug_assert_head_not_past_tail!(committed, self.tail.load(Ordering::Relaxed));
        self.head.store(committed, Ordering::Release);
        Some(element)
    }

    /// Reads the next element without consuming it. Consumer-side only.
    pub fn peek(&self) -> Option<E>
    where
        E: Clone,
    {
        let head = self.head.load(Ordering::Relaxed);
        let index = (head as usize) & self.mask;

        if self.sequences[index].load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }
        // SAFETY: as in poll; the element stays in place and only the single
        // consumer can retire it.
        Some(unsafe { (*self.buffer[index].get()).assume_init_ref() }.clone())
    }

    /// True when `tail == head`. Authoritative, unlike a `poll` miss.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::SeqCst) == self.head.load(Ordering::SeqCst)
    }

    /// Consistent size estimate, clamped to `[0, capacity]`.
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

    /// Drains every currently published element into `handler`.
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

impl<E> Drop for MpscArrayQueue<E> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);

        for sequence in head..tail {
            let index = (sequence as usize) & self.mask;
            // At drop every claimed slot has been published; [head, tail)
            // holds live elements.
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
    fn test_offer_poll_fifo() {
        let queue = MpscArrayQueue::with_capacity(8);

        for i in 0..8u64 {
            assert!(queue.offer(i).is_ok());
        }
        assert_eq!(queue.offer(99), Err(99));

        for i in 0..8u64 {
            assert_eq!(queue.peek(), Some(i));
            assert_eq!(queue.poll(), Some(i));
        }
        assert_eq!(queue.poll(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_size_bounds() {
        let queue = MpscArrayQueue::with_capacity(4);
        assert_eq!(queue.size(), 0);

        queue.offer(1u32).unwrap();
        queue.offer(2).unwrap();
        assert_eq!(queue.size(), 2);

        queue.poll();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_many_laps() {
        let queue = MpscArrayQueue::with_capacity(4);
        for i in 0..1000u64 {
            queue.offer(i).unwrap();
            assert_eq!(queue.poll(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_to() {
        let queue = MpscArrayQueue::with_capacity(8);
        for i in 0..6u64 {
            queue.offer(i).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(queue.drain_to(&mut out, usize::MAX), 6);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);
    }
}
