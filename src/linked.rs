use crossbeam_utils::CachePadded;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

// =============================================================================
// SYNCHRONIZATION PROTOCOL
// =============================================================================
//
// Unbounded many-producer single-consumer linked queue. The head node is
// always a stale dummy: its value has already been taken, and the next
// element to poll lives in `head.next`.
//
// A producer publishes in two steps:
//
//   1. swap the new node into `tail` (AcqRel exchange)
//   2. release-store `previous.next = new node`
//
// Between those two instructions the chain from head is momentarily broken:
// the swapped-in tail is reachable from `tail` but not yet from its
// predecessor. Any consumer-side traversal (`poll`, `peek`, `size`) that
// sees a null `next` while `head != tail` MUST spin-read until the
// predecessor link appears. Removing that spin reorders or drops elements;
// the window is two producer instructions wide in practice but unbounded in
// principle. `is_empty` compares head and tail and never needs the spin.
//
// =============================================================================

struct Node<E> {
    next: AtomicPtr<Node<E>>,
    value: Option<E>,
}

impl<E> Node<E> {
    fn raw(value: Option<E>) -> *mut Node<E> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Unbounded many-producer single-consumer FIFO queue.
///
/// Producers allocate one node per offer; the consumer reclaims nodes as it
/// polls. `poll`, `peek`, and the drain family must only be called from the
/// single consumer thread.
pub struct MpscLinkedQueue<E> {
    head: CachePadded<AtomicPtr<Node<E>>>,
    tail: CachePadded<AtomicPtr<Node<E>>>,
}

// SAFETY: nodes are handed over via the swap/release-store protocol above;
// the consumer is the only thread that unlinks and frees.
unsafe impl<E: Send> Send for MpscLinkedQueue<E> {}
unsafe impl<E: Send> Sync for MpscLinkedQueue<E> {}

impl<E> MpscLinkedQueue<E> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let dummy = Node::<E>::raw(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
        }
    }

    /// Appends an element. Never fails; the queue is unbounded.
    pub fn offer(&self, element: E) {
        let node = Node::raw(Some(element));
        let previous = self.tail.swap(node, Ordering::AcqRel);
        // SAFETY: previous was the live tail; only this producer links its
        // successor, and the consumer cannot free it until the link appears.
        unsafe {
            (*previous).next.store(node, Ordering::Release);
        }
    }

    /// Polls the next element, or `None` when the queue is empty.
    pub fn poll(&self) -> Option<E> {
        let head = self.head.load(Ordering::Relaxed);
        let next = self.next_of(head)?;

        // SAFETY: next is a published node owned by the single consumer from
        // here on; the old head dummy is unreachable once head advances.
        unsafe {
            let value = (*next).value.take();
            self.head.store(next, Ordering::Release);
            drop(Box::from_raw(head));
            value
        }
    }

    /// Reads the next element without consuming it. Consumer-side only.
    pub fn peek(&self) -> Option<E>
    where
        E: Clone,
    {
        let head = self.head.load(Ordering::Relaxed);
        let next = self.next_of(head)?;
        // SAFETY: published node; the single consumer is the only thread
        // that could take the value concurrently, and that is us.
        unsafe { (*next).value.clone() }
    }

    /// Resolves `head.next`, spinning through a producer's publish window.
    /// Returns `None` only when the queue is empty.
    fn next_of(&self, head: *mut Node<E>) -> Option<*mut Node<E>> {
        // SAFETY: head is always a valid node owned by the consumer.
        let mut next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            if head == self.tail.load(Ordering::Acquire) {
                return None;
            }
            // A producer has swapped the tail but not yet linked it; the
            // link is at most a couple of instructions away.
            loop {
                // SAFETY: as above.
                next = unsafe { (*head).next.load(Ordering::Acquire) };
                if !next.is_null() {
                    break;
                }
                hint::spin_loop();
            }
        }
        Some(next)
    }

    /// True when `head == tail`. Never spins.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Counts the chain from head to tail.
    ///
    /// Tolerates the transient unlinked-tail window by spinning on each
    /// missing link, exactly as the consumer traversal does.
    pub fn size(&self) -> usize {
        let mut node = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let mut count = 0;

        while node != tail {
            // SAFETY: every node between head and the observed tail stays
            // allocated until the consumer polls past it.
            let mut next = unsafe { (*node).next.load(Ordering::Acquire) };
            while next.is_null() {
                hint::spin_loop();
                // SAFETY: as above.
                next = unsafe { (*node).next.load(Ordering::Acquire) };
            }
            node = next;
            count += 1;
        }
        count
    }

    /// Drains every currently linked element into `handler`.
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

impl<E> Default for MpscLinkedQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Drop for MpscLinkedQueue<E> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            // SAFETY: drop has exclusive access; every node from head through
            // tail is still allocated.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}
