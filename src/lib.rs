//! fabric-rs - Lock-Free Inter-Thread Exchange Fabric
//!
//! Concurrency primitives for building messaging, storage, and RPC systems:
//! a memory-ordered byte-buffer substrate and the bounded queues, record
//! ring buffers, broadcast channels, and counters layered on it.
//!
//! # Components
//!
//! - [`AtomicBuffer`]: bounds-checked, endian-aware, memory-order-annotated
//!   random access over a contiguous byte region that it never owns
//! - [`SpscArrayQueue`], [`MpscArrayQueue`], [`MpmcArrayQueue`]: bounded
//!   power-of-two FIFO queues, allocation-free in steady state
//! - [`MpscLinkedQueue`]: unbounded FIFO with a swap-on-enqueue tail
//! - [`ManyToOneRingBuffer`]: variable-length record exchange over an
//!   AtomicBuffer, with padding records, unblocking, and correlation ids
//! - [`BroadcastTransmitter`] / [`BroadcastReceiver`]: one-writer,
//!   many-lossy-reader fan-out using per-slot sequence indicators
//! - [`CountersManager`] / [`CountersReader`] / [`AtomicCounter`]: fixed-slot
//!   counter values and metadata over two shared buffers
//!
//! Nothing here blocks. A full queue rejects the offer, an empty queue
//! returns nothing, and a lapped broadcast receiver observes loss; callers
//! compose waiting with [`Backoff`] or their own idle policy.
//!
//! # Example
//!
//! ```
//! use fabric_rs::{AlignedBuffer, ManyToOneRingBuffer};
//! use fabric_rs::ringbuffer::buffer_descriptor;
//!
//! let mut storage =
//!     AlignedBuffer::with_capacity(1024 + buffer_descriptor::TRAILER_LENGTH);
//! let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();
//!
//! assert!(ring.write(1, b"hello").unwrap());
//!
//! let mut received = Vec::new();
//! ring.read(|type_id, buffer, offset, length| {
//!     let mut payload = vec![0u8; length];
//!     buffer.get_bytes(offset, &mut payload).unwrap();
//!     received.push((type_id, payload));
//! })
//! .unwrap();
//!
//! assert_eq!(received, vec![(1, b"hello".to_vec())]);
//! ```

pub mod backoff;
pub mod bits;
pub mod broadcast;
pub mod buffer;
pub mod counters;
mod invariants;
pub mod linked;
pub mod mpmc;
pub mod mpsc;
pub mod ringbuffer;
pub mod spsc;

pub use backoff::Backoff;
pub use broadcast::{
    BroadcastError, BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver, Receive,
};
pub use buffer::{AlignedBuffer, AtomicBuffer, BufferError, ByteOrder};
pub use counters::{AtomicCounter, CountersError, CountersManager, CountersReader};
pub use linked::MpscLinkedQueue;
pub use mpmc::MpmcArrayQueue;
pub use mpsc::MpscArrayQueue;
pub use ringbuffer::{ManyToOneRingBuffer, RingBufferError};
pub use spsc::SpscArrayQueue;
