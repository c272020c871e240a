use fabric_rs::ringbuffer::{buffer_descriptor, record_descriptor, ManyToOneRingBuffer};
use fabric_rs::AlignedBuffer;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

const CAPACITY: usize = 256;
const TOTAL_CAPACITY: usize = CAPACITY + buffer_descriptor::TRAILER_LENGTH;

fn storage() -> AlignedBuffer {
    AlignedBuffer::with_capacity(TOTAL_CAPACITY)
}

// Fill the ring to tail position 240 with committed records, fail a write
// that no longer fits, then consume and retry: the retry claims the 16-byte
// tail fragment as a padding record and lands the message at index 0.
#[test]
fn test_padding_installed_after_head_advances() {
    let mut storage = storage();
    let buffer = storage.buffer();
    let ring = ManyToOneRingBuffer::new(buffer).unwrap();

    // Six 32-byte payloads: 40 aligned bytes each, tail ends at 240.
    for i in 1..=6 {
        assert!(ring.write(i, &[i as u8; 32]).unwrap());
    }
    assert_eq!(ring.producer_position().unwrap(), 240);

    // Only 16 bytes remain; a 40-byte record must be refused.
    assert!(!ring.write(7, &[7u8; 32]).unwrap());

    // Consume everything; head catches up to 240.
    assert_eq!(ring.read(|_, _, _, _| {}).unwrap(), 6);
    assert_eq!(ring.consumer_position().unwrap(), 240);

    // Retry: the record cannot wrap, so the 16-byte fragment from 240 to the
    // end becomes padding and the record starts back at index 0.
    assert!(ring.write(7, &[7u8; 32]).unwrap());

    let padding_header = buffer.get_i64_volatile(240).unwrap();
    assert_eq!(record_descriptor::record_length(padding_header), 16);
    assert_eq!(
        record_descriptor::record_type_id(padding_header),
        record_descriptor::PADDING_TYPE_ID
    );

    let record_header = buffer.get_i64_volatile(0).unwrap();
    assert_eq!(record_descriptor::record_length(record_header), 40);
    assert_eq!(record_descriptor::record_type_id(record_header), 7);

    // The first batch ends at the ring boundary having consumed only the
    // padding; the next batch wraps and delivers the real message.
    let mut seen = Vec::new();
    assert_eq!(ring.read(|type_id, _, _, _| seen.push(type_id)).unwrap(), 0);
    assert_eq!(ring.consumer_position().unwrap(), 256);
    assert_eq!(ring.read(|type_id, _, _, _| seen.push(type_id)).unwrap(), 1);
    assert_eq!(seen, vec![7]);
}

// A record that exactly reaches the end of the ring needs no padding.
#[test]
fn test_exact_fit_introduces_no_padding() {
    let mut storage = storage();
    let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();

    // Five 32-byte payloads (200 bytes) plus one 8-byte payload (16 bytes)
    // put the tail at 216, leaving exactly one 40-byte record to the end.
    for i in 1..=5 {
        assert!(ring.write(i, &[0u8; 32]).unwrap());
    }
    assert!(ring.write(6, &[0u8; 8]).unwrap());
    assert_eq!(ring.read(|_, _, _, _| {}).unwrap(), 6);
    assert_eq!(ring.consumer_position().unwrap(), 216);

    assert!(ring.write(7, &[7u8; 32]).unwrap());
    assert_eq!(ring.producer_position().unwrap(), 256);

    let mut seen = Vec::new();
    assert_eq!(ring.read(|type_id, _, _, _| seen.push(type_id)).unwrap(), 1);
    assert_eq!(seen, vec![7]);
}

// A dead producer leaves a reserved record (negative length) the consumer
// cannot pass. unblock() rewrites it as padding and the consumer moves on.
#[test]
fn test_unblock_aborted_reservation() {
    let mut storage = storage();
    let buffer = storage.buffer();
    let ring = ManyToOneRingBuffer::new(buffer).unwrap();

    // Simulate a producer that claimed 64 bytes and died before committing:
    // tail advanced, header left with a negative length.
    let tail_index = CAPACITY + buffer_descriptor::TAIL_POSITION_OFFSET;
    assert!(buffer.compare_and_set_i64(tail_index, 0, 64).unwrap());
    buffer
        .put_i64_ordered(0, record_descriptor::make_header(-64, 1))
        .unwrap();

    // A healthy producer writes behind the stuck reservation.
    assert!(ring.write(2, b"alive").unwrap());

    // The consumer is blocked: nothing is committed at the head.
    assert_eq!(ring.read(|_, _, _, _| {}).unwrap(), 0);

    assert!(ring.unblock().unwrap());

    // The reservation is now padding; the consumer reaches the live message.
    let mut seen = Vec::new();
    assert_eq!(ring.read(|type_id, _, _, _| seen.push(type_id)).unwrap(), 1);
    assert_eq!(seen, vec![2]);
    assert_eq!(ring.consumer_position().unwrap(), 80);
}

#[test]
fn test_unblock_is_noop_when_ring_is_healthy() {
    let mut storage = storage();
    let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();

    assert!(!ring.unblock().unwrap());

    assert!(ring.write(1, b"ok").unwrap());
    assert!(!ring.unblock().unwrap());
}

// A panicking handler still zeroes the bytes walked past and releases the
// head; the record being dispatched at the panic counts as consumed.
#[test]
fn test_handler_panic_releases_consumed_prefix() {
    let mut storage = storage();
    let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();

    for type_id in 1..=3 {
        assert!(ring.write(type_id, &[type_id as u8; 8]).unwrap());
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        ring.read(|type_id, _, _, _| {
            if type_id == 2 {
                panic!("handler failure");
            }
        })
    }));
    assert!(outcome.is_err());

    // Records 1 and 2 were walked past before the panic; only 3 remains.
    let mut seen = Vec::new();
    assert_eq!(ring.read(|type_id, _, _, _| seen.push(type_id)).unwrap(), 1);
    assert_eq!(seen, vec![3]);
}

#[test]
fn test_wrap_many_times() {
    let mut storage = storage();
    let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();

    let mut next_expected = 0u8;
    for i in 0..10_000u64 {
        let value = i as u8;
        assert!(ring.write(1, &[value, value, value, value]).unwrap());

        if i % 3 == 0 {
            ring.read(|_, buffer, offset, length| {
                assert_eq!(length, 4);
                assert_eq!(buffer.get_u8(offset).unwrap(), next_expected);
                next_expected = next_expected.wrapping_add(1);
            })
            .unwrap();
        }
    }
    ring.read(|_, _, _, _| {
        next_expected = next_expected.wrapping_add(1);
    })
    .unwrap();
}

// Concurrent producers against a single consumer: every message arrives,
// and each producer's own messages arrive in the order it wrote them.
#[test]
fn test_concurrent_exchange() {
    const PER_PRODUCER: u64 = 20_000;
    const N_PRODUCERS: u64 = 2;

    let mut storage = AlignedBuffer::with_capacity(4096 + buffer_descriptor::TRAILER_LENGTH);
    let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();
    let received = AtomicU64::new(0);

    thread::scope(|s| {
        for producer_id in 1..=N_PRODUCERS {
            let ring = &ring;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let payload = i.to_le_bytes();
                    while !ring.write(producer_id as i32, &payload).unwrap() {
                        thread::yield_now();
                    }
                }
            });
        }

        let ring = &ring;
        let received = &received;
        s.spawn(move || {
            let mut last_seen = [0u64; (N_PRODUCERS + 1) as usize];
            while received.load(Ordering::Relaxed) < N_PRODUCERS * PER_PRODUCER {
                let read = ring
                    .read(|type_id, buffer, offset, length| {
                        assert_eq!(length, 8);
                        let mut bytes = [0u8; 8];
                        buffer.get_bytes(offset, &mut bytes).unwrap();
                        let sequence = u64::from_le_bytes(bytes);
                        let producer = type_id as usize;
                        assert_eq!(
                            sequence, last_seen[producer],
                            "per-producer order violation for producer {}",
                            producer
                        );
                        last_seen[producer] += 1;
                    })
                    .unwrap();
                received.fetch_add(read as u64, Ordering::Relaxed);
                if read == 0 {
                    thread::yield_now();
                }
            }
        });
    });

    assert_eq!(received.load(Ordering::Relaxed), N_PRODUCERS * PER_PRODUCER);
    assert_eq!(ring.size().unwrap(), 0);
}

#[test]
fn test_correlation_ids_unique_across_threads() {
    let mut storage = storage();
    let ring = ManyToOneRingBuffer::new(storage.buffer()).unwrap();

    let mut all_ids = Vec::new();
    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ring = &ring;
                s.spawn(move || {
                    (0..1000)
                        .map(|_| ring.next_correlation_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }
    });

    all_ids.sort_unstable();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 4000);
}
