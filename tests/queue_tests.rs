use fabric_rs::{Backoff, MpmcArrayQueue, MpscArrayQueue, MpscLinkedQueue, SpscArrayQueue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

#[test]
fn test_spsc_cross_thread_fifo() {
    const N: u64 = 100_000;
    let queue = SpscArrayQueue::with_capacity(1024);

    thread::scope(|s| {
        let producer = &queue;
        s.spawn(move || {
            for i in 0..N {
                let mut value = i;
                loop {
                    match producer.offer(value) {
                        Ok(()) => break,
                        Err(v) => {
                            value = v;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < N {
            if let Some(value) = queue.poll() {
                assert_eq!(value, expected, "FIFO violation");
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
    });

    assert!(queue.is_empty());
}

#[test]
fn test_mpsc_per_producer_fifo() {
    const N_PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 50_000;
    let queue = MpscArrayQueue::with_capacity(1024);

    thread::scope(|s| {
        for producer_id in 0..N_PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = (producer_id << 32) | i;
                    loop {
                        match queue.offer(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                thread::yield_now();
                            }
                        }
                    }
                }
            });
        }

        let mut last_seen = [0u64; N_PRODUCERS as usize];
        let mut total = 0u64;
        while total < N_PRODUCERS * PER_PRODUCER {
            total += queue.drain(|value| {
                let producer_id = (value >> 32) as usize;
                let sequence = value & 0xFFFF_FFFF;
                assert_eq!(
                    sequence, last_seen[producer_id],
                    "per-producer FIFO violation for producer {}",
                    producer_id
                );
                last_seen[producer_id] += 1;
            }) as u64;
            if total < N_PRODUCERS * PER_PRODUCER {
                thread::yield_now();
            }
        }
    });

    assert!(queue.is_empty());
}

// Two producers of 500k unique ids each, one drain thread. Every id arrives
// exactly once and size observations never leave [0, capacity].
#[test]
fn test_mpmc_two_producers_single_drain() {
    const CAPACITY: usize = 128;
    const PER_PRODUCER: u64 = 500_000;
    const TOTAL: u64 = 2 * PER_PRODUCER;

    let queue = MpmcArrayQueue::with_capacity(CAPACITY);
    let mut seen = vec![false; TOTAL as usize];

    thread::scope(|s| {
        for producer_id in 0..2u64 {
            let queue = &queue;
            s.spawn(move || {
                let mut backoff = Backoff::new();
                for i in 0..PER_PRODUCER {
                    let mut value = producer_id * PER_PRODUCER + i;
                    loop {
                        match queue.offer(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                backoff.snooze();
                            }
                        }
                    }
                    backoff.reset();
                }
            });
        }

        let queue = &queue;
        let seen = &mut seen;
        s.spawn(move || {
            let mut drained = 0u64;
            while drained < TOTAL {
                let size = queue.size();
                assert!(size <= CAPACITY, "size {} exceeded capacity", size);

                drained += queue.drain(|value| {
                    let index = value as usize;
                    assert!(!seen[index], "duplicate id {}", value);
                    seen[index] = true;
                }) as u64;

                if drained < TOTAL {
                    thread::yield_now();
                }
            }
        });
    });

    assert_eq!(seen.iter().filter(|&&s| s).count() as u64, TOTAL);
    assert!(queue.is_empty());
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_mpmc_concurrent_consumers() {
    const PER_PRODUCER: u64 = 100_000;
    const TOTAL: u64 = 2 * PER_PRODUCER;

    let queue = MpmcArrayQueue::with_capacity(256);
    let sum = AtomicU64::new(0);
    let count = AtomicU64::new(0);

    thread::scope(|s| {
        for producer_id in 0..2u64 {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = producer_id * PER_PRODUCER + i;
                    loop {
                        match queue.offer(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                thread::yield_now();
                            }
                        }
                    }
                }
            });
        }

        for _ in 0..2 {
            let queue = &queue;
            let sum = &sum;
            let count = &count;
            s.spawn(move || {
                while count.load(Ordering::SeqCst) < TOTAL {
                    if let Some(value) = queue.poll() {
                        sum.fetch_add(value, Ordering::SeqCst);
                        count.fetch_add(1, Ordering::SeqCst);
                    } else {
                        thread::yield_now();
                    }
                }
            });
        }
    });

    assert_eq!(count.load(Ordering::SeqCst), TOTAL);
    assert_eq!(sum.load(Ordering::SeqCst), (0..TOTAL).sum::<u64>());
}

#[test]
fn test_linked_queue_multi_producer_fifo() {
    const N_PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 50_000;
    let queue = MpscLinkedQueue::new();

    thread::scope(|s| {
        for producer_id in 0..N_PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.offer((producer_id << 32) | i);
                }
            });
        }

        let mut last_seen = [0u64; N_PRODUCERS as usize];
        let mut total = 0u64;
        while total < N_PRODUCERS * PER_PRODUCER {
            total += queue.drain(|value| {
                let producer_id = (value >> 32) as usize;
                let sequence = value & 0xFFFF_FFFF;
                assert_eq!(
                    sequence, last_seen[producer_id],
                    "per-producer FIFO violation for producer {}",
                    producer_id
                );
                last_seen[producer_id] += 1;
            }) as u64;
            if total < N_PRODUCERS * PER_PRODUCER {
                thread::yield_now();
            }
        }
    });

    assert!(queue.is_empty());
}

// size() traverses the chain while producers are mid-publish; it must spin
// through the transient unlinked-tail window rather than miscount or crash.
#[test]
fn test_linked_queue_size_during_concurrent_offers() {
    const PER_PRODUCER: u64 = 20_000;
    let queue = MpscLinkedQueue::new();

    thread::scope(|s| {
        for _ in 0..2 {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.offer(i);
                }
            });
        }

        let queue = &queue;
        s.spawn(move || {
            for _ in 0..1000 {
                let _ = queue.size();
            }
        });
    });

    assert_eq!(queue.size(), 2 * PER_PRODUCER as usize);
}

#[test]
fn test_queue_capacity_invariant_under_stress() {
    const PER_PRODUCER: u64 = 100_000;
    let queue = MpscArrayQueue::with_capacity(64);
    let done = AtomicU64::new(0);

    thread::scope(|s| {
        for _ in 0..2 {
            let queue = &queue;
            let done = &done;
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    while queue.offer(i).is_err() {
                        thread::yield_now();
                    }
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        let queue = &queue;
        let done = &done;
        s.spawn(move || {
            loop {
                let size = queue.size();
                assert!(size <= queue.capacity());
                let finished = done.load(Ordering::SeqCst) == 2;
                if queue.drain(|_| {}) == 0 {
                    if finished && queue.is_empty() {
                        break;
                    }
                    thread::yield_now();
                }
            }
        });
    });
}
