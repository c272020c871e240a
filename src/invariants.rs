//! Debug assertion macros for queue and ring buffer invariants.
//!
//! These are only active in debug builds (`#[cfg(debug_assertions)]`),
//! so there is zero overhead in release builds.

/// Assert that the number of live elements never exceeds capacity.
///
/// **Invariant**: `0 <= (tail - head) <= capacity`
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "bounded count violated: count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that a sequence number only increases.
///
/// **Invariant**: `new_value >= old_value`
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "monotonic progress violated: {} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

/// Assert that the consumer never advances past the producer.
///
/// **Invariant**: `head <= tail` after every head update
macro_rules! debug_assert_head_not_past_tail {
    ($new_head:expr, $tail:expr) => {
        debug_assert!(
            $new_head <= $tail,
            "consumer overran producer: advancing head {} beyond tail {}",
            $new_head,
            $tail
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_head_not_past_tail;
pub(crate) use debug_assert_monotonic;
