use crate::bits;
use crate::buffer::{AtomicBuffer, BufferError};
use std::ops::Deref;
use thiserror::Error;

// =============================================================================
// EXCHANGE PROTOCOL
// =============================================================================
//
// Variable-length message exchange over an AtomicBuffer. The buffer is a
// power-of-two data region followed by a fixed trailer of control words,
// each isolated on its own cache-line pair.
//
// Record layout, aligned to 8 bytes:
//
//   offset 0: i32 length    negative = reserved, positive = committed,
//                           zero = unwritten
//   offset 4: i32 type_id   user range >= 1; PADDING_TYPE_ID (-1) reserved
//   offset 8: payload, padded out to a multiple of 8
//
// The header is a single 8-byte word (length in the low 32 bits, type id in
// the high 32 bits on the little-endian targets this crate serves), so
// reserving and committing are each one aligned atomic store:
//
//   producer: CAS tail over the aligned record span (plus any padding
//             record needed to avoid wrapping a record over the ring end),
//             release-store the header with a NEGATIVE length, copy the
//             payload, then release-store the positive length to commit.
//   consumer: volatile-load the header; a non-positive length means not yet
//             committed and the batch stops there. Padding records advance
//             the cursor without reaching the handler. After the batch the
//             consumed bytes are zeroed and the head position released, and
//             a drop guard guarantees that even if the handler panics.
//
// =============================================================================

/// Layout of the control trailer that follows the data region.
///
/// Every field sits two cache lines from its neighbours so that producers
/// hammering the tail never contend with the consumer's head line.
pub mod buffer_descriptor {
    use crate::bits::{self, CACHE_LINE_LENGTH};
    use super::RingBufferError;

    /// Offset within the trailer of the producer tail position.
    pub const TAIL_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 2;

    /// Offset within the trailer of the producers' cached view of head.
    pub const HEAD_CACHE_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 4;

    /// Offset within the trailer of the consumer head position.
    pub const HEAD_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 6;

    /// Offset within the trailer of the correlation id counter.
    pub const CORRELATION_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH * 8;

    /// Offset within the trailer of the consumer heartbeat timestamp.
    pub const CONSUMER_HEARTBEAT_OFFSET: usize = CACHE_LINE_LENGTH * 10;

    /// Total trailer length in bytes.
    pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 12;

    /// Validates a total buffer capacity: data region must be a non-zero
    /// power of two once the trailer is subtracted.
    pub fn check_capacity(total_capacity: usize) -> Result<usize, RingBufferError> {
        let data_capacity = total_capacity
            .checked_sub(TRAILER_LENGTH)
            .ok_or(RingBufferError::CapacityNotPowerOfTwo { data_capacity: 0 })?;
        if bits::is_power_of_two(data_capacity) {
            Ok(data_capacity)
        } else {
            Err(RingBufferError::CapacityNotPowerOfTwo { data_capacity })
        }
    }
}

/// Record header encoding and field offsets.
pub mod record_descriptor {
    use super::RingBufferError;

    /// Bytes of header before the payload.
    pub const HEADER_LENGTH: usize = 8;

    /// Alignment of every record in the ring.
    pub const ALIGNMENT: usize = HEADER_LENGTH;

    /// Type id of a padding record; never delivered to handlers.
    pub const PADDING_TYPE_ID: i32 = -1;

    /// Packs length and type id into the single header word.
    #[inline]
    pub fn make_header(length: i32, type_id: i32) -> i64 {
        ((i64::from(type_id) & 0xFFFF_FFFF) << 32) | (i64::from(length) & 0xFFFF_FFFF)
    }

    /// Length field of a header word.
    #[inline]
    pub fn record_length(header: i64) -> i32 {
        header as i32
    }

    /// Type id field of a header word.
    #[inline]
    pub fn record_type_id(header: i64) -> i32 {
        (header >> 32) as i32
    }

    /// Offset of the length field within a record.
    #[inline]
    pub fn length_offset(record_index: usize) -> usize {
        record_index
    }

    /// Offset of the type id field within a record.
    #[inline]
    pub fn type_offset(record_index: usize) -> usize {
        record_index + 4
    }

    /// Offset of the payload within a record.
    #[inline]
    pub fn encoded_offset(record_index: usize) -> usize {
        record_index + HEADER_LENGTH
    }

    /// Rejects the reserved and non-positive type id range.
    pub fn check_type_id(type_id: i32) -> Result<(), RingBufferError> {
        if type_id < 1 {
            Err(RingBufferError::InvalidTypeId { type_id })
        } else {
            Ok(())
        }
    }
}

/// Claim result signalling that the ring had no room for the record.
pub const INSUFFICIENT_CAPACITY: isize = -2;

/// Errors for ring buffer construction and producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingBufferError {
    /// Data capacity (total minus trailer) is not a power of two.
    #[error("data capacity must be a positive power of two: {data_capacity}")]
    CapacityNotPowerOfTwo { data_capacity: usize },

    /// Message payload exceeds `max_msg_length`.
    #[error("message of {length} bytes exceeds max message length {max}")]
    MessageTooLarge { length: usize, max: usize },

    /// Type id is zero, negative, or reserved.
    #[error("message type id must be positive: {type_id}")]
    InvalidTypeId { type_id: i32 },

    /// Underlying buffer access failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

type Result<T> = std::result::Result<T, RingBufferError>;

/// Many-producer single-consumer exchange of variable-length records over an
/// AtomicBuffer.
///
/// Producers call `write` from any number of threads; `read`, `read_n`, and
/// `unblock` must only be called from the single consumer thread.
pub struct ManyToOneRingBuffer<'a> {
    buffer: AtomicBuffer<'a>,
    capacity: usize,
    max_msg_length: usize,
    tail_position_index: usize,
    head_cache_position_index: usize,
    head_position_index: usize,
    correlation_counter_index: usize,
    consumer_heartbeat_index: usize,
}

impl<'a> ManyToOneRingBuffer<'a> {
    /// Wraps `buffer`, whose capacity must be a power of two plus
    /// `buffer_descriptor::TRAILER_LENGTH`, with an 8-byte-aligned base.
    pub fn new(buffer: AtomicBuffer<'a>) -> Result<Self> {
        buffer.verify_alignment()?;
        let capacity = buffer_descriptor::check_capacity(buffer.capacity())?;

        Ok(Self {
            buffer,
            capacity,
            max_msg_length: capacity / 8,
            tail_position_index: capacity + buffer_descriptor::TAIL_POSITION_OFFSET,
            head_cache_position_index: capacity + buffer_descriptor::HEAD_CACHE_POSITION_OFFSET,
            head_position_index: capacity + buffer_descriptor::HEAD_POSITION_OFFSET,
            correlation_counter_index: capacity + buffer_descriptor::CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat_index: capacity + buffer_descriptor::CONSUMER_HEARTBEAT_OFFSET,
        })
    }

    /// Capacity of the data region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest accepted payload, an eighth of the capacity.
    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Writes one message. Returns `Ok(false)` when the ring lacks capacity;
    /// the caller composes back-off or drops the message.
    pub fn write(&self, type_id: i32, payload: &[u8]) -> Result<bool> {
        record_descriptor::check_type_id(type_id)?;
        self.check_msg_length(payload.len())?;

        let record_length = payload.len() + record_descriptor::HEADER_LENGTH;
        let required = bits::align(record_length, record_descriptor::ALIGNMENT);
        let record_index = self.claim_capacity(required)?;

        if record_index == INSUFFICIENT_CAPACITY {
            return Ok(false);
        }
        let record_index = record_index as usize;

        // Reserve with a negative length so a concurrent consumer stops at
        // this record until the commit below.
        self.buffer.put_i64_ordered(
            record_index,
            record_descriptor::make_header(-(record_length as i32), type_id),
        )?;
        self.buffer
            .put_bytes(record_descriptor::encoded_offset(record_index), payload)?;
        self.buffer.put_i32_ordered(
            record_descriptor::length_offset(record_index),
            record_length as i32,
        )?;

        Ok(true)
    }

    /// Reads all available messages into `handler`.
    pub fn read<F>(&self, handler: F) -> Result<usize>
    where
        F: FnMut(i32, &AtomicBuffer<'a>, usize, usize),
    {
        self.read_n(handler, usize::MAX)
    }

    /// Reads up to `message_count_limit` messages into `handler`, which
    /// receives `(type_id, buffer, payload_offset, payload_length)`.
    ///
    /// Consumed bytes are zeroed and the head position released even when the
    /// handler panics; the record being dispatched at the panic counts as
    /// consumed.
    pub fn read_n<F>(&self, mut handler: F, message_count_limit: usize) -> Result<usize>
    where
        F: FnMut(i32, &AtomicBuffer<'a>, usize, usize),
    {
        let head = self.buffer.get_i64(self.head_position_index)?;
        let head_index = (head as usize) & (self.capacity - 1);
        let contiguous_block_length = self.capacity - head_index;
        let mut messages_read = 0;

        let mut scope = ReadScope {
            buffer: &self.buffer,
            head,
            head_index,
            head_position_index: self.head_position_index,
            bytes_read: 0,
        };

        while scope.bytes_read < contiguous_block_length && messages_read < message_count_limit {
            let record_index = head_index + scope.bytes_read;
            let header = self.buffer.get_i64_volatile(record_index)?;
            let record_length = record_descriptor::record_length(header);

            if record_length <= 0 {
                break;
            }

            scope.bytes_read += bits::align(record_length as usize, record_descriptor::ALIGNMENT);

            let type_id = record_descriptor::record_type_id(header);
            if type_id == record_descriptor::PADDING_TYPE_ID {
                continue;
            }

            messages_read += 1;
            handler(
                type_id,
                &self.buffer,
                record_descriptor::encoded_offset(record_index),
                record_length as usize - record_descriptor::HEADER_LENGTH,
            );
        }

        Ok(messages_read)
    }

    /// Recovers the ring after a producer died between reserving and
    /// committing. Returns whether an unblock happened.
    ///
    /// An aborted reservation (negative length) at the consumer position is
    /// rewritten as a padding record. A still-zero slot that the producers
    /// have already moved past is scanned forward to the next non-zero word,
    /// re-verified as all zeroes, and covered with padding.
    pub fn unblock(&self) -> Result<bool> {
        let mask = self.capacity - 1;
        let head = self.buffer.get_i64_volatile(self.head_position_index)?;
        let tail = self.buffer.get_i64_volatile(self.tail_position_index)?;
        if head == tail {
            return Ok(false);
        }

        let consumer_index = (head as usize) & mask;
        let producer_index = (tail as usize) & mask;
        let mut unblocked = false;

        let length = self.buffer.get_i32_volatile(consumer_index)?;
        if length < 0 {
            self.buffer.put_i64_ordered(
                consumer_index,
                record_descriptor::make_header(-length, record_descriptor::PADDING_TYPE_ID),
            )?;
            unblocked = true;
        } else if length == 0 {
            let limit = if producer_index > consumer_index {
                producer_index
            } else {
                self.capacity
            };

            let mut i = consumer_index + record_descriptor::ALIGNMENT;
            while i < limit {
                if self.buffer.get_i32_volatile(i)? != 0 {
                    // Double-check: everything between must still be zero or
                    // a racing producer has started filling the gap.
                    if self.scan_back_to_confirm_still_zeroed(i, consumer_index)? {
                        self.buffer.put_i64_ordered(
                            consumer_index,
                            record_descriptor::make_header(
                                (i - consumer_index) as i32,
                                record_descriptor::PADDING_TYPE_ID,
                            ),
                        )?;
                        unblocked = true;
                    }
                    break;
                }
                i += record_descriptor::ALIGNMENT;
            }
        }

        Ok(unblocked)
    }

    /// Atomically allocates the next correlation id.
    pub fn next_correlation_id(&self) -> Result<i64> {
        self.buffer
            .get_and_add_i64(self.correlation_counter_index, 1)
            .map_err(RingBufferError::from)
    }

    /// Last heartbeat timestamp stored by the consumer.
    pub fn consumer_heartbeat_time(&self) -> Result<i64> {
        self.buffer
            .get_i64_volatile(self.consumer_heartbeat_index)
            .map_err(RingBufferError::from)
    }

    /// Release-stores the consumer heartbeat timestamp. The core only stores
    /// the value; the clock lives with the caller.
    pub fn set_consumer_heartbeat_time(&self, time: i64) -> Result<()> {
        self.buffer
            .put_i64_ordered(self.consumer_heartbeat_index, time)
            .map_err(RingBufferError::from)
    }

    /// Bytes between head and tail, clamped to `[0, capacity]`, using a
    /// double observation of head.
    pub fn size(&self) -> Result<usize> {
        let mut head_after = self.buffer.get_i64_volatile(self.head_position_index)?;
        loop {
            let head_before = head_after;
            let tail = self.buffer.get_i64_volatile(self.tail_position_index)?;
            head_after = self.buffer.get_i64_volatile(self.head_position_index)?;
            if head_after == head_before {
                let size = tail - head_after;
                return Ok(size.clamp(0, self.capacity as i64) as usize);
            }
        }
    }

    /// Producer tail position in bytes since creation.
    pub fn producer_position(&self) -> Result<i64> {
        self.buffer
            .get_i64_volatile(self.tail_position_index)
            .map_err(RingBufferError::from)
    }

    /// Consumer head position in bytes since creation.
    pub fn consumer_position(&self) -> Result<i64> {
        self.buffer
            .get_i64_volatile(self.head_position_index)
            .map_err(RingBufferError::from)
    }

    /// Claims `required` aligned bytes. Returns the record index, or
    /// `INSUFFICIENT_CAPACITY`.
    fn claim_capacity(&self, required: usize) -> Result<isize> {
        let mask = self.capacity - 1;
        let mut head = self.buffer.get_i64_volatile(self.head_cache_position_index)?;

        let mut tail: i64;
        let mut tail_index: usize;
        let mut padding: usize;

        loop {
            tail = self.buffer.get_i64_volatile(self.tail_position_index)?;
            // Signed arithmetic: a stale cached head can make (tail - head)
            // exceed the capacity.
            let available = self.capacity as i64 - (tail - head);

            if required as i64 > available {
                // Second chance: the cached head may be stale.
                head = self.buffer.get_i64_volatile(self.head_position_index)?;
                if required as i64 > self.capacity as i64 - (tail - head) {
                    return Ok(INSUFFICIENT_CAPACITY);
                }
                self.buffer
                    .put_i64_ordered(self.head_cache_position_index, head)?;
            }

            padding = 0;
            tail_index = (tail as usize) & mask;
            let to_buffer_end = self.capacity - tail_index;

            if required > to_buffer_end {
                // The record would wrap; burn the tail fragment as padding,
                // provided the wrap zone has been consumed far enough.
                let mut head_index = (head as usize) & mask;

                if required > head_index {
                    head = self.buffer.get_i64_volatile(self.head_position_index)?;
                    head_index = (head as usize) & mask;
                    if required > head_index {
                        return Ok(INSUFFICIENT_CAPACITY);
                    }
                    self.buffer
                        .put_i64_ordered(self.head_cache_position_index, head)?;
                }

                padding = to_buffer_end;
            }

            if self.buffer.compare_and_set_i64(
                self.tail_position_index,
                tail,
                tail + (required + padding) as i64,
            )? {
                break;
            }
        }

        if padding != 0 {
            self.buffer.put_i64_ordered(
                tail_index,
                record_descriptor::make_header(padding as i32, record_descriptor::PADDING_TYPE_ID),
            )?;
            tail_index = 0;
        }

        Ok(tail_index as isize)
    }

    fn scan_back_to_confirm_still_zeroed(&self, from: usize, limit: usize) -> Result<bool> {
        let mut i = from;
        while i > limit {
            i -= record_descriptor::ALIGNMENT;
            if self.buffer.get_i32_volatile(i)? != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_msg_length(&self, length: usize) -> Result<()> {
        if length > self.max_msg_length {
            Err(RingBufferError::MessageTooLarge {
                length,
                max: self.max_msg_length,
            })
        } else {
            Ok(())
        }
    }
}

impl<'a> Deref for ManyToOneRingBuffer<'a> {
    type Target = AtomicBuffer<'a>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

/// Zeroes consumed bytes and releases the head position when the read batch
/// ends, by panic or by return.
struct ReadScope<'s, 'a> {
    buffer: &'s AtomicBuffer<'a>,
    head: i64,
    head_index: usize,
    head_position_index: usize,
    bytes_read: usize,
}

impl Drop for ReadScope<'_, '_> {
    fn drop(&mut self) {
        if self.bytes_read > 0 {
            // Offsets were validated when the ring was constructed; failures
            // are impossible here and drop has nowhere to report them.
            let _ = self.buffer.set_memory(self.head_index, self.bytes_read, 0);
            let _ = self
                .buffer
                .put_i64_ordered(self.head_position_index, self.head + self.bytes_read as i64);
        }
    }
}
