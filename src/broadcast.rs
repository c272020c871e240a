use crate::bits;
use crate::buffer::{AtomicBuffer, BufferError};
use thiserror::Error;

// =============================================================================
// TRANSMISSION PROTOCOL
// =============================================================================
//
// One writer fans out fixed-size records to any number of independent, lossy
// readers. The channel is a ring of N (power of two) slots of `record_size`
// bytes plus a small trailer. Readers never write to the channel and never
// block the writer; a slow reader loses transmissions instead.
//
// Each slot leads with an i64 sequence indicator. The transmitter claims a
// slot for sequence S by release-storing -S into the indicator, writes the
// record body, release-stores S to publish, then release-stores S into the
// trailer's latest counter. Indicator values at a given slot are therefore
// strictly ordered: ... S-N, -(S), S, -(S+N), S+N ... and a reader can
// classify any observation against the sequence it expects:
//
//   indicator <  expected           not yet published (or mid-rewrite)
//   indicator == expected           the record is ready
//   indicator >= expected + N       the transmitter lapped this reader
//
// `validate` re-reads the indicator after the reader has consumed the
// payload; any change means the slot was overwritten or is being rewritten
// underneath the reader, and the delta to the latest counter is charged to
// the reader's lost-transmissions count. Loss is a first-class return value,
// never an error.
//
// Exactly one transmitter may write a channel; `transmit` takes `&mut self`
// and the type is not clonable, which makes a second concurrent writer
// unrepresentable without unsafe code.
//
// =============================================================================

/// Layout of the trailer behind the slot ring.
pub mod buffer_descriptor {
    use crate::bits::CACHE_LINE_LENGTH;

    /// Offset within the trailer of the fixed record size (i32).
    pub const RECORD_SIZE_OFFSET: usize = 0;

    /// Offset within the trailer of the latest published sequence (i64).
    pub const LATEST_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH;

    /// Total trailer length in bytes.
    pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 2;
}

/// Per-slot record layout.
pub mod record_descriptor {
    /// Offset of the sequence indicator within a slot.
    pub const SEQUENCE_INDICATOR_OFFSET: usize = 0;

    /// Offset of the payload length field within a slot.
    pub const LENGTH_OFFSET: usize = 8;

    /// Offset of the type id field within a slot.
    pub const TYPE_OFFSET: usize = 12;

    /// Bytes of slot header before the payload.
    pub const HEADER_LENGTH: usize = 16;
}

/// Outcome of a `receive_next` poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
    /// The expected sequence has not been published yet.
    NotAvailable,
    /// A record is ready; inspect it through the receiver accessors and
    /// confirm with `validate` after copying the payload out.
    Available,
    /// The transmitter lapped this receiver; `lost` transmissions were
    /// skipped and the receiver snapped forward to the newest record.
    Loss {
        /// Number of transmissions this receiver will never observe.
        lost: i64,
    },
}

/// Errors for broadcast channel construction and transmitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BroadcastError {
    /// Record size is not a multiple of 8 covering the slot header, or does
    /// not divide the data region.
    #[error("invalid record size {record_size} for data capacity {data_capacity}")]
    InvalidRecordSize {
        record_size: usize,
        data_capacity: usize,
    },

    /// The slot count derived from the record size is not a power of two.
    #[error("slot count must be a power of two: {slots}")]
    SlotsNotPowerOfTwo { slots: usize },

    /// A receiver opened a channel no transmitter has initialised.
    #[error("channel not initialised: record size is zero")]
    NotInitialized,

    /// Type id is zero, negative, or reserved.
    #[error("message type id must be positive: {type_id}")]
    InvalidTypeId { type_id: i32 },

    /// Payload exceeds the fixed record payload capacity.
    #[error("payload of {length} bytes exceeds record payload capacity {max}")]
    PayloadTooLarge { length: usize, max: usize },

    /// Underlying buffer access failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

type Result<T> = std::result::Result<T, BroadcastError>;

fn check_layout(data_capacity: usize, record_size: usize) -> Result<usize> {
    if record_size < record_descriptor::HEADER_LENGTH
        || record_size % 8 != 0
        || data_capacity == 0
        || data_capacity % record_size != 0
    {
        return Err(BroadcastError::InvalidRecordSize {
            record_size,
            data_capacity,
        });
    }
    let slots = data_capacity / record_size;
    if !bits::is_power_of_two(slots) {
        return Err(BroadcastError::SlotsNotPowerOfTwo { slots });
    }
    Ok(slots)
}

/// The single writer of a broadcast channel.
pub struct BroadcastTransmitter<'a> {
    buffer: AtomicBuffer<'a>,
    record_size: usize,
    mask: usize,
    max_payload_length: usize,
    latest_counter_index: usize,
    sequence: i64,
}

impl<'a> BroadcastTransmitter<'a> {
    /// Initialises a channel over `buffer` with the given fixed record size
    /// and becomes its writer. The record size is stored in the trailer for
    /// receivers to discover.
    pub fn new(buffer: AtomicBuffer<'a>, record_size: usize) -> Result<Self> {
        buffer.verify_alignment()?;
        let data_capacity = buffer
            .capacity()
            .checked_sub(buffer_descriptor::TRAILER_LENGTH)
            .ok_or(BroadcastError::InvalidRecordSize {
                record_size,
                data_capacity: 0,
            })?;
        let slots = check_layout(data_capacity, record_size)?;

        buffer.put_i32_volatile(
            data_capacity + buffer_descriptor::RECORD_SIZE_OFFSET,
            record_size as i32,
        )?;

        Ok(Self {
            buffer,
            record_size,
            mask: slots - 1,
            max_payload_length: record_size - record_descriptor::HEADER_LENGTH,
            latest_counter_index: data_capacity + buffer_descriptor::LATEST_COUNTER_OFFSET,
            sequence: 0,
        })
    }

    /// Fixed record size of this channel in bytes.
    #[inline]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Largest payload a record can carry.
    #[inline]
    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    /// Broadcasts one record. Never blocks and never fails for slow
    /// receivers; they observe loss instead.
    pub fn transmit(&mut self, type_id: i32, payload: &[u8]) -> Result<()> {
        if type_id < 1 {
            return Err(BroadcastError::InvalidTypeId { type_id });
        }
        if payload.len() > self.max_payload_length {
            return Err(BroadcastError::PayloadTooLarge {
                length: payload.len(),
                max: self.max_payload_length,
            });
        }

        let sequence = self.sequence + 1;
        let slot_offset = ((sequence as usize) & self.mask) * self.record_size;

        // Claim: receivers treat the negated sequence as "being rewritten".
        self.buffer.put_i64_ordered(
            slot_offset + record_descriptor::SEQUENCE_INDICATOR_OFFSET,
            -sequence,
        )?;
        self.buffer.put_i32(
            slot_offset + record_descriptor::LENGTH_OFFSET,
            payload.len() as i32,
        )?;
        self.buffer
            .put_i32(slot_offset + record_descriptor::TYPE_OFFSET, type_id)?;
        self.buffer
            .put_bytes(slot_offset + record_descriptor::HEADER_LENGTH, payload)?;

        // Publish, then advance the trailer counter for late joiners.
        self.buffer.put_i64_ordered(
            slot_offset + record_descriptor::SEQUENCE_INDICATOR_OFFSET,
            sequence,
        )?;
        self.buffer
            .put_i64_ordered(self.latest_counter_index, sequence)?;

        self.sequence = sequence;
        Ok(())
    }
}

/// One of any number of independent, lossy readers of a broadcast channel.
pub struct BroadcastReceiver<'a> {
    buffer: AtomicBuffer<'a>,
    record_size: usize,
    slots: usize,
    mask: usize,
    latest_counter_index: usize,
    next_sequence: i64,
    cursor: i64,
    record_offset: usize,
    lost_transmissions: i64,
}

impl<'a> BroadcastReceiver<'a> {
    /// Opens a receiver over an initialised channel, discovering the record
    /// size from the trailer. Starts at the beginning of the sequence space,
    /// so a late joiner observes its backlog as loss.
    pub fn new(buffer: AtomicBuffer<'a>) -> Result<Self> {
        buffer.verify_alignment()?;
        let data_capacity = buffer
            .capacity()
            .checked_sub(buffer_descriptor::TRAILER_LENGTH)
            .ok_or(BroadcastError::NotInitialized)?;

        let record_size = buffer
            .get_i32_volatile(data_capacity + buffer_descriptor::RECORD_SIZE_OFFSET)?;
        if record_size <= 0 {
            return Err(BroadcastError::NotInitialized);
        }
        let record_size = record_size as usize;
        let slots = check_layout(data_capacity, record_size)?;

        Ok(Self {
            buffer,
            record_size,
            slots,
            mask: slots - 1,
            latest_counter_index: data_capacity + buffer_descriptor::LATEST_COUNTER_OFFSET,
            next_sequence: 1,
            cursor: 0,
            record_offset: 0,
            lost_transmissions: 0,
        })
    }

    /// Fixed record size discovered from the channel trailer.
    #[inline]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Total transmissions this receiver has lost.
    #[inline]
    pub fn lost_transmissions(&self) -> i64 {
        self.lost_transmissions
    }

    /// The buffer view, for reading the current record's payload.
    #[inline]
    pub fn buffer(&self) -> &AtomicBuffer<'a> {
        &self.buffer
    }

    /// Polls for the next transmission.
    ///
    /// On `Loss` the receiver has already snapped forward: the following
    /// poll returns the newest surviving record.
    pub fn receive_next(&mut self) -> Result<Receive> {
        let expected = self.next_sequence;
        let slot_offset = ((expected as usize) & self.mask) * self.record_size;

        let indicator = self
            .buffer
            .get_i64_volatile(slot_offset + record_descriptor::SEQUENCE_INDICATOR_OFFSET)?;

        if indicator < expected {
            return Ok(Receive::NotAvailable);
        }

        if indicator > expected + self.slots as i64 - 1 {
            let lost = indicator - expected;
            self.lost_transmissions += lost;
            self.next_sequence = indicator;
            return Ok(Receive::Loss { lost });
        }

        // The indicator can only be expected + k * slots, so here it matches
        // exactly and the slot holds the record this receiver is due.
        self.cursor = expected;
        self.record_offset = slot_offset;
        self.next_sequence = expected + 1;
        Ok(Receive::Available)
    }

    /// Sequence of the current record.
    #[inline]
    pub fn sequence(&self) -> i64 {
        self.cursor
    }

    /// Type id of the current record.
    pub fn type_id(&self) -> Result<i32> {
        self.buffer
            .get_i32(self.record_offset + record_descriptor::TYPE_OFFSET)
            .map_err(BroadcastError::from)
    }

    /// Payload length of the current record.
    pub fn length(&self) -> Result<usize> {
        let length = self
            .buffer
            .get_i32(self.record_offset + record_descriptor::LENGTH_OFFSET)?;
        Ok(length as usize)
    }

    /// Payload offset of the current record within the buffer.
    #[inline]
    pub fn offset(&self) -> usize {
        self.record_offset + record_descriptor::HEADER_LENGTH
    }

    /// Confirms the current record was not overwritten while it was being
    /// read. On failure the delta to the latest counter is charged to the
    /// lost count and the receiver snaps forward.
    pub fn validate(&mut self) -> Result<bool> {
        let indicator = self
            .buffer
            .get_i64_volatile(self.record_offset + record_descriptor::SEQUENCE_INDICATOR_OFFSET)?;
        if indicator == self.cursor {
            return Ok(true);
        }

        let latest = self.buffer.get_i64_volatile(self.latest_counter_index)?;
        let lost = (latest - self.cursor).max(0);
        self.lost_transmissions += lost;
        if latest > self.next_sequence {
            self.next_sequence = latest;
        }
        Ok(false)
    }

    /// Snaps the expected sequence to the transmitter's latest counter,
    /// charging everything skipped to the lost count. Returns the newly
    /// counted loss.
    pub fn keep_up_with_transmitter(&mut self) -> Result<i64> {
        let latest = self.buffer.get_i64_volatile(self.latest_counter_index)?;
        if latest > self.next_sequence {
            let lost = latest - self.next_sequence;
            self.lost_transmissions += lost;
            self.next_sequence = latest;
            Ok(lost)
        } else {
            Ok(0)
        }
    }
}

/// Receiver that copies each record out before validating, so the caller
/// always observes a consistent payload even when lapped mid-read.
pub struct CopyBroadcastReceiver<'a> {
    receiver: BroadcastReceiver<'a>,
    scratch: Vec<u8>,
}

impl<'a> CopyBroadcastReceiver<'a> {
    /// Wraps a receiver with a scratch copy buffer.
    pub fn new(receiver: BroadcastReceiver<'a>) -> Self {
        let record_size = receiver.record_size();
        Self {
            receiver,
            scratch: vec![0u8; record_size],
        }
    }

    /// Total transmissions the underlying receiver has lost.
    pub fn lost_transmissions(&self) -> i64 {
        self.receiver.lost_transmissions()
    }

    /// Attempts to receive one validated record into `handler` as
    /// `(type_id, payload)`. Returns the number of records delivered, which
    /// is zero on no-data, on loss, and on a failed validation.
    pub fn receive<F>(&mut self, mut handler: F) -> Result<usize>
    where
        F: FnMut(i32, &[u8]),
    {
        match self.receiver.receive_next()? {
            Receive::Available => {
                let type_id = self.receiver.type_id()?;
                let length = self.receiver.length()?;
                self.receiver
                    .buffer
                    .get_bytes(self.receiver.offset(), &mut self.scratch[..length])?;

                if !self.receiver.validate()? {
                    return Ok(0);
                }
                handler(type_id, &self.scratch[..length]);
                Ok(1)
            }
            Receive::NotAvailable | Receive::Loss { .. } => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;

    const RECORD_SIZE: usize = 64;
    const SLOTS: usize = 8;
    const TOTAL_CAPACITY: usize = SLOTS * RECORD_SIZE + buffer_descriptor::TRAILER_LENGTH;

    fn channel_storage() -> AlignedBuffer {
        AlignedBuffer::with_capacity(TOTAL_CAPACITY)
    }

    #[test]
    fn test_receiver_requires_initialised_channel() {
        let mut storage = channel_storage();
        assert_eq!(
            BroadcastReceiver::new(storage.buffer()).err(),
            Some(BroadcastError::NotInitialized)
        );
    }

    #[test]
    fn test_record_size_discovered_on_open() {
        let mut storage = channel_storage();
        let buffer = storage.buffer();
        let _tx = BroadcastTransmitter::new(buffer, RECORD_SIZE).unwrap();

        let rx = BroadcastReceiver::new(buffer).unwrap();
        assert_eq!(rx.record_size(), RECORD_SIZE);
    }

    #[test]
    fn test_rejects_bad_record_size() {
        let mut storage = channel_storage();
        let buffer = storage.buffer();

        assert!(matches!(
            BroadcastTransmitter::new(buffer, 60),
            Err(BroadcastError::InvalidRecordSize { .. })
        ));
        assert!(matches!(
            BroadcastTransmitter::new(buffer, 8),
            Err(BroadcastError::InvalidRecordSize { .. })
        ));
    }

    #[test]
    fn test_transmit_receive_in_order() {
        let mut storage = channel_storage();
        let buffer = storage.buffer();
        let mut tx = BroadcastTransmitter::new(buffer, RECORD_SIZE).unwrap();
        let mut rx = BroadcastReceiver::new(buffer).unwrap();

        assert_eq!(rx.receive_next().unwrap(), Receive::NotAvailable);

        tx.transmit(5, b"first").unwrap();
        tx.transmit(6, b"second").unwrap();

        assert_eq!(rx.receive_next().unwrap(), Receive::Available);
        assert_eq!(rx.type_id().unwrap(), 5);
        let mut payload = vec![0u8; rx.length().unwrap()];
        rx.buffer().get_bytes(rx.offset(), &mut payload).unwrap();
        assert_eq!(payload, b"first");
        assert!(rx.validate().unwrap());

        assert_eq!(rx.receive_next().unwrap(), Receive::Available);
        assert_eq!(rx.type_id().unwrap(), 6);
        assert!(rx.validate().unwrap());

        assert_eq!(rx.receive_next().unwrap(), Receive::NotAvailable);
        assert_eq!(rx.lost_transmissions(), 0);
    }

    #[test]
    fn test_transmit_rejects_bad_input() {
        let mut storage = channel_storage();
        let mut tx = BroadcastTransmitter::new(storage.buffer(), RECORD_SIZE).unwrap();

        assert_eq!(
            tx.transmit(0, b"x").err(),
            Some(BroadcastError::InvalidTypeId { type_id: 0 })
        );
        let oversize = vec![0u8; RECORD_SIZE];
        assert_eq!(
            tx.transmit(1, &oversize).err(),
            Some(BroadcastError::PayloadTooLarge {
                length: RECORD_SIZE,
                max: RECORD_SIZE - record_descriptor::HEADER_LENGTH
            })
        );
    }

    #[test]
    fn test_keep_up_with_transmitter() {
        let mut storage = channel_storage();
        let buffer = storage.buffer();
        let mut tx = BroadcastTransmitter::new(buffer, RECORD_SIZE).unwrap();
        let mut rx = BroadcastReceiver::new(buffer).unwrap();

        for i in 1..=5 {
            tx.transmit(i, &[i as u8]).unwrap();
        }

        assert_eq!(rx.keep_up_with_transmitter().unwrap(), 4);
        assert_eq!(rx.lost_transmissions(), 4);

        assert_eq!(rx.receive_next().unwrap(), Receive::Available);
        assert_eq!(rx.sequence(), 5);
    }

    #[test]
    fn test_copy_receiver_delivers_payload() {
        let mut storage = channel_storage();
        let buffer = storage.buffer();
        let mut tx = BroadcastTransmitter::new(buffer, RECORD_SIZE).unwrap();
        let mut rx = CopyBroadcastReceiver::new(BroadcastReceiver::new(buffer).unwrap());

        tx.transmit(9, b"payload").unwrap();

        let mut seen = Vec::new();
        let delivered = rx
            .receive(|type_id, payload| seen.push((type_id, payload.to_vec())))
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(seen, vec![(9, b"payload".to_vec())]);
    }
}
