use crate::buffer::{AtomicBuffer, BufferError};
use std::ops::Deref;
use thiserror::Error;

// =============================================================================
// COUNTERS LAYOUT
// =============================================================================
//
// Two collaborating buffers keyed by counter id:
//
//   values buffer:   one i64 per two-cache-line slot, the rest padding, so
//                    two hot counters never share a line
//   metadata buffer: one four-cache-line record per counter:
//
//       [i32 label_length][label bytes ... padded to half the record]
//       [i32 type_id][key bytes ... padded to the record end]
//
// The label length word doubles as the record state: -1 reclaimed, 0 unused
// (the iteration terminator, guaranteed by zero-initialised storage), > 0 in
// use. An allocator publishes a record by release-storing the label length
// last, so a reader that observes it sees the whole record.
//
// =============================================================================

/// Offsets and strides of the two counter buffers.
pub mod counter_descriptor {
    use crate::bits::CACHE_LINE_LENGTH;

    /// Stride of one value slot in the values buffer.
    pub const COUNTER_LENGTH: usize = CACHE_LINE_LENGTH * 2;

    /// Stride of one metadata record in the metadata buffer.
    pub const METADATA_LENGTH: usize = CACHE_LINE_LENGTH * 4;

    /// Offset of the type id within a metadata record.
    pub const TYPE_ID_OFFSET: usize = METADATA_LENGTH / 2;

    /// Offset of the key blob within a metadata record.
    pub const KEY_OFFSET: usize = TYPE_ID_OFFSET + 4;

    /// Longest label stored, in bytes.
    pub const MAX_LABEL_LENGTH: usize = TYPE_ID_OFFSET - 4;

    /// Longest key blob stored, in bytes.
    pub const MAX_KEY_LENGTH: usize = METADATA_LENGTH - KEY_OFFSET;

    /// Label length marking a freed record, skipped during iteration.
    pub const RECORD_RECLAIMED: i32 = -1;

    /// Label length marking a never-used record, the iteration terminator.
    pub const RECORD_UNUSED: i32 = 0;

    /// Byte offset of a counter's value slot.
    #[inline]
    pub fn counter_offset(id: i32) -> usize {
        id as usize * COUNTER_LENGTH
    }

    /// Byte offset of a counter's metadata record.
    #[inline]
    pub fn metadata_offset(id: i32) -> usize {
        id as usize * METADATA_LENGTH
    }
}

/// Errors for counter allocation and access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CountersError {
    /// The metadata buffer cannot describe every counter the values buffer
    /// can hold; it must be at least twice the values capacity.
    #[error(
        "metadata buffer of {metadata_capacity} bytes too small for values buffer of {values_capacity} bytes"
    )]
    MetadataTooSmall {
        values_capacity: usize,
        metadata_capacity: usize,
    },

    /// The values buffer has no slot for another counter.
    #[error("no values slot available for counter id {id}")]
    ValuesExhausted { id: i32 },

    /// The metadata buffer has no record for another counter.
    #[error("no metadata record available for counter id {id}")]
    MetadataExhausted { id: i32 },

    /// Counter id outside the allocated range.
    #[error("counter id out of range: {id}")]
    InvalidCounterId { id: i32 },

    /// Underlying buffer access failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

type Result<T> = std::result::Result<T, CountersError>;

/// Read surface over the values and metadata buffers. Safe to hold in any
/// number of observer threads.
pub struct CountersReader<'a> {
    values: AtomicBuffer<'a>,
    metadata: AtomicBuffer<'a>,
    max_counter_id: i32,
}

impl<'a> CountersReader<'a> {
    /// Wraps the two buffers. The values base must be 8-byte aligned and the
    /// metadata buffer at least twice the values capacity.
    pub fn new(values: AtomicBuffer<'a>, metadata: AtomicBuffer<'a>) -> Result<Self> {
        values.verify_alignment()?;
        if metadata.capacity() < values.capacity() * 2 {
            return Err(CountersError::MetadataTooSmall {
                values_capacity: values.capacity(),
                metadata_capacity: metadata.capacity(),
            });
        }

        Ok(Self {
            values,
            metadata,
            max_counter_id: (values.capacity() / counter_descriptor::COUNTER_LENGTH) as i32,
        })
    }

    /// Exclusive upper bound on counter ids this pair of buffers can hold.
    #[inline]
    pub fn max_counter_id(&self) -> i32 {
        self.max_counter_id
    }

    /// Volatile load of a counter's value.
    pub fn counter_value(&self, id: i32) -> Result<i64> {
        self.check_id(id)?;
        self.values
            .get_i64_volatile(counter_descriptor::counter_offset(id))
            .map_err(CountersError::from)
    }

    /// Label of a counter, empty if reclaimed or unused.
    pub fn label(&self, id: i32) -> Result<String> {
        self.check_id(id)?;
        let offset = counter_descriptor::metadata_offset(id);
        let length = self.metadata.get_i32_volatile(offset)?;
        if length <= 0 {
            return Ok(String::new());
        }
        let length = (length as usize).min(counter_descriptor::MAX_LABEL_LENGTH);
        self.metadata
            .get_string_utf8_unprefixed(offset + 4, length)
            .map_err(CountersError::from)
    }

    /// Type id recorded for a counter.
    pub fn counter_type_id(&self, id: i32) -> Result<i32> {
        self.check_id(id)?;
        self.metadata
            .get_i32(counter_descriptor::metadata_offset(id) + counter_descriptor::TYPE_ID_OFFSET)
            .map_err(CountersError::from)
    }

    /// Iterates allocated counters as `(id, type_id, label)` in id order,
    /// stopping at the first never-used record and skipping reclaimed ones.
    pub fn for_each<F>(&self, mut consumer: F) -> Result<()>
    where
        F: FnMut(i32, i32, &str),
    {
        for id in 0..self.max_counter_id {
            let offset = counter_descriptor::metadata_offset(id);
            let label_length = self.metadata.get_i32_volatile(offset)?;

            if label_length == counter_descriptor::RECORD_UNUSED {
                break;
            }
            if label_length == counter_descriptor::RECORD_RECLAIMED {
                continue;
            }

            let length = (label_length as usize).min(counter_descriptor::MAX_LABEL_LENGTH);
            let label = self.metadata.get_string_utf8_unprefixed(offset + 4, length)?;
            let type_id = self
                .metadata
                .get_i32(offset + counter_descriptor::TYPE_ID_OFFSET)?;
            consumer(id, type_id, &label);
        }
        Ok(())
    }

    fn check_id(&self, id: i32) -> Result<()> {
        if id < 0 || id >= self.max_counter_id {
            Err(CountersError::InvalidCounterId { id })
        } else {
            Ok(())
        }
    }
}

/// Allocator side of the counters fabric. Exactly one manager owns
/// allocation over a buffer pair; readers are unrestricted.
pub struct CountersManager<'a> {
    reader: CountersReader<'a>,
    free_list: Vec<i32>,
    high_water_mark: i32,
}

impl<'a> CountersManager<'a> {
    /// Wraps the two buffers for allocation. Same constraints as
    /// `CountersReader::new`.
    pub fn new(values: AtomicBuffer<'a>, metadata: AtomicBuffer<'a>) -> Result<Self> {
        Ok(Self {
            reader: CountersReader::new(values, metadata)?,
            free_list: Vec::new(),
            high_water_mark: 0,
        })
    }

    /// Allocates a counter with a label and default type id.
    pub fn allocate(&mut self, label: &str) -> Result<i32> {
        self.allocate_with(label, 0, |_| {})
    }

    /// Allocates a counter, recording `type_id` and letting `key_writer`
    /// fill the record's key region. Freed ids are reused in LIFO order
    /// before the high-water mark advances.
    pub fn allocate_with<F>(&mut self, label: &str, type_id: i32, key_writer: F) -> Result<i32>
    where
        F: FnOnce(&AtomicBuffer<'a>),
    {
        let id = self.free_list.pop().unwrap_or(self.high_water_mark);

        let counter_offset = counter_descriptor::counter_offset(id);
        if counter_offset + counter_descriptor::COUNTER_LENGTH > self.reader.values.capacity() {
            return Err(CountersError::ValuesExhausted { id });
        }
        let metadata_offset = counter_descriptor::metadata_offset(id);
        if metadata_offset + counter_descriptor::METADATA_LENGTH > self.reader.metadata.capacity() {
            return Err(CountersError::MetadataExhausted { id });
        }

        // Reset any previous occupant. The label length word is left alone
        // until the final release store: a concurrent iterator must never
        // observe a transient zero, which would read as the terminator.
        self.reader.metadata.set_memory(
            metadata_offset + 4,
            counter_descriptor::METADATA_LENGTH - 4,
            0,
        )?;
        self.reader.values.put_i64_ordered(counter_offset, 0)?;

        self.reader.metadata.put_i32(
            metadata_offset + counter_descriptor::TYPE_ID_OFFSET,
            type_id,
        )?;
        let key_view = self.reader.metadata.view(
            metadata_offset + counter_descriptor::KEY_OFFSET,
            counter_descriptor::MAX_KEY_LENGTH,
        )?;
        key_writer(&key_view);

        let label_bytes = truncate_at_char_boundary(label);
        self.reader.metadata.put_bytes(metadata_offset + 4, label_bytes)?;
        self.reader
            .metadata
            .put_i32_ordered(metadata_offset, label_bytes.len() as i32)?;

        if id == self.high_water_mark {
            self.high_water_mark += 1;
        }
        Ok(id)
    }

    /// Frees a counter id for reuse. Its metadata record is marked
    /// reclaimed so iteration skips it.
    pub fn free(&mut self, id: i32) -> Result<()> {
        self.reader.check_id(id)?;
        self.reader.metadata.put_i32_ordered(
            counter_descriptor::metadata_offset(id),
            counter_descriptor::RECORD_RECLAIMED,
        )?;
        self.free_list.push(id);
        Ok(())
    }

    /// Allocates a counter and binds a handle to its value slot.
    pub fn new_counter(&mut self, label: &str) -> Result<AtomicCounter<'a>> {
        let id = self.allocate(label)?;
        Ok(AtomicCounter::new(self.reader.values, id))
    }
}

impl<'a> Deref for CountersManager<'a> {
    type Target = CountersReader<'a>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

fn truncate_at_char_boundary(label: &str) -> &[u8] {
    if label.len() <= counter_descriptor::MAX_LABEL_LENGTH {
        return label.as_bytes();
    }
    let mut end = counter_descriptor::MAX_LABEL_LENGTH;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label.as_bytes()[..end]
}

/// Handle bound to one counter's value slot. Every operation is a single
/// 8-byte atomic at the slot offset.
pub struct AtomicCounter<'a> {
    buffer: AtomicBuffer<'a>,
    id: i32,
    offset: usize,
}

impl<'a> AtomicCounter<'a> {
    /// Binds a handle to an allocated id over the values buffer.
    pub fn new(values: AtomicBuffer<'a>, id: i32) -> Self {
        Self {
            buffer: values,
            id,
            offset: counter_descriptor::counter_offset(id),
        }
    }

    /// Id this handle is bound to.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Full-fence increment. Returns the previous value.
    #[inline]
    pub fn increment(&self) -> Result<i64> {
        self.add(1)
    }

    /// Release increment for a single-writer counter. Returns the previous
    /// value.
    #[inline]
    pub fn increment_ordered(&self) -> Result<i64> {
        self.add_ordered(1)
    }

    /// Full-fence add. Returns the previous value.
    #[inline]
    pub fn add(&self, amount: i64) -> Result<i64> {
        self.buffer
            .get_and_add_i64(self.offset, amount)
            .map_err(CountersError::from)
    }

    /// Release add for a single-writer counter. Returns the previous value.
    #[inline]
    pub fn add_ordered(&self, amount: i64) -> Result<i64> {
        self.buffer
            .add_i64_ordered(self.offset, amount)
            .map_err(CountersError::from)
    }

    /// Volatile store.
    #[inline]
    pub fn set(&self, value: i64) -> Result<()> {
        self.buffer
            .put_i64_volatile(self.offset, value)
            .map_err(CountersError::from)
    }

    /// Release store for a single-writer counter.
    #[inline]
    pub fn set_ordered(&self, value: i64) -> Result<()> {
        self.buffer
            .put_i64_ordered(self.offset, value)
            .map_err(CountersError::from)
    }

    /// Plain load; only sound from the owning writer thread.
    #[inline]
    pub fn get(&self) -> Result<i64> {
        self.buffer.get_i64(self.offset).map_err(CountersError::from)
    }

    /// Volatile load.
    #[inline]
    pub fn get_volatile(&self) -> Result<i64> {
        self.buffer
            .get_i64_volatile(self.offset)
            .map_err(CountersError::from)
    }

    /// Full-fence compare-and-set.
    #[inline]
    pub fn compare_and_set(&self, expected: i64, update: i64) -> Result<bool> {
        self.buffer
            .compare_and_set_i64(self.offset, expected, update)
            .map_err(CountersError::from)
    }

    /// Releases the counter's id back to the manager.
    pub fn close(self, manager: &mut CountersManager<'a>) -> Result<()> {
        manager.free(self.id)
    }
}
