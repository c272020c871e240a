use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicI16, AtomicI32, AtomicI64, AtomicI8, Ordering};
use thiserror::Error;

// =============================================================================
// MEMORY ORDERING CONTRACT
// =============================================================================
//
// AtomicBuffer is the substrate every concurrent structure in this crate is
// layered on. It provides three tiers of access to a byte region:
//
// 1. Plain accessors: no ordering, unaligned-tolerant. Single-threaded use,
//    or use under a protocol that already established happens-before.
// 2. Volatile accessors: sequentially consistent loads/stores of one word.
// 3. Ordered/RMW accessors: release stores (`put_*_ordered`, `add_*_ordered`)
//    that pair with volatile loads to establish happens-before, and
//    full-fence read-modify-write (`compare_and_set`, `get_and_set`,
//    `get_and_add`).
//
// Every atomic access of width W requires `(base + index) % W == 0`. The
// check happens before an atomic reference is ever formed, so a misaligned
// index surfaces as `BufferError::Unaligned` instead of undefined behaviour.
//
// The buffer never owns its storage. It is a `Copy`-able view; several views
// may alias the same bytes, and the atomic tiers are the only sound way to
// touch bytes that another thread may touch concurrently.
//
// =============================================================================

/// Byte order for multi-byte plain accessors.
///
/// The native order is the default for the orderless accessors; an explicit
/// differing order byte-swaps on access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// The byte order of the target the crate was compiled for.
    pub const NATIVE: ByteOrder = if cfg!(target_endian = "little") {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    };
}

/// Errors surfaced by buffer accessors.
///
/// Capacity exhaustion in the structures layered on the buffer is never an
/// error; these are programmer errors on the access itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Index or index + length falls outside the buffer.
    #[error("index out of bounds: index={index} length={length} capacity={capacity}")]
    OutOfBounds {
        /// Requested byte offset.
        index: usize,
        /// Requested access length in bytes.
        length: usize,
        /// Capacity of the buffer.
        capacity: usize,
    },

    /// Atomic access at an address that is not aligned for its width.
    #[error("unaligned atomic access: address {address:#x} is not divisible by {required}")]
    Unaligned {
        /// Absolute address of the attempted access.
        address: usize,
        /// Required alignment divisor in bytes.
        required: usize,
    },

    /// Bytes at the given range did not parse as an ASCII integer.
    #[error("not an ascii integer: index={index} length={length}")]
    InvalidAscii { index: usize, length: usize },
}

type Result<T> = std::result::Result<T, BufferError>;

/// A random-access view over a contiguous byte region with plain, volatile,
/// ordered, and read-modify-write accessors at byte offsets.
///
/// The view does not own the region. `wrap` borrows a slice for the view's
/// lifetime; `from_raw_parts` wraps an arbitrary region (off-heap, memory
/// mapped) whose validity the caller guarantees. Views are `Copy`, so
/// multiple views over the same storage are expected and supported.
#[derive(Clone, Copy)]
pub struct AtomicBuffer<'a> {
    ptr: *mut u8,
    capacity: usize,
    _lifetime: PhantomData<&'a [u8]>,
}

// SAFETY: all cross-thread access goes through the atomic accessors; the
// plain tiers are documented as requiring external happens-before. The view
// itself is just a pointer and a length.
unsafe impl Send for AtomicBuffer<'_> {}
unsafe impl Sync for AtomicBuffer<'_> {}

impl std::fmt::Debug for AtomicBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("address", &(self.ptr as usize))
            .field("capacity", &self.capacity)
            .finish()
    }
}

macro_rules! plain_accessors {
    ($get:ident, $put:ident, $ty:ty) => {
        /// Plain read in native byte order.
        #[inline]
        pub fn $get(&self, index: usize) -> Result<$ty> {
            self.bounds_check(index, size_of::<$ty>())?;
            // SAFETY: bounds checked above; read_unaligned tolerates any index.
            Ok(unsafe { self.ptr.add(index).cast::<$ty>().read_unaligned() })
        }

        /// Plain write in native byte order.
        #[inline]
        pub fn $put(&self, index: usize, value: $ty) -> Result<()> {
            self.bounds_check(index, size_of::<$ty>())?;
            // SAFETY: bounds checked above; write_unaligned tolerates any index.
            unsafe { self.ptr.add(index).cast::<$ty>().write_unaligned(value) };
            Ok(())
        }
    };
}

macro_rules! ordered_plain_accessors {
    ($get:ident, $put:ident, $get_order:ident, $put_order:ident, $ty:ty) => {
        plain_accessors!($get, $put, $ty);

        /// Plain read in an explicit byte order.
        #[inline]
        pub fn $get_order(&self, index: usize, order: ByteOrder) -> Result<$ty> {
            let raw = self.$get(index)?;
            Ok(match order {
                ByteOrder::LittleEndian => <$ty>::from_le(raw),
                ByteOrder::BigEndian => <$ty>::from_be(raw),
            })
        }

        /// Plain write in an explicit byte order.
        #[inline]
        pub fn $put_order(&self, index: usize, value: $ty, order: ByteOrder) -> Result<()> {
            let raw = match order {
                ByteOrder::LittleEndian => value.to_le(),
                ByteOrder::BigEndian => value.to_be(),
            };
            self.$put(index, raw)
        }
    };
}

macro_rules! atomic_word {
    ($name:ident, $atomic:ty, $ty:ty) => {
        /// Resolves an aligned atomic reference at `index`, or fails with
        /// `OutOfBounds` / `Unaligned`.
        #[inline]
        fn $name(&self, index: usize) -> Result<&$atomic> {
            self.bounds_check(index, size_of::<$ty>())?;
            let address = self.ptr as usize + index;
            if address % size_of::<$ty>() != 0 {
                return Err(BufferError::Unaligned {
                    address,
                    required: size_of::<$ty>(),
                });
            }
            // SAFETY: bounds and alignment verified above; atomics may alias
            // plain data because every access to a shared word goes through
            // this path.
            Ok(unsafe { &*(address as *const $atomic) })
        }
    };
}

impl<'a> AtomicBuffer<'a> {
    /// Wraps an existing byte slice. The view lives as long as the borrow.
    pub fn wrap(slice: &'a mut [u8]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            capacity: slice.len(),
            _lifetime: PhantomData,
        }
    }

    /// Wraps a raw region of `capacity` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `capacity` bytes for the
    /// lifetime `'a`, and must not be deallocated while any copy of the view
    /// is live.
    pub unsafe fn from_raw_parts(ptr: *mut u8, capacity: usize) -> Self {
        Self {
            ptr,
            capacity,
            _lifetime: PhantomData,
        }
    }

    /// Returns a sub-view over `[index, index + length)`.
    pub fn view(&self, index: usize, length: usize) -> Result<AtomicBuffer<'a>> {
        self.bounds_check(index, length)?;
        // SAFETY: the parent view already guarantees validity of the range.
        Ok(unsafe { AtomicBuffer::from_raw_parts(self.ptr.add(index), length) })
    }

    /// Capacity of the viewed region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails if `limit` exceeds the capacity.
    #[inline]
    pub fn check_limit(&self, limit: usize) -> Result<()> {
        if limit > self.capacity {
            Err(BufferError::OutOfBounds {
                index: limit,
                length: 0,
                capacity: self.capacity,
            })
        } else {
            Ok(())
        }
    }

    /// Fails unless the base address is 8-byte aligned, the precondition for
    /// the 8-byte atomic accessors at 8-byte-aligned indices.
    pub fn verify_alignment(&self) -> Result<()> {
        let address = self.ptr as usize;
        if address % size_of::<i64>() != 0 {
            Err(BufferError::Unaligned {
                address,
                required: size_of::<i64>(),
            })
        } else {
            Ok(())
        }
    }

    #[inline]
    fn bounds_check(&self, index: usize, length: usize) -> Result<()> {
        // Overflow-proof form of `index + length > capacity`.
        if index > self.capacity || length > self.capacity - index {
            Err(BufferError::OutOfBounds {
                index,
                length,
                capacity: self.capacity,
            })
        } else {
            Ok(())
        }
    }

    atomic_word!(atomic_i8, AtomicI8, i8);
    atomic_word!(atomic_i16, AtomicI16, i16);
    atomic_word!(atomic_i32, AtomicI32, i32);
    atomic_word!(atomic_i64, AtomicI64, i64);

    // ---------------------------------------------------------------------
    // PLAIN ACCESSORS
    // ---------------------------------------------------------------------

    plain_accessors!(get_u8, put_u8, u8);
    plain_accessors!(get_i8, put_i8, i8);
    ordered_plain_accessors!(get_i16, put_i16, get_i16_order, put_i16_order, i16);
    ordered_plain_accessors!(get_u16, put_u16, get_u16_order, put_u16_order, u16);
    ordered_plain_accessors!(get_i32, put_i32, get_i32_order, put_i32_order, i32);
    ordered_plain_accessors!(get_u32, put_u32, get_u32_order, put_u32_order, u32);
    ordered_plain_accessors!(get_i64, put_i64, get_i64_order, put_i64_order, i64);
    ordered_plain_accessors!(get_u64, put_u64, get_u64_order, put_u64_order, u64);

    /// Plain read of an f32, aliasing the i32 bit pattern.
    #[inline]
    pub fn get_f32(&self, index: usize) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32(index)?))
    }

    /// Plain write of an f32, aliasing the i32 bit pattern.
    #[inline]
    pub fn put_f32(&self, index: usize, value: f32) -> Result<()> {
        self.put_u32(index, value.to_bits())
    }

    /// Plain read of an f64, aliasing the i64 bit pattern.
    #[inline]
    pub fn get_f64(&self, index: usize) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64(index)?))
    }

    /// Plain write of an f64, aliasing the i64 bit pattern.
    #[inline]
    pub fn put_f64(&self, index: usize, value: f64) -> Result<()> {
        self.put_u64(index, value.to_bits())
    }

    /// Explicit-order f32 read; the swap happens on the bit pattern.
    #[inline]
    pub fn get_f32_order(&self, index: usize, order: ByteOrder) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32_order(index, order)?))
    }

    /// Explicit-order f32 write; the swap happens on the bit pattern.
    #[inline]
    pub fn put_f32_order(&self, index: usize, value: f32, order: ByteOrder) -> Result<()> {
        self.put_u32_order(index, value.to_bits(), order)
    }

    /// Explicit-order f64 read; the swap happens on the bit pattern.
    #[inline]
    pub fn get_f64_order(&self, index: usize, order: ByteOrder) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64_order(index, order)?))
    }

    /// Explicit-order f64 write; the swap happens on the bit pattern.
    #[inline]
    pub fn put_f64_order(&self, index: usize, value: f64, order: ByteOrder) -> Result<()> {
        self.put_u64_order(index, value.to_bits(), order)
    }

    // ---------------------------------------------------------------------
    // VOLATILE ACCESSORS (sequentially consistent)
    // ---------------------------------------------------------------------

    /// Volatile read of an i8.
    #[inline]
    pub fn get_i8_volatile(&self, index: usize) -> Result<i8> {
        Ok(self.atomic_i8(index)?.load(Ordering::SeqCst))
    }

    /// Volatile write of an i8.
    #[inline]
    pub fn put_i8_volatile(&self, index: usize, value: i8) -> Result<()> {
        self.atomic_i8(index)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Volatile read of an i16.
    #[inline]
    pub fn get_i16_volatile(&self, index: usize) -> Result<i16> {
        Ok(self.atomic_i16(index)?.load(Ordering::SeqCst))
    }

    /// Volatile write of an i16.
    #[inline]
    pub fn put_i16_volatile(&self, index: usize, value: i16) -> Result<()> {
        self.atomic_i16(index)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Volatile read of an i32. Pairs with `put_i32_ordered` to establish
    /// happens-before.
    #[inline]
    pub fn get_i32_volatile(&self, index: usize) -> Result<i32> {
        Ok(self.atomic_i32(index)?.load(Ordering::SeqCst))
    }

    /// Volatile write of an i32.
    #[inline]
    pub fn put_i32_volatile(&self, index: usize, value: i32) -> Result<()> {
        self.atomic_i32(index)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Volatile read of an i64. Pairs with `put_i64_ordered` to establish
    /// happens-before.
    #[inline]
    pub fn get_i64_volatile(&self, index: usize) -> Result<i64> {
        Ok(self.atomic_i64(index)?.load(Ordering::SeqCst))
    }

    /// Volatile write of an i64.
    #[inline]
    pub fn put_i64_volatile(&self, index: usize, value: i64) -> Result<()> {
        self.atomic_i64(index)?.store(value, Ordering::SeqCst);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // ORDERED STORES AND READ-MODIFY-WRITE
    // ---------------------------------------------------------------------

    /// Release store of an i32.
    #[inline]
    pub fn put_i32_ordered(&self, index: usize, value: i32) -> Result<()> {
        self.atomic_i32(index)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Release store of an i64.
    #[inline]
    pub fn put_i64_ordered(&self, index: usize, value: i64) -> Result<()> {
        self.atomic_i64(index)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Release add to an i32. Returns the previous value.
    #[inline]
    pub fn add_i32_ordered(&self, index: usize, increment: i32) -> Result<i32> {
        Ok(self.atomic_i32(index)?.fetch_add(increment, Ordering::Release))
    }

    /// Release add to an i64. Returns the previous value.
    #[inline]
    pub fn add_i64_ordered(&self, index: usize, increment: i64) -> Result<i64> {
        Ok(self.atomic_i64(index)?.fetch_add(increment, Ordering::Release))
    }

    /// Full-fence compare-and-set of an i32. Returns whether the swap took.
    #[inline]
    pub fn compare_and_set_i32(&self, index: usize, expected: i32, update: i32) -> Result<bool> {
        Ok(self
            .atomic_i32(index)?
            .compare_exchange(expected, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Full-fence compare-and-set of an i64. Returns whether the swap took.
    #[inline]
    pub fn compare_and_set_i64(&self, index: usize, expected: i64, update: i64) -> Result<bool> {
        Ok(self
            .atomic_i64(index)?
            .compare_exchange(expected, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    /// Atomic exchange of an i32. Returns the previous value.
    #[inline]
    pub fn get_and_set_i32(&self, index: usize, value: i32) -> Result<i32> {
        Ok(self.atomic_i32(index)?.swap(value, Ordering::SeqCst))
    }

    /// Atomic exchange of an i64. Returns the previous value.
    #[inline]
    pub fn get_and_set_i64(&self, index: usize, value: i64) -> Result<i64> {
        Ok(self.atomic_i64(index)?.swap(value, Ordering::SeqCst))
    }

    /// Full-fence add to an i32. Returns the previous value.
    #[inline]
    pub fn get_and_add_i32(&self, index: usize, increment: i32) -> Result<i32> {
        Ok(self.atomic_i32(index)?.fetch_add(increment, Ordering::SeqCst))
    }

    /// Full-fence add to an i64. Returns the previous value.
    #[inline]
    pub fn get_and_add_i64(&self, index: usize, increment: i64) -> Result<i64> {
        Ok(self.atomic_i64(index)?.fetch_add(increment, Ordering::SeqCst))
    }

    // ---------------------------------------------------------------------
    // BULK ACCESSORS
    // ---------------------------------------------------------------------

    /// Copies `dest.len()` bytes out of the buffer starting at `index`.
    pub fn get_bytes(&self, index: usize, dest: &mut [u8]) -> Result<()> {
        self.bounds_check(index, dest.len())?;
        // SAFETY: bounds checked; dest is exclusive so the ranges cannot
        // overlap through safe code.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(index), dest.as_mut_ptr(), dest.len());
        }
        Ok(())
    }

    /// Copies `src` into the buffer starting at `index`.
    pub fn put_bytes(&self, index: usize, src: &[u8]) -> Result<()> {
        self.bounds_check(index, src.len())?;
        // SAFETY: bounds checked; src is a shared borrow of memory the caller
        // owns, distinct from the raw region through safe code.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(index), src.len());
        }
        Ok(())
    }

    /// Copies `length` bytes from another buffer view. The views may alias
    /// the same storage.
    pub fn copy_from(
        &self,
        index: usize,
        src: &AtomicBuffer<'_>,
        src_index: usize,
        length: usize,
    ) -> Result<()> {
        self.bounds_check(index, length)?;
        src.bounds_check(src_index, length)?;
        // SAFETY: both ranges bounds checked; copy handles overlap.
        unsafe {
            ptr::copy(src.ptr.add(src_index), self.ptr.add(index), length);
        }
        Ok(())
    }

    /// Fills `[index, index + length)` with `value`.
    pub fn set_memory(&self, index: usize, length: usize, value: u8) -> Result<()> {
        self.bounds_check(index, length)?;
        // SAFETY: bounds checked above.
        unsafe {
            ptr::write_bytes(self.ptr.add(index), value, length);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // STRING AND ASCII ACCESSORS
    // ---------------------------------------------------------------------

    /// Writes a UTF-8 string with a 4-byte little-endian length prefix.
    /// Returns the total bytes written including the prefix.
    pub fn put_string_utf8(&self, index: usize, value: &str) -> Result<usize> {
        let bytes = value.as_bytes();
        self.put_i32_order(index, bytes.len() as i32, ByteOrder::LittleEndian)?;
        self.put_bytes(index + size_of::<i32>(), bytes)?;
        Ok(size_of::<i32>() + bytes.len())
    }

    /// Reads a UTF-8 string written by `put_string_utf8`. Invalid byte
    /// sequences are replaced rather than rejected.
    pub fn get_string_utf8(&self, index: usize) -> Result<String> {
        let length = self.get_i32_order(index, ByteOrder::LittleEndian)? as usize;
        self.get_string_utf8_unprefixed(index + size_of::<i32>(), length)
    }

    /// Writes UTF-8 bytes without a length prefix. Returns the bytes written.
    pub fn put_string_utf8_unprefixed(&self, index: usize, value: &str) -> Result<usize> {
        self.put_bytes(index, value.as_bytes())?;
        Ok(value.len())
    }

    /// Reads `length` bytes as UTF-8 without a length prefix.
    pub fn get_string_utf8_unprefixed(&self, index: usize, length: usize) -> Result<String> {
        let mut bytes = vec![0u8; length];
        self.get_bytes(index, &mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Formats `value` as decimal ASCII at `index`. Returns the digit count
    /// including any leading minus sign.
    pub fn put_i64_ascii(&self, index: usize, value: i64) -> Result<usize> {
        let formatted = value.to_string();
        self.put_bytes(index, formatted.as_bytes())?;
        Ok(formatted.len())
    }

    /// Formats `value` as decimal ASCII at `index`.
    pub fn put_i32_ascii(&self, index: usize, value: i32) -> Result<usize> {
        self.put_i64_ascii(index, i64::from(value))
    }

    /// Parses `length` bytes of decimal ASCII starting at `index`.
    pub fn parse_i64_ascii(&self, index: usize, length: usize) -> Result<i64> {
        let mut bytes = vec![0u8; length];
        self.get_bytes(index, &mut bytes)?;
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BufferError::InvalidAscii { index, length })
    }

    /// Parses `length` bytes of decimal ASCII starting at `index`.
    pub fn parse_i32_ascii(&self, index: usize, length: usize) -> Result<i32> {
        let value = self.parse_i64_ascii(index, length)?;
        i32::try_from(value).map_err(|_| BufferError::InvalidAscii { index, length })
    }
}

/// An owned, zero-initialised, 8-byte-aligned heap region for callers that
/// do not bring their own storage (tests, examples, single-process use).
///
/// The backing allocation is a `u64` slice, which guarantees the base
/// alignment the atomic accessors need.
pub struct AlignedBuffer {
    words: Box<[u64]>,
    capacity: usize,
}

impl AlignedBuffer {
    /// Allocates `capacity` zeroed bytes with an 8-byte-aligned base.
    pub fn with_capacity(capacity: usize) -> Self {
        let words = vec![0u64; capacity.div_ceil(8)].into_boxed_slice();
        Self { words, capacity }
    }

    /// Returns a view over the owned region. The view is `Copy`; take as
    /// many as needed.
    pub fn buffer(&mut self) -> AtomicBuffer<'_> {
        // SAFETY: the words allocation is valid, writable, and outlives the
        // returned borrow.
        unsafe { AtomicBuffer::from_raw_parts(self.words.as_mut_ptr().cast::<u8>(), self.capacity) }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
