//! Fixed-capacity FIFO of byte messages living in shared memory.

use crate::Error;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Bytes in front of each slot's payload recording how much of the slot is used.
pub(crate) const SLOT_LENGTH: usize = std::mem::size_of::<u32>();

/// Control block at the start of every buffer. Only touched while `lock` is held.
#[repr(C)]
pub(crate) struct RingHeader {
    lock: AtomicU32,
    _reserved: u32,
    read_index: AtomicU64,
    write_index: AtomicU64,
    len: AtomicU64,
}

/// Sizes of one buffer: `capacity` slots of up to `slot_size` payload bytes each.
///
/// Only constructed through [`Geometry::new()`], which guarantees every offset inside the buffer fits in a `usize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub(crate) capacity: usize,
    pub(crate) slot_size: usize,
    /// Distance between the starts of consecutive slots.
    pub(crate) stride: usize,
    /// Bytes occupied by the whole buffer, header included.
    pub(crate) footprint: usize,
}

impl Geometry {
    /// Returns `None` if a buffer of this size could not be addressed.
    pub(crate) fn new(capacity: usize, slot_size: usize) -> Option<Self> {
        let stride = SLOT_LENGTH
            .checked_add(slot_size)?
            .checked_next_multiple_of(std::mem::align_of::<RingHeader>())?;
        let footprint = stride
            .checked_mul(capacity)?
            .checked_add(std::mem::size_of::<RingHeader>())?;
        Some(Self {
            capacity,
            slot_size,
            stride,
            footprint,
        })
    }
}

/// A view of one circular buffer inside a mapped region.
///
/// Any number of processes may hold a view of the same buffer. A spinlock in the [`RingHeader`] serializes access,
/// and the lock's acquire/release pairs publish the slot contents between processes. Writes fail rather than wait
/// when the buffer is full and reads fail rather than wait when it is empty; waiting is left to the caller.
#[derive(Debug)]
pub(crate) struct CircularBuffer {
    header: NonNull<RingHeader>,
    slots: NonNull<u8>,
    geometry: Geometry,
}

struct LockGuard<'a>(&'a AtomicU32);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::Release);
    }
}

impl CircularBuffer {
    /// Reset the buffer at `base` to empty and return a view of it.
    ///
    /// # Safety
    ///
    /// `base` must be aligned for [`RingHeader`] and point to `geometry.footprint` writable bytes that no other view
    /// is using yet and that outlive every view of this buffer.
    pub(crate) unsafe fn initialize(base: NonNull<u8>, geometry: Geometry) -> Self {
        base.cast::<RingHeader>().as_ptr().write(RingHeader {
            lock: AtomicU32::new(0),
            _reserved: 0,
            read_index: AtomicU64::new(0),
            write_index: AtomicU64::new(0),
            len: AtomicU64::new(0),
        });
        Self::attach(base, geometry)
    }

    /// View an already initialized buffer at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a buffer set up by [`initialize()`] with the same `geometry`, and the memory must outlive
    /// the view.
    ///
    /// [`initialize()`]: CircularBuffer::initialize
    pub(crate) unsafe fn attach(base: NonNull<u8>, geometry: Geometry) -> Self {
        let slots = NonNull::new_unchecked(base.as_ptr().add(std::mem::size_of::<RingHeader>()));
        Self {
            header: base.cast(),
            slots,
            geometry,
        }
    }

    fn header(&self) -> &RingHeader {
        // Safety: the header was initialized before any view was created and outlives self.
        unsafe { self.header.as_ref() }
    }

    fn lock(&self) -> LockGuard<'_> {
        let lock = &self.header().lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        LockGuard(lock)
    }

    fn slot(&self, index: u64) -> *mut u8 {
        // Safety: index is always reduced modulo capacity, so the slot lies inside the buffer's footprint.
        unsafe { self.slots.as_ptr().add(index as usize * self.geometry.stride) }
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.geometry.slot_size
    }

    pub(crate) fn len(&self) -> usize {
        let _guard = self.lock();
        self.header().len.load(Ordering::Relaxed) as usize
    }

    /// Append `bytes` unless the buffer is full. Returns whether the message was written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if `bytes` does not fit in one slot.
    pub(crate) fn try_write(&self, bytes: &[u8]) -> crate::Result<bool> {
        if bytes.len() > self.geometry.slot_size {
            return Err(Error::MessageTooLarge {
                size: bytes.len(),
                slot_size: self.geometry.slot_size,
            });
        }

        let _guard = self.lock();
        let header = self.header();
        let len = header.len.load(Ordering::Relaxed);
        if len as usize >= self.geometry.capacity {
            return Ok(false);
        }

        let index = header.write_index.load(Ordering::Relaxed);
        let slot = self.slot(index);
        // Safety: the slot has room for the length word plus slot_size bytes, and the lock is held.
        unsafe {
            slot.cast::<u32>().write_unaligned(bytes.len() as u32);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.add(SLOT_LENGTH), bytes.len());
        }
        header
            .write_index
            .store((index + 1) % self.geometry.capacity as u64, Ordering::Relaxed);
        header.len.store(len + 1, Ordering::Relaxed);
        Ok(true)
    }

    /// Move the oldest message into `out`, replacing its contents. Returns false if the buffer is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] if the slot records a length larger than a slot, which means the region has
    /// been corrupted.
    pub(crate) fn try_read(&self, out: &mut Vec<u8>) -> crate::Result<bool> {
        let _guard = self.lock();
        let header = self.header();
        let len = header.len.load(Ordering::Relaxed);
        if len == 0 {
            return Ok(false);
        }

        let index = header.read_index.load(Ordering::Relaxed);
        let slot = self.slot(index);
        // Safety: the slot lies inside the buffer and the lock is held.
        let size = unsafe { slot.cast::<u32>().read_unaligned() } as usize;
        if size > self.geometry.slot_size {
            return Err(Error::InvalidEncoding(format!(
                "slot {index} claims {size} bytes but slots hold {}",
                self.geometry.slot_size
            )));
        }
        out.clear();
        // Safety: size was checked against the slot's payload area above.
        out.extend_from_slice(unsafe { std::slice::from_raw_parts(slot.add(SLOT_LENGTH), size) });

        header
            .read_index
            .store((index + 1) % self.geometry.capacity as u64, Ordering::Relaxed);
        header.len.store(len - 1, Ordering::Relaxed);
        Ok(true)
    }
}
