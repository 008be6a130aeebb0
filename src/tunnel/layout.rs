use super::circular_buffer::Geometry;
use crate::Error;
use std::sync::atomic::AtomicU64;

/// Marks an initialized tunnel region. Written last by the creator so that a half-built region is never trusted.
pub(crate) const MAGIC: u64 = 0x7061_7273_796e_6301;

/// Control block at offset zero of every tunnel region.
#[repr(C)]
pub(crate) struct TunnelHeader {
    pub(crate) magic: AtomicU64,
    pub(crate) buffer_count: u64,
    pub(crate) capacity: u64,
    pub(crate) slot_size: u64,
    pub(crate) record_size: u64,
}

/// Where everything lives inside a tunnel region.
///
/// The header and the shared record share the first pages; each circular buffer then starts on its own page. Two
/// spare pages are added at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub(crate) page: usize,
    pub(crate) record_offset: usize,
    pub(crate) buffers_offset: usize,
    pub(crate) buffer_pages: usize,
    pub(crate) buffer_count: usize,
    pub(crate) ring: Geometry,
    pub(crate) total: usize,
}

impl Layout {
    /// Lay out a region for the tunnel called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionLayout`] if any count or size is zero, a slot is larger than its `u32` length word can
    /// describe, or the region would not fit in the address space.
    pub(crate) fn compute(
        name: &str,
        page: usize,
        record_size: usize,
        record_align: usize,
        buffer_count: usize,
        capacity: usize,
        slot_size: usize,
    ) -> crate::Result<Self> {
        let invalid = |reason: String| Error::RegionLayout {
            name: name.to_owned(),
            reason,
        };
        if buffer_count == 0 || capacity == 0 || slot_size == 0 {
            return Err(invalid(format!(
                "{buffer_count} buffers of {capacity} slots of {slot_size} bytes cannot carry a message"
            )));
        }
        if slot_size > u32::MAX as usize {
            return Err(invalid(format!("{slot_size}-byte slots are longer than a slot can record")));
        }
        let too_large = || {
            invalid(format!(
                "{buffer_count} buffers of {capacity} slots of {slot_size} bytes do not fit in the address space"
            ))
        };

        let ring = Geometry::new(capacity, slot_size).ok_or_else(too_large)?;
        let record_offset = std::mem::size_of::<TunnelHeader>().next_multiple_of(record_align.max(8));
        let shared_pages = 1 + (record_offset + record_size) / page;
        let buffer_pages = 1 + ring.footprint / page;
        let total = buffer_count
            .checked_mul(buffer_pages)
            .and_then(|pages| pages.checked_add(2 + shared_pages))
            .and_then(|pages| pages.checked_mul(page))
            .filter(|&total| total <= isize::MAX as usize)
            .ok_or_else(too_large)?;

        Ok(Self {
            page,
            record_offset,
            buffers_offset: shared_pages * page,
            buffer_pages,
            buffer_count,
            ring,
            total,
        })
    }

    /// Offset of buffer `index`, which must be below `buffer_count`.
    pub(crate) fn buffer_offset(&self, index: usize) -> usize {
        self.buffers_offset + index * self.buffer_pages * self.page
    }

    /// Check that every part of the layout fits in a mapping of `available` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionTooSmall`] naming the bytes needed.
    pub(crate) fn verify(&self, available: usize) -> crate::Result {
        let required = self.buffer_offset(self.buffer_count - 1) + self.ring.footprint;
        if required > available {
            return Err(Error::RegionTooSmall { required, available });
        }
        Ok(())
    }
}
