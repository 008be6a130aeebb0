//! Message queues between processes on one host, carried in a named shared-memory region.
//!
//! One process creates an [`IpcTunnel`] under a name; any number of others open it by that name. The region holds a
//! small control header, one [`SharedRecord`] both sides can see, and a fixed set of circular buffers addressed by
//! index. Messages are serialized with the crate's [`Serialize`] framework into fixed-size slots, so any type that can
//! cross a rank boundary can also cross a tunnel.

mod circular_buffer;
mod layout;
mod region;

use crate::serialization::{self, Serialize};
use crate::Error;
use circular_buffer::CircularBuffer;
use layout::{Layout, TunnelHeader, MAGIC};
use region::ShmRegion;
use std::ffi::CString;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

/// Settings for a tunnel created by [`IpcTunnel::create()`]. Peers read them back from the region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Number of circular buffers. Defaults to 1.
    pub buffers: usize,
    /// Messages each buffer holds before writers block. Defaults to 64.
    pub capacity: usize,
    /// Largest serialized message, in bytes. Defaults to 4096.
    pub slot_size: usize,
}

impl TunnelConfig {
    pub fn with_buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            buffers: 1,
            capacity: 64,
            slot_size: 4096,
        }
    }
}

/// How a handle came to exist, which decides who removes the region's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    /// Created the region. Removes its name when dropped.
    Owner,
    /// Opened an existing region. Never removes it implicitly.
    Peer,
}

/// A value that can live in a tunnel's shared record.
///
/// # Safety
///
/// Implementors must be valid when placed in memory mapped into several processes at different addresses: no
/// pointers, references, or heap ownership, and no destructor that matters. All mutation after construction must go
/// through interior mutability that is safe across processes, such as atomics.
pub unsafe trait SharedRecord: Default + Sync + 'static {}

// Safety: zero-sized, nothing to share.
unsafe impl SharedRecord for () {}
// Safety: atomics are address-free and lock-free.
unsafe impl SharedRecord for AtomicBool {}
// Safety: as above.
unsafe impl SharedRecord for AtomicU32 {}
// Safety: as above.
unsafe impl SharedRecord for AtomicU64 {}
// Safety: as above.
unsafe impl SharedRecord for AtomicUsize {}

/// Handle onto a shared-memory tunnel carrying `Message`s and one `Record`.
///
/// Writing blocks while the target buffer is full and reading blocks while it is empty; both wait by spinning and
/// yielding the thread, with no timeout. Each buffer supports any number of readers and writers, but message order is
/// only meaningful with a single writer per buffer, which is the caller's responsibility.
///
/// ```no_run
/// use parsync::tunnel::{IpcTunnel, TunnelConfig};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let owner: IpcTunnel<AtomicU64, u64> = IpcTunnel::create("my-tunnel", TunnelConfig::default())?;
/// let peer: IpcTunnel<AtomicU64, u64> = IpcTunnel::open("my-tunnel")?;
///
/// owner.shared_data().store(7, Ordering::Release);
/// owner.write_message(0, &mut 42)?;
/// assert_eq!(42, peer.read_message(0)?);
/// assert_eq!(7, peer.shared_data().load(Ordering::Acquire));
/// # Ok::<(), parsync::Error>(())
/// ```
pub struct IpcTunnel<Record, Message>
where
    Record: SharedRecord,
    Message: Serialize + Default,
{
    name: String,
    path: CString,
    role: TunnelRole,
    layout: Layout,
    record: NonNull<Record>,
    buffers: Vec<CircularBuffer>,
    region: ShmRegion,
    _messages: PhantomData<fn(Message) -> Message>,
}

// Safety: every access to the mapped memory goes through atomics or a buffer's spinlock, the record is Sync, and the
// mapping lives as long as the handle.
unsafe impl<Record, Message> Send for IpcTunnel<Record, Message>
where
    Record: SharedRecord,
    Message: Serialize + Default,
{
}

// Safety: as for Send; no method hands out unsynchronized access to the region.
unsafe impl<Record, Message> Sync for IpcTunnel<Record, Message>
where
    Record: SharedRecord,
    Message: Serialize + Default,
{
}

impl<Record, Message> IpcTunnel<Record, Message>
where
    Record: SharedRecord,
    Message: Serialize + Default,
{
    /// Create a new region called `name`, replacing any region left over under the same name.
    ///
    /// The handle owns the region it created. Dropping it removes the name only while the name still refers to that
    /// region, so an owner whose region was replaced by a later [`create()`] leaves its successor alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionLayout`] for an unusable name or a configuration with a zero dimension or too large to
    /// address, [`Error::RegionTooSmall`] if the layout does not fit the mapping, and [`Error::Os`] if the operating
    /// system refuses the region.
    ///
    /// [`create()`]: IpcTunnel::create
    pub fn create(name: &str, config: TunnelConfig) -> crate::Result<Self> {
        let path = region::shm_path(name)?;
        let layout = Layout::compute(
            name,
            region::page_size(),
            std::mem::size_of::<Record>(),
            std::mem::align_of::<Record>(),
            config.buffers,
            config.capacity,
            config.slot_size,
        )?;
        if region::unlink(&path)? {
            warn!(name, "removed stale shared-memory region");
        }

        let region = ShmRegion::create(&path, layout.total)?;
        layout.verify(region.len())?;

        let base = region.base();
        // Safety: the region is freshly created, page aligned, at least layout.total bytes long, and no other handle
        // trusts it until the magic number is stored below.
        let (record, buffers) = unsafe {
            base.cast::<TunnelHeader>().as_ptr().write(TunnelHeader {
                magic: AtomicU64::new(0),
                buffer_count: config.buffers as u64,
                capacity: config.capacity as u64,
                slot_size: config.slot_size as u64,
                record_size: std::mem::size_of::<Record>() as u64,
            });
            let record = NonNull::new_unchecked(base.as_ptr().add(layout.record_offset)).cast::<Record>();
            record.as_ptr().write(Record::default());
            let buffers = (0..layout.buffer_count)
                .map(|index| {
                    let start = NonNull::new_unchecked(base.as_ptr().add(layout.buffer_offset(index)));
                    CircularBuffer::initialize(start, layout.ring)
                })
                .collect();
            base.cast::<TunnelHeader>().as_ref().magic.store(MAGIC, Ordering::Release);
            (record, buffers)
        };

        debug!(name, buffers = config.buffers, capacity = config.capacity, bytes = layout.total, "created tunnel");
        Ok(Self {
            name: name.to_owned(),
            path,
            role: TunnelRole::Owner,
            layout,
            record,
            buffers,
            region,
            _messages: PhantomData,
        })
    }

    /// Open the region another process created under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if no such region exists, [`Error::RegionLayout`] if it was not created by a tunnel with
    /// the same record type or its header describes an impossible layout, and [`Error::RegionTooSmall`] if it is
    /// shorter than its own header claims.
    pub fn open(name: &str) -> crate::Result<Self> {
        let path = region::shm_path(name)?;
        let region = ShmRegion::open(&path)?;
        let layout_error = |reason: String| Error::RegionLayout {
            name: name.to_owned(),
            reason,
        };

        if region.len() < std::mem::size_of::<TunnelHeader>() {
            return Err(Error::RegionTooSmall {
                required: std::mem::size_of::<TunnelHeader>(),
                available: region.len(),
            });
        }
        // Safety: the mapping is page aligned and long enough for the header.
        let header = unsafe { region.base().cast::<TunnelHeader>().as_ref() };
        if header.magic.load(Ordering::Acquire) != MAGIC {
            return Err(layout_error("region is not an initialized tunnel".into()));
        }
        if header.record_size != std::mem::size_of::<Record>() as u64 {
            return Err(layout_error(format!(
                "shared record is {} bytes but {} were expected",
                header.record_size,
                std::mem::size_of::<Record>()
            )));
        }

        let dimension = |value: u64| {
            usize::try_from(value).map_err(|_| layout_error(format!("header dimension {value} does not fit in memory")))
        };
        let layout = Layout::compute(
            name,
            region::page_size(),
            std::mem::size_of::<Record>(),
            std::mem::align_of::<Record>(),
            dimension(header.buffer_count)?,
            dimension(header.capacity)?,
            dimension(header.slot_size)?,
        )?;
        layout.verify(region.len())?;

        let base = region.base();
        // Safety: the layout was verified against the mapping and the creator initialized every part before
        // publishing the magic number.
        let (record, buffers) = unsafe {
            let record = NonNull::new_unchecked(base.as_ptr().add(layout.record_offset)).cast::<Record>();
            let buffers = (0..layout.buffer_count)
                .map(|index| {
                    let start = NonNull::new_unchecked(base.as_ptr().add(layout.buffer_offset(index)));
                    CircularBuffer::attach(start, layout.ring)
                })
                .collect();
            (record, buffers)
        };

        debug!(name, buffers = layout.buffer_count, "opened tunnel");
        Ok(Self {
            name: name.to_owned(),
            path,
            role: TunnelRole::Peer,
            layout,
            record,
            buffers,
            region,
            _messages: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Messages each buffer holds.
    pub fn capacity(&self) -> usize {
        self.layout.ring.capacity
    }

    /// Largest serialized message accepted.
    pub fn slot_size(&self) -> usize {
        self.layout.ring.slot_size
    }

    /// Bytes mapped for the whole region.
    pub fn region_size(&self) -> usize {
        self.region.len()
    }

    /// Messages currently waiting in `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueIndex`] if `queue` is out of range.
    pub fn pending(&self, queue: usize) -> crate::Result<usize> {
        Ok(self.buffer(queue)?.len())
    }

    /// The record shared by every handle on this region.
    pub fn shared_data(&self) -> &Record {
        // Safety: the record was constructed before the region was published and lives as long as the mapping.
        unsafe { self.record.as_ref() }
    }

    fn buffer(&self, queue: usize) -> crate::Result<&CircularBuffer> {
        self.buffers.get(queue).ok_or(Error::QueueIndex {
            index: queue,
            count: self.buffers.len(),
        })
    }

    /// Serialize `message` into `queue`, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueIndex`] for a bad queue, [`Error::MessageTooLarge`] if the serialized message exceeds the
    /// slot size, or any serialization error.
    pub fn write_message(&self, queue: usize, message: &mut Message) -> crate::Result {
        let buffer = self.buffer(queue)?;
        let bytes = serialization::pack(message)?;
        trace!(tunnel = %self.name, queue, bytes = bytes.len(), "writing message");
        while !buffer.try_write(&bytes)? {
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Take the oldest message from `queue`, waiting for one if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueIndex`] for a bad queue, or any error unpacking the message.
    pub fn read_message(&self, queue: usize) -> crate::Result<Message> {
        let buffer = self.buffer(queue)?;
        let mut bytes = Vec::with_capacity(buffer.slot_size());
        while !buffer.try_read(&mut bytes)? {
            std::thread::yield_now();
        }
        trace!(tunnel = %self.name, queue, bytes = bytes.len(), "read message");
        serialization::unpack(&bytes)
    }

    /// Take the oldest message from `queue` if there is one, without waiting.
    ///
    /// # Errors
    ///
    /// As for [`read_message()`].
    ///
    /// [`read_message()`]: IpcTunnel::read_message
    pub fn read_message_nb(&self, queue: usize) -> crate::Result<Option<Message>> {
        let buffer = self.buffer(queue)?;
        let mut bytes = Vec::new();
        if buffer.try_read(&mut bytes)? {
            serialization::unpack(&bytes).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Remove the region's name so that nobody else can open it. Existing handles keep working until dropped.
    ///
    /// With `remove_all`, removal is repeated until no region by this name remains. Calling this again once the name
    /// is gone does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the operating system refuses the removal for a reason other than the name being gone.
    pub fn shutdown(&self, remove_all: bool) -> crate::Result {
        if remove_all {
            while region::unlink(&self.path)? {}
        } else {
            region::unlink(&self.path)?;
        }
        debug!(tunnel = %self.name, path = ?self.region.path(), remove_all, "tunnel shut down");
        Ok(())
    }
}

impl<Record, Message> Drop for IpcTunnel<Record, Message>
where
    Record: SharedRecord,
    Message: Serialize + Default,
{
    fn drop(&mut self) {
        if self.role == TunnelRole::Owner {
            match self.region.unlink_if_current() {
                Ok(true) => debug!(tunnel = %self.name, "removed tunnel region"),
                Ok(false) => debug!(tunnel = %self.name, "tunnel region already removed or replaced"),
                Err(err) => warn!(tunnel = %self.name, %err, "could not remove tunnel region"),
            }
        }
    }
}

impl<Record, Message> std::fmt::Debug for IpcTunnel<Record, Message>
where
    Record: SharedRecord,
    Message: Serialize + Default,
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("IpcTunnel")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("buffers", &self.buffers.len())
            .field("capacity", &self.layout.ring.capacity)
            .field("slot_size", &self.layout.ring.slot_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(test: &str) -> String {
        format!("parsync-unit-{}-{test}", std::process::id())
    }

    #[test]
    fn bad_queue_index_is_reported() {
        let tunnel: IpcTunnel<(), u32> = IpcTunnel::create(&unique_name("index"), TunnelConfig::default()).unwrap();
        assert_eq!(
            Err(Error::QueueIndex { index: 1, count: 1 }),
            tunnel.read_message_nb(1)
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result: crate::Result<IpcTunnel<(), u32>> =
            IpcTunnel::create(&unique_name("zero"), TunnelConfig::default().with_capacity(0));
        assert!(matches!(result, Err(Error::RegionLayout { .. })));
    }

    #[test]
    fn configuration_too_large_to_address_is_rejected() {
        let config = TunnelConfig::default().with_capacity(1 << 52).with_slot_size(4092);
        let result: crate::Result<IpcTunnel<(), u32>> = IpcTunnel::create(&unique_name("huge"), config);
        assert!(matches!(result, Err(Error::RegionLayout { .. })), "got {result:?}");
    }

    #[test]
    fn corrupt_header_dimensions_are_rejected_on_open() {
        let name = unique_name("corrupt");
        let owner: IpcTunnel<(), u32> = IpcTunnel::create(&name, TunnelConfig::default()).unwrap();
        let header = owner.region.base().cast::<TunnelHeader>().as_ptr();

        for (capacity, slot_size) in [(0, 64), (1 << 52, 4092), (4, u64::MAX)] {
            unsafe {
                (*header).capacity = capacity;
                (*header).slot_size = slot_size;
            }
            let peer: crate::Result<IpcTunnel<(), u32>> = IpcTunnel::open(&name);
            assert!(
                matches!(peer, Err(Error::RegionLayout { .. })),
                "capacity {capacity} and slot size {slot_size} gave {peer:?}"
            );
        }
    }

    #[test]
    fn owner_drop_removes_the_name() {
        let name = unique_name("drop");
        let tunnel: IpcTunnel<(), u32> = IpcTunnel::create(&name, TunnelConfig::default()).unwrap();
        drop(tunnel);
        let reopened: crate::Result<IpcTunnel<(), u32>> = IpcTunnel::open(&name);
        assert!(matches!(reopened, Err(Error::Os { .. })));
    }

    #[test]
    fn record_type_must_match() {
        let name = unique_name("record");
        let _owner: IpcTunnel<AtomicU64, u32> = IpcTunnel::create(&name, TunnelConfig::default()).unwrap();
        let peer: crate::Result<IpcTunnel<AtomicU32, u32>> = IpcTunnel::open(&name);
        assert!(matches!(peer, Err(Error::RegionLayout { .. })));
    }
}
