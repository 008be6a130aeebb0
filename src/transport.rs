//! Message passing between ranks.
//!
//! A [`Transport`] moves raw bytes between the participants of a run. Backends only have to provide tagged
//! point-to-point messages plus two collectives; everything else in this module is written once on top of that seam:
//!
//! * [`send()`] and [`recv()`] frame a serialized value as an 8-byte little-endian length followed by the payload,
//!   split into fragments of at most [`Transport::max_fragment()`] bytes. Every full fragment is sent on its own and
//!   the remainder, possibly empty, always follows as one final message, so both sides agree on the number of
//!   messages from the length alone.
//! * [`broadcast()`] ships the root's 8-byte length and then its payload to every participant.
//! * [`all_gather()`] publishes every participant's length, computes displacements by prefix sum, and gathers all
//!   payloads into one buffer before unpacking each segment.
//!
//! All operations block the calling thread. The collectives must be entered by every participant, in the same order.
//!
//! [`MemoryTransport`] is an in-process backend where each participant is a thread. It is what the tests use, and it
//! is a convenient way to run several ranks inside one process.

mod memory;

pub use memory::{MemoryTransport, MemoryTransportConfig};

use crate::serialization::{self, Serialize};
use crate::Error;
use tracing::trace;

/// Largest number of payload bytes a single backend message carries unless the backend says otherwise.
pub const MAX_FRAGMENT: usize = 1_000_000_000;

/// Width of the length prefix in front of every framed payload.
pub const LENGTH_PREFIX: usize = 8;

/// Tag distinguishing independent point-to-point conversations between the same pair of participants.
pub type Tag = u32;

/// Byte-level message passing between the participants of a run.
///
/// Participants are numbered `0..size()`. Implementations must deliver point-to-point messages between a given pair
/// with a given tag in the order they were sent, and [`send_bytes()`] must not wait for the matching receive: the
/// synchronization engine has both sides of a pair send before either receives.
///
/// [`send_bytes()`]: Transport::send_bytes
pub trait Transport: Send + Sync {
    /// This participant's index.
    fn rank(&self) -> u32;

    /// Number of participants.
    fn size(&self) -> u32;

    /// Largest payload carried by a single message.
    fn max_fragment(&self) -> usize {
        MAX_FRAGMENT
    }

    /// Send one message to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if `destination` is not a participant or the backend fails.
    fn send_bytes(&self, destination: u32, tag: Tag, bytes: &[u8]) -> crate::Result;

    /// Block until the next message from `source` with `tag` arrives and copy it into `buffer`, whose length must
    /// match the message exactly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if `source` is not a participant, the lengths differ, or the backend fails.
    fn recv_bytes(&self, source: u32, tag: Tag, buffer: &mut [u8]) -> crate::Result;

    /// Collective: replace every participant's `buffer` with the root's. All participants pass equally long buffers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectiveMismatch`] if participants disagree on the collective being run, or
    /// [`Error::Transport`] on a backend failure.
    fn broadcast_bytes(&self, root: u32, buffer: &mut [u8]) -> crate::Result;

    /// Collective: gather every participant's `local` bytes into `output`, ordered by rank. `counts[r]` is the
    /// number of bytes rank `r` contributes, and `output` must be exactly as long as their sum.
    ///
    /// # Errors
    ///
    /// As for [`broadcast_bytes()`].
    ///
    /// [`broadcast_bytes()`]: Transport::broadcast_bytes
    fn all_gather_bytes(&self, local: &[u8], counts: &[usize], output: &mut [u8]) -> crate::Result;
}

fn decode_length(rank: u32, prefix: [u8; LENGTH_PREFIX]) -> crate::Result<usize> {
    usize::try_from(u64::from_le_bytes(prefix)).map_err(|_| Error::Transport {
        rank,
        message: "announced length does not fit in memory".into(),
    })
}

fn encode_length(len: usize) -> [u8; LENGTH_PREFIX] {
    (len as u64).to_le_bytes()
}

/// Send `bytes` to `destination` as full fragments followed by the (possibly empty) remainder. No length prefix is
/// written; the receiver must already know the total.
///
/// # Errors
///
/// Propagates the first failure of [`Transport::send_bytes()`].
pub fn send_fragments<T>(transport: &T, destination: u32, tag: Tag, bytes: &[u8]) -> crate::Result
where
    T: Transport + ?Sized,
{
    let fragment = transport.max_fragment().max(1);
    let mut remaining = bytes;
    while remaining.len() >= fragment {
        let (head, tail) = remaining.split_at(fragment);
        trace!(rank = transport.rank(), peer = destination, bytes = head.len(), "sending fragment");
        transport.send_bytes(destination, tag, head)?;
        remaining = tail;
    }
    trace!(rank = transport.rank(), peer = destination, bytes = remaining.len(), "sending final fragment");
    transport.send_bytes(destination, tag, remaining)
}

/// Fill `buffer` from fragments sent by [`send_fragments()`] with the same total length.
///
/// # Errors
///
/// Propagates the first failure of [`Transport::recv_bytes()`].
pub fn recv_fragments<T>(transport: &T, source: u32, tag: Tag, buffer: &mut [u8]) -> crate::Result
where
    T: Transport + ?Sized,
{
    let fragment = transport.max_fragment().max(1);
    let mut remaining = buffer;
    while remaining.len() >= fragment {
        let (head, tail) = remaining.split_at_mut(fragment);
        transport.recv_bytes(source, tag, head)?;
        remaining = tail;
    }
    transport.recv_bytes(source, tag, remaining)
}

/// Send an already serialized buffer: its length prefix, then its fragments.
///
/// # Errors
///
/// Propagates transport failures.
pub fn send_buffer<T>(transport: &T, destination: u32, tag: Tag, bytes: &[u8]) -> crate::Result
where
    T: Transport + ?Sized,
{
    transport.send_bytes(destination, tag, &encode_length(bytes.len()))?;
    send_fragments(transport, destination, tag, bytes)
}

/// Receive a buffer sent by [`send_buffer()`], allocated to exactly the announced size.
///
/// # Errors
///
/// Propagates transport failures.
pub fn recv_buffer<T>(transport: &T, source: u32, tag: Tag) -> crate::Result<Vec<u8>>
where
    T: Transport + ?Sized,
{
    let mut prefix = [0; LENGTH_PREFIX];
    transport.recv_bytes(source, tag, &mut prefix)?;
    let mut buffer = vec![0; decode_length(transport.rank(), prefix)?];
    recv_fragments(transport, source, tag, &mut buffer)?;
    Ok(buffer)
}

/// Serialize `value` and send it to `destination`.
///
/// # Errors
///
/// Fails if `value` cannot be packed or the transport fails.
pub fn send<T, S>(transport: &T, destination: u32, tag: Tag, value: &mut S) -> crate::Result
where
    T: Transport + ?Sized,
    S: Serialize + ?Sized,
{
    let buffer = serialization::pack(value)?;
    send_buffer(transport, destination, tag, &buffer)
}

/// Receive a value sent by [`send()`].
///
/// # Errors
///
/// Fails if the transport fails or the bytes do not unpack into an `S`.
pub fn recv<T, S>(transport: &T, source: u32, tag: Tag) -> crate::Result<S>
where
    T: Transport + ?Sized,
    S: Serialize + Default,
{
    let buffer = recv_buffer(transport, source, tag)?;
    serialization::unpack(&buffer)
}

/// Receive a value sent by [`send()`] into an existing `value`.
///
/// # Errors
///
/// As for [`recv()`].
pub fn recv_into<T, S>(transport: &T, source: u32, tag: Tag, value: &mut S) -> crate::Result
where
    T: Transport + ?Sized,
    S: Serialize + ?Sized,
{
    let buffer = recv_buffer(transport, source, tag)?;
    serialization::unpack_into(&buffer, value)
}

/// Collective: overwrite `value` on every participant with the root's `value`.
///
/// # Errors
///
/// Fails if the root cannot pack its value, the transport fails, or a participant cannot unpack the result.
pub fn broadcast<T, S>(transport: &T, value: &mut S, root: u32) -> crate::Result
where
    T: Transport + ?Sized,
    S: Serialize + ?Sized,
{
    let is_root = transport.rank() == root;
    let mut payload = if is_root { serialization::pack(value)? } else { Vec::new() };

    let mut prefix = encode_length(payload.len());
    transport.broadcast_bytes(root, &mut prefix)?;
    payload.resize(decode_length(transport.rank(), prefix)?, 0);
    transport.broadcast_bytes(root, &mut payload)?;

    if !is_root {
        serialization::unpack_into(&payload, value)?;
    }
    Ok(())
}

/// Collective: gather raw buffers from every participant, ordered by rank.
///
/// # Errors
///
/// Propagates transport failures.
pub fn all_gather_buffers<T>(transport: &T, local: &[u8]) -> crate::Result<Vec<Vec<u8>>>
where
    T: Transport + ?Sized,
{
    let participants = transport.size() as usize;
    let mut prefixes = vec![0; participants * LENGTH_PREFIX];
    transport.all_gather_bytes(
        &encode_length(local.len()),
        &vec![LENGTH_PREFIX; participants],
        &mut prefixes,
    )?;

    let counts = prefixes
        .chunks_exact(LENGTH_PREFIX)
        .map(|chunk| {
            let mut prefix = [0; LENGTH_PREFIX];
            prefix.copy_from_slice(chunk);
            decode_length(transport.rank(), prefix)
        })
        .collect::<crate::Result<Vec<_>>>()?;

    let displacements: Vec<usize> = counts
        .iter()
        .scan(0, |offset, count| {
            let start = *offset;
            *offset += count;
            Some(start)
        })
        .collect();
    let total = counts.iter().sum();

    let mut gathered = vec![0; total];
    transport.all_gather_bytes(local, &counts, &mut gathered)?;

    Ok(displacements
        .iter()
        .zip(&counts)
        .map(|(&start, &count)| gathered[start..start + count].to_vec())
        .collect())
}

/// Collective: gather every participant's `value`, ordered by rank.
///
/// # Errors
///
/// Fails if `value` cannot be packed, the transport fails, or a gathered segment does not unpack into an `S`.
pub fn all_gather<T, S>(transport: &T, value: &mut S) -> crate::Result<Vec<S>>
where
    T: Transport + ?Sized,
    S: Serialize + Default,
{
    let local = serialization::pack(value)?;
    all_gather_buffers(transport, &local)?
        .iter()
        .map(|segment| serialization::unpack(segment))
        .collect()
}
