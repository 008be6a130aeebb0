//! Mode-driven serialization of simulation objects into byte buffers and back.
//!
//! A type becomes serializable by implementing [`Serialize`], whose single method walks the value's fields in a fixed
//! order. The same walk is run three times with a [`Serializer`] in a different [`Mode`]: SIZE computes the exact byte
//! count, PACK produces the bytes, and UNPACK rebuilds a value from them. Because all three passes share one traversal,
//! a size computed up front always matches the bytes produced later; [`pack()`] still checks this and reports
//! [`Error::SizeMismatch`] if a hand-written implementation branches on the mode inconsistently.
//!
//! Objects reachable only through a boxed trait object are handled by a [`TypeRegistry`], which writes a runtime type
//! tag before the object's own fields so the receiving side knows which concrete type to allocate.
//!
//! The stream carries no header or magic bytes:
//!
//! * primitives are raw little-endian bytes (`usize` and `isize` are widened to 8 bytes, `bool` to 4);
//! * strings, vectors, sets, and maps are an 8-byte count followed by each element;
//! * arrays and tuples are their elements back to back;
//! * polymorphic objects are a 4-byte type tag followed by the concrete payload.

mod impls;
mod registry;
mod serializer;

pub use registry::{Serializable, TypeRegistry, TypeTag};
pub use serializer::{Mode, Serializer};

use crate::Error;
use tracing::error;

/// A value that can be sized, packed, and unpacked by walking its fields in a fixed order.
///
/// Implementations call [`serialize_order()`] on each field in turn. In [`Mode::Unpack`] the fields are overwritten in
/// place, so a value being unpacked usually starts out as its [`Default`].
///
/// ```
/// use parsync::serialization::{pack, unpack, Serialize, Serializer};
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Credit {
///     port: u32,
///     amount: u64,
/// }
///
/// impl Serialize for Credit {
///     fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> parsync::Result {
///         self.port.serialize_order(ser)?;
///         self.amount.serialize_order(ser)
///     }
/// }
///
/// let mut credit = Credit { port: 3, amount: 64 };
/// let bytes = pack(&mut credit).unwrap();
/// assert_eq!(12, bytes.len());
/// assert_eq!(credit, unpack::<Credit>(&bytes).unwrap());
/// ```
///
/// [`serialize_order()`]: Serialize::serialize_order
pub trait Serialize {
    /// Run every field of `self` through `ser`, in the same order for all modes.
    ///
    /// # Errors
    ///
    /// Unpacking fails on truncated or invalid input. Packing fails only for polymorphic fields whose type is not
    /// registered.
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result;
}

/// Size the bytes produced by `traverse`, then pack them into `buffer`, replacing its contents but keeping its
/// allocation. Returns the packed length.
///
/// # Errors
///
/// Propagates any error from `traverse`, and returns [`Error::SizeMismatch`] if the SIZE and PACK passes disagree.
pub fn pack_with<F>(buffer: &mut Vec<u8>, mut traverse: F) -> crate::Result<usize>
where
    F: FnMut(&mut Serializer<'_>) -> crate::Result,
{
    let mut sizer = Serializer::sizer();
    traverse(&mut sizer)?;
    let computed = sizer.size();

    buffer.clear();
    buffer.reserve(computed);
    let mut packer = Serializer::packer(buffer);
    traverse(&mut packer)?;
    let packed = packer.size();

    if packed != computed {
        error!(computed, packed, "serialization size pass disagrees with pack pass");
        return Err(Error::SizeMismatch { computed, packed });
    }
    Ok(packed)
}

/// Run `traverse` over `data` in [`Mode::Unpack`], requiring that every byte is consumed.
///
/// # Errors
///
/// Propagates any error from `traverse`, and returns [`Error::TrailingBytes`] if input remains afterwards.
pub fn unpack_with<F>(data: &[u8], mut traverse: F) -> crate::Result
where
    F: FnMut(&mut Serializer<'_>) -> crate::Result,
{
    let mut unpacker = Serializer::unpacker(data);
    traverse(&mut unpacker)?;
    match unpacker.remaining() {
        0 => Ok(()),
        remaining => Err(Error::TrailingBytes { remaining }),
    }
}

/// Exact number of bytes [`pack()`] would produce for `value`.
///
/// # Errors
///
/// Fails only if `value` contains an unregistered polymorphic object.
pub fn size_of<T>(value: &mut T) -> crate::Result<usize>
where
    T: Serialize + ?Sized,
{
    let mut sizer = Serializer::sizer();
    value.serialize_order(&mut sizer)?;
    Ok(sizer.size())
}

/// Serialize `value` into a freshly allocated buffer of exactly the right size.
///
/// # Errors
///
/// See [`pack_with()`].
pub fn pack<T>(value: &mut T) -> crate::Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut buffer = Vec::new();
    pack_with(&mut buffer, |ser| value.serialize_order(ser))?;
    Ok(buffer)
}

/// Rebuild a `T` from bytes produced by [`pack()`].
///
/// # Errors
///
/// See [`unpack_with()`].
pub fn unpack<T>(data: &[u8]) -> crate::Result<T>
where
    T: Serialize + Default,
{
    let mut value = T::default();
    unpack_into(data, &mut value)?;
    Ok(value)
}

/// Overwrite `value` with the contents of `data`.
///
/// # Errors
///
/// See [`unpack_with()`].
pub fn unpack_into<T>(data: &[u8], value: &mut T) -> crate::Result
where
    T: Serialize + ?Sized,
{
    unpack_with(data, |ser| value.serialize_order(ser))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes an extra byte only when packing.
    #[derive(Default)]
    struct Inconsistent;

    impl Serialize for Inconsistent {
        fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
            if ser.mode() == Mode::Pack {
                ser.put(&[0]);
            }
            Ok(())
        }
    }

    #[test]
    fn size_and_pack_disagreement_is_fatal() {
        let result = pack(&mut Inconsistent);
        assert_eq!(Err(Error::SizeMismatch { computed: 0, packed: 1 }), result);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert_eq!(Err(Error::TrailingBytes { remaining: 1 }), unpack::<u32>(&[1, 2, 3, 4, 5]));
    }

    #[test]
    fn pack_with_reuses_the_buffer() {
        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(&[7; 10]);
        let len = pack_with(&mut buffer, |ser| 5u64.serialize_order(ser)).unwrap();
        assert_eq!(8, len);
        assert_eq!(8, buffer.len(), "old contents should have been replaced");
        assert!(buffer.capacity() >= 64, "allocation should have been kept");
    }
}
