use crate::Error;

/// The pass a [`Serializer`] is currently running.
///
/// Every [`Serialize`] implementation runs the same traversal for all three modes; only the serializer's behavior
/// changes. This is what keeps [`Mode::Size`] and [`Mode::Pack`] from ever disagreeing.
///
/// [`Serialize`]: super::Serialize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Count the bytes a value would occupy without producing them.
    Size,
    /// Append the value's bytes to a buffer.
    Pack,
    /// Overwrite the value with bytes read from a buffer.
    Unpack,
}

#[derive(Debug)]
enum State<'a> {
    Sizer { size: usize },
    Packer { buffer: &'a mut Vec<u8>, written: usize },
    Unpacker { data: &'a [u8], offset: usize },
}

/// Mode-carrying context threaded through every [`Serialize::serialize_order()`] call.
///
/// Construct one with [`sizer()`], [`packer()`], or [`unpacker()`], drive a value through it, then read the byte count
/// with [`size()`]. Most callers use the free functions in the parent module instead, which also verify that the
/// SIZE and PACK passes agree.
///
/// [`Serialize::serialize_order()`]: super::Serialize::serialize_order
/// [`sizer()`]: Serializer::sizer
/// [`packer()`]: Serializer::packer
/// [`unpacker()`]: Serializer::unpacker
/// [`size()`]: Serializer::size
#[derive(Debug)]
pub struct Serializer<'a> {
    state: State<'a>,
}

impl Serializer<'static> {
    /// A serializer in [`Mode::Size`].
    pub fn sizer() -> Self {
        Self {
            state: State::Sizer { size: 0 },
        }
    }
}

impl<'a> Serializer<'a> {
    /// A serializer in [`Mode::Pack`] that appends to `buffer`. Existing contents of the buffer are left alone.
    pub fn packer(buffer: &'a mut Vec<u8>) -> Self {
        Self {
            state: State::Packer { buffer, written: 0 },
        }
    }

    /// A serializer in [`Mode::Unpack`] that reads from the start of `data`.
    pub fn unpacker(data: &'a [u8]) -> Self {
        Self {
            state: State::Unpacker { data, offset: 0 },
        }
    }

    pub fn mode(&self) -> Mode {
        match self.state {
            State::Sizer { .. } => Mode::Size,
            State::Packer { .. } => Mode::Pack,
            State::Unpacker { .. } => Mode::Unpack,
        }
    }

    /// Bytes counted, written, or consumed so far, depending on the mode.
    pub fn size(&self) -> usize {
        match self.state {
            State::Sizer { size } => size,
            State::Packer { written, .. } => written,
            State::Unpacker { offset, .. } => offset,
        }
    }

    /// Bytes of input not yet consumed. Always zero outside of [`Mode::Unpack`].
    pub fn remaining(&self) -> usize {
        match self.state {
            State::Unpacker { data, offset } => data.len() - offset,
            _ => 0,
        }
    }

    /// Run a fixed-width raw value through the serializer. SIZE counts `bytes.len()`, PACK appends them, and UNPACK
    /// overwrites them with the next `bytes.len()` bytes of input.
    ///
    /// # Errors
    ///
    /// In [`Mode::Unpack`], returns [`Error::Truncated`] if the input is exhausted.
    pub fn primitive(&mut self, bytes: &mut [u8]) -> crate::Result {
        if self.mode() == Mode::Unpack {
            let input = self.take(bytes.len())?;
            bytes.copy_from_slice(input);
        } else {
            self.put(bytes);
        }
        Ok(())
    }

    /// Run a container length through the serializer as an 8-byte count.
    ///
    /// # Errors
    ///
    /// Fails if the input is exhausted, or if an unpacked count cannot be addressed on this platform.
    pub fn length(&mut self, len: &mut usize) -> crate::Result {
        let mut wide = *len as u64;
        let mut bytes = wide.to_le_bytes();
        self.primitive(&mut bytes)?;
        wide = u64::from_le_bytes(bytes);
        *len = usize::try_from(wide).map_err(|_| Error::InvalidEncoding(format!("length {wide} overflows usize")))?;
        Ok(())
    }

    /// Count or append a variable-length byte run. Does nothing in [`Mode::Unpack`]; use [`take()`] there.
    ///
    /// [`take()`]: Serializer::take
    pub fn put(&mut self, bytes: &[u8]) {
        match &mut self.state {
            State::Sizer { size } => *size += bytes.len(),
            State::Packer { buffer, written } => {
                buffer.extend_from_slice(bytes);
                *written += bytes.len();
            },
            State::Unpacker { .. } => debug_assert!(false, "put() called while unpacking"),
        }
    }

    /// Borrow the next `len` bytes of input and advance past them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Truncated`] if fewer than `len` bytes remain, or [`Error::InvalidEncoding`] if the serializer
    /// is not unpacking.
    pub fn take(&mut self, len: usize) -> crate::Result<&'a [u8]> {
        match &mut self.state {
            State::Unpacker { data, offset } => {
                let available = data.len() - *offset;
                if len > available {
                    return Err(Error::Truncated {
                        offset: *offset,
                        needed: len,
                        available,
                    });
                }
                let data: &'a [u8] = *data;
                let slice = &data[*offset..*offset + len];
                *offset += len;
                Ok(slice)
            },
            _ => Err(Error::InvalidEncoding("take() is only valid while unpacking".into())),
        }
    }
}
