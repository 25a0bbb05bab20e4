//! XDR primitive encoding (RFC 4506)
// (c) 2025 Ross Younger
//!
//! All quantities are big-endian and every item occupies a multiple of four bytes.
//! Variable-length opaque data and strings carry a `u32` length prefix and are
//! zero-padded to the next four-byte boundary.

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use super::FormatError;

/// Rounds a length up to the next multiple of four
#[must_use]
pub(crate) const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Serialises XDR items into a growable buffer
#[derive(Debug, Default, Clone)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    /// Constructor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructor with a pre-allocated capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends an unsigned 32-bit integer
    pub fn pack_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends a signed 32-bit integer
    pub fn pack_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    /// Appends an unsigned hyper integer
    pub fn pack_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Appends a signed hyper integer
    pub fn pack_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    /// Appends a boolean (encoded as 0 or 1)
    pub fn pack_bool(&mut self, value: bool) -> &mut Self {
        self.pack_u32(u32::from(value))
    }

    /// Appends fixed-length opaque data. The receiver must know the length.
    pub fn pack_fixed_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        let pad = padded_len(data.len()) - data.len();
        self.buf.put_bytes(0, pad);
        self
    }

    /// Appends variable-length opaque data.
    pub fn pack_opaque(&mut self, data: &[u8]) -> &mut Self {
        // Record marking limits us far below 4GB; see `record::MAX_RECORD_SIZE`.
        #[allow(clippy::cast_possible_truncation)]
        let len = data.len() as u32;
        self.pack_u32(len).pack_fixed_opaque(data)
    }

    /// Appends a string
    pub fn pack_string(&mut self, s: &str) -> &mut Self {
        self.pack_opaque(s.as_bytes())
    }

    /// Appends a counted array, using `f` to pack each item
    pub fn pack_array<T, F>(&mut self, items: &[T], mut f: F) -> &mut Self
    where
        F: FnMut(&mut Self, &T),
    {
        #[allow(clippy::cast_possible_truncation)]
        let _ = self.pack_u32(items.len() as u32);
        for item in items {
            f(self, item);
        }
        self
    }

    /// Appends raw bytes that are already XDR encoded
    pub fn pack_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Number of bytes packed so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Is the buffer empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read-only view of the bytes packed so far
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the packer, returning the encoded data
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Deserialises XDR items from a buffer.
///
/// Every read checks that enough data remains; running short is a [`FormatError::Truncated`].
/// Call [`Unpacker::finish`] once all expected items have been read, to detect
/// unconsumed trailing data.
#[derive(Debug, Clone)]
pub struct Unpacker {
    buf: Bytes,
    consumed: usize,
}

impl Unpacker {
    /// Constructor
    #[must_use]
    pub fn new(buf: Bytes) -> Self {
        Self { buf, consumed: 0 }
    }

    fn need(&self, wanted: usize) -> Result<(), FormatError> {
        if self.buf.remaining() < wanted {
            return Err(FormatError::Truncated {
                offset: self.consumed,
                wanted,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Reads an unsigned 32-bit integer
    pub fn unpack_u32(&mut self) -> Result<u32, FormatError> {
        self.need(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32())
    }

    /// Reads a signed 32-bit integer
    pub fn unpack_i32(&mut self) -> Result<i32, FormatError> {
        self.need(4)?;
        self.consumed += 4;
        Ok(self.buf.get_i32())
    }

    /// Reads an unsigned hyper integer
    pub fn unpack_u64(&mut self) -> Result<u64, FormatError> {
        self.need(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64())
    }

    /// Reads a signed hyper integer
    pub fn unpack_i64(&mut self) -> Result<i64, FormatError> {
        self.need(8)?;
        self.consumed += 8;
        Ok(self.buf.get_i64())
    }

    /// Reads a boolean. Values other than 0 or 1 are rejected.
    pub fn unpack_bool(&mut self) -> Result<bool, FormatError> {
        match self.unpack_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FormatError::BadDiscriminant {
                what: "bool",
                value: other,
            }),
        }
    }

    /// Reads fixed-length opaque data (plus its padding)
    pub fn unpack_fixed_opaque(&mut self, len: usize) -> Result<Bytes, FormatError> {
        let padded = padded_len(len);
        self.need(padded)?;
        let data = self.buf.split_to(len);
        self.buf.advance(padded - len);
        self.consumed += padded;
        Ok(data)
    }

    /// Reads variable-length opaque data
    pub fn unpack_opaque(&mut self) -> Result<Bytes, FormatError> {
        let len = self.unpack_u32()? as usize;
        self.unpack_fixed_opaque(len)
    }

    /// Reads variable-length opaque data, enforcing a maximum length
    pub fn unpack_opaque_max(
        &mut self,
        max: usize,
        what: &'static str,
    ) -> Result<Bytes, FormatError> {
        let len = self.unpack_u32()? as usize;
        if len > max {
            return Err(FormatError::TooLong { what, len, max });
        }
        self.unpack_fixed_opaque(len)
    }

    /// Reads a string, which must be valid UTF-8
    pub fn unpack_string(&mut self) -> Result<String, FormatError> {
        let data = self.unpack_opaque()?;
        String::from_utf8(data.to_vec()).map_err(|_| FormatError::InvalidUtf8)
    }

    /// Reads a counted array, using `f` to unpack each item
    pub fn unpack_array<T, F>(&mut self, mut f: F) -> Result<Vec<T>, FormatError>
    where
        F: FnMut(&mut Self) -> Result<T, FormatError>,
    {
        let count = self.unpack_u32()? as usize;
        // Each item takes at least 4 bytes; this guards against absurd allocations.
        self.need(count.saturating_mul(4))?;
        (0..count).map(|_| f(self)).collect()
    }

    /// Number of bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Takes all remaining data, leaving the unpacker empty
    pub fn take_rest(&mut self) -> Bytes {
        self.consumed += self.buf.len();
        self.buf.split_off(0)
    }

    /// Checks that the buffer has been fully consumed
    pub fn finish(self) -> Result<(), FormatError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FormatError::TrailingData(self.buf.len()))
        }
    }
}
