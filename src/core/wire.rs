//! Byte-level payload codec.
//!
//! [`PayloadWriter`] and [`PayloadReader`] are the primitives packets use to
//! serialize their fields. All fixed-width values are big-endian; strings are
//! UTF-8 with an i32 length prefix. Reads validate every length against the
//! remaining payload and surface underruns as framing errors rather than
//! panicking.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Writes packet payload fields into a growable buffer.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Self {
        PayloadWriter {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Writes a bool as one byte (0 or 1).
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Writes a big-endian i16.
    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    /// Writes a big-endian i32.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    /// Writes a big-endian i64.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Writes a big-endian f32.
    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    /// Writes a big-endian f64.
    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    /// Writes a UTF-8 string with an i32 length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let len = i32::try_from(value.len())
            .map_err(|_| WireError::Framing(format!("string of {} bytes too long", value.len())))?;
        self.buf.put_i32(len);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    /// Writes a raw run of bytes with no length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Finishes the writer, yielding the payload.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads packet payload fields from a bounded buffer.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    /// Creates a reader over `payload`.
    pub fn new(payload: Bytes) -> Self {
        PayloadReader { buf: payload }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(WireError::Framing(format!(
                "payload underrun reading {what}: need {needed} bytes, {} remaining",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    /// Reads a bool encoded as one byte.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian i16.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2, "i16")?;
        Ok(self.buf.get_i16())
    }

    /// Reads a big-endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    /// Reads a big-endian i64.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    /// Reads a big-endian f32.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    /// Reads a big-endian f64.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(WireError::Framing(format!(
                "negative string length {len}"
            )));
        }
        let bytes = self.read_bytes(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WireError::Framing(format!("invalid UTF-8 in string: {e}")))
    }

    /// Reads exactly `count` raw bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        self.ensure(count, "bytes")?;
        Ok(self.buf.split_to(count))
    }
}
