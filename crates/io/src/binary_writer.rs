//! Binary writer for the Neo wire format.
//!
//! All multi-byte integers are written little-endian; variable-length
//! quantities use the Bitcoin-style var-int encoding.

use crate::{IoResult, Serializable};
use bytes::{BufMut, BytesMut};

/// A writer that serializes data structures to a growable byte buffer.
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl BinaryWriter {
    /// Creates a new, empty binary writer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Creates a new binary writer with the specified initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the current position (number of bytes written).
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) -> IoResult<()> {
        self.buffer.put_u8(value);
        Ok(())
    }

    /// Writes a boolean as a single byte (1 = true, 0 = false).
    pub fn write_bool(&mut self, value: bool) -> IoResult<()> {
        self.write_u8(u8::from(value))
    }

    /// Writes an unsigned 16-bit integer, little-endian.
    pub fn write_u16(&mut self, value: u16) -> IoResult<()> {
        self.buffer.put_u16_le(value);
        Ok(())
    }

    /// Writes an unsigned 32-bit integer, little-endian.
    pub fn write_u32(&mut self, value: u32) -> IoResult<()> {
        self.buffer.put_u32_le(value);
        Ok(())
    }

    /// Writes an unsigned 64-bit integer, little-endian.
    pub fn write_u64(&mut self, value: u64) -> IoResult<()> {
        self.buffer.put_u64_le(value);
        Ok(())
    }

    /// Writes a signed 64-bit integer, little-endian.
    pub fn write_i64(&mut self, value: i64) -> IoResult<()> {
        self.buffer.put_i64_le(value);
        Ok(())
    }

    /// Writes a variable-length integer.
    ///
    /// Values below 0xFD occupy one byte; larger values are prefixed with
    /// 0xFD/0xFE/0xFF and stored in 2/4/8 bytes respectively.
    pub fn write_var_int(&mut self, value: u64) -> IoResult<()> {
        if value < 0xFD {
            self.write_u8(value as u8)
        } else if value <= 0xFFFF {
            self.write_u8(0xFD)?;
            self.write_u16(value as u16)
        } else if value <= 0xFFFF_FFFF {
            self.write_u8(0xFE)?;
            self.write_u32(value as u32)
        } else {
            self.write_u8(0xFF)?;
            self.write_u64(value)
        }
    }

    /// Writes a fixed-length byte slice with no length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> IoResult<()> {
        self.buffer.put_slice(value);
        Ok(())
    }

    /// Writes a length-prefixed byte slice.
    pub fn write_var_bytes(&mut self, value: &[u8]) -> IoResult<()> {
        self.write_var_int(value.len() as u64)?;
        self.write_bytes(value)
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_var_string(&mut self, value: &str) -> IoResult<()> {
        self.write_var_bytes(value.as_bytes())
    }

    /// Writes a serializable object.
    pub fn write_serializable<T: Serializable>(&mut self, value: &T) -> IoResult<()> {
        value.serialize(self)
    }

    /// Writes a length-prefixed list of serializable objects.
    pub fn write_serializable_list<T: Serializable>(&mut self, value: &[T]) -> IoResult<()> {
        self.write_var_int(value.len() as u64)?;
        for item in value {
            item.serialize(self)?;
        }
        Ok(())
    }

    /// Consumes the writer's buffer as a byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    /// Clears the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for BinaryWriter {
    fn default() -> Self {
        Self::new()
    }
}
