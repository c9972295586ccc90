//! # Packet
//!
//! Sequential binary buffer exchanged over both transports.
//!
//! Values are appended with the `write_*` methods and consumed in the same
//! order with the matching `read_*` methods. Every integer and float is 4 bytes
//! little-endian, booleans are a single byte, and strings are a 4-byte byte
//! count followed by UTF-8.
//!
//! ## Wire Layout
//! ```text
//! TCP:            [len: i32] [message id: i32] [payload...]
//! UDP to server:  [session id: i32] [len: i32] [message id: i32] [payload...]
//! UDP to client:  [len: i32] [message id: i32] [payload...]
//! ```
//! `len` counts the bytes after itself. It is prepended by [`Packet::write_length`]
//! right before a packet leaves the process; the session tag is prepended by
//! [`Packet::insert_i32`].
//!
//! Reading past the written content fails with `BufferUnderrun` instead of
//! returning garbage.

use crate::error::{constants, NetError, Result};

/// Binary packet with a read cursor over the written bytes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Packet {
    /// Create an empty packet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a packet whose first value is the message id
    pub fn with_id(message_id: i32) -> Self {
        let mut packet = Self::new();
        packet.write_i32(message_id);
        packet
    }

    /// Create a packet ready to read `bytes` from the start
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buffer: bytes.to_vec(),
            read_pos: 0,
        }
    }

    /// Append raw bytes behind the current content without moving the cursor
    pub fn set_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Prepend the current total length, immediately before transmission
    pub fn write_length(&mut self) {
        let length = self.buffer.len() as i32;
        self.insert_i32(length);
    }

    /// Prepend an integer ahead of the existing content
    pub fn insert_i32(&mut self, value: i32) {
        self.buffer.splice(0..0, value.to_le_bytes());
    }

    /// Reinitialize the packet for reuse.
    ///
    /// With `keep_unread_tail`, bytes the cursor has not consumed yet move to the
    /// front of the buffer; otherwise the buffer is emptied.
    pub fn reset(&mut self, keep_unread_tail: bool) {
        if keep_unread_tail {
            self.buffer.drain(..self.read_pos);
        } else {
            self.buffer.clear();
        }
        self.read_pos = 0;
    }

    /// Total number of bytes in the buffer
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no bytes at all
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of bytes not yet consumed by the read cursor
    pub fn unread_len(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Whole byte image of the packet
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes not yet consumed by the read cursor
    pub fn unread_bytes(&self) -> &[u8] {
        &self.buffer[self.read_pos..]
    }

    /// Consume the packet, returning its byte image
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Write a 4-byte byte count followed by the UTF-8 bytes of `value`
    pub fn write_str(&mut self, value: &str) {
        self.write_i32(value.len() as i32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Write raw bytes with no length prefix; the reader must know the count
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buffer.extend_from_slice(value);
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        let bytes = self.take(1)?;
        Ok(bytes[0] != 0)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let start = self.read_pos;
        let length = self.read_i32()?;
        if length < 0 {
            self.read_pos = start;
            return Err(NetError::MalformedPacket(
                constants::ERR_NEGATIVE_STRING_LENGTH.into(),
            ));
        }

        let bytes = match self.take(length as usize) {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                self.read_pos = start;
                return Err(e);
            }
        };

        String::from_utf8(bytes).map_err(|_| {
            self.read_pos = start;
            NetError::MalformedPacket(constants::ERR_INVALID_UTF8.into())
        })
    }

    /// Read exactly `count` raw bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.take(count).map(<[u8]>::to_vec)
    }

    /// Read the next integer without advancing the cursor
    pub fn peek_i32(&self) -> Result<i32> {
        let bytes = self.peek(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn peek(&self, count: usize) -> Result<&[u8]> {
        let available = self.unread_len();
        if count > available {
            return Err(NetError::BufferUnderrun {
                requested: count,
                available,
            });
        }
        Ok(&self.buffer[self.read_pos..self.read_pos + count])
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        let available = self.unread_len();
        if count > available {
            return Err(NetError::BufferUnderrun {
                requested: count,
                available,
            });
        }
        let start = self.read_pos;
        self.read_pos += count;
        Ok(&self.buffer[start..self.read_pos])
    }
}

impl From<Vec<u8>> for Packet {
    fn from(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            read_pos: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_values_roundtrip_in_order() {
        let mut packet = Packet::new();
        packet.write_i32(i32::MIN);
        packet.write_bool(true);
        packet.write_f32(-1.5);
        packet.write_str("grüße");
        packet.write_bytes(&[9, 8, 7]);
        packet.write_i32(i32::MAX);

        assert_eq!(packet.read_i32().unwrap(), i32::MIN);
        assert!(packet.read_bool().unwrap());
        assert_eq!(packet.read_f32().unwrap(), -1.5);
        assert_eq!(packet.read_string().unwrap(), "grüße");
        assert_eq!(packet.read_bytes(3).unwrap(), vec![9, 8, 7]);
        assert_eq!(packet.read_i32().unwrap(), i32::MAX);
        assert_eq!(packet.unread_len(), 0);
    }

    #[test]
    fn test_wire_widths() {
        let mut packet = Packet::new();
        packet.write_i32(1);
        assert_eq!(packet.len(), 4);
        packet.write_bool(false);
        assert_eq!(packet.len(), 5);
        packet.write_f32(0.0);
        assert_eq!(packet.len(), 9);
        packet.write_str("abc");
        assert_eq!(packet.len(), 16);
        packet.write_str("");
        assert_eq!(packet.len(), 20);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut packet = Packet::new();
        packet.write_i32(0x0102_0304);
        assert_eq!(packet.as_bytes(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_over_read_is_buffer_underrun() {
        let mut packet = Packet::new();
        packet.write_bool(true);
        match packet.read_i32() {
            Err(NetError::BufferUnderrun {
                requested,
                available,
            }) => {
                assert_eq!(requested, 4);
                assert_eq!(available, 1);
            }
            other => panic!("expected BufferUnderrun, got {other:?}"),
        }
        // cursor is untouched by the failed read
        assert!(packet.read_bool().unwrap());
    }

    #[test]
    fn test_truncated_string_restores_cursor() {
        let mut packet = Packet::new();
        packet.write_i32(10);
        packet.write_bytes(b"abc");
        assert!(matches!(
            packet.read_string(),
            Err(NetError::BufferUnderrun { .. })
        ));
        assert_eq!(packet.unread_len(), 7);
    }

    #[test]
    fn test_negative_string_length_is_malformed() {
        let mut packet = Packet::new();
        packet.write_i32(-3);
        assert!(matches!(
            packet.read_string(),
            Err(NetError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut packet = Packet::new();
        packet.write_i32(2);
        packet.write_bytes(&[0xC3, 0x28]);
        assert!(matches!(
            packet.read_string(),
            Err(NetError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_write_length_prefixes_total() {
        let mut packet = Packet::with_id(7);
        packet.write_str("hi");
        packet.write_length();

        assert_eq!(packet.len(), 4 + 4 + 4 + 2);
        assert_eq!(packet.read_i32().unwrap(), 10);
        assert_eq!(packet.read_i32().unwrap(), 7);
        assert_eq!(packet.read_string().unwrap(), "hi");
    }

    #[test]
    fn test_insert_int_goes_ahead_of_length() {
        let mut packet = Packet::with_id(3);
        packet.write_length();
        packet.insert_i32(42);

        assert_eq!(packet.read_i32().unwrap(), 42);
        assert_eq!(packet.read_i32().unwrap(), 4);
        assert_eq!(packet.read_i32().unwrap(), 3);
    }

    #[test]
    fn test_reset_keeps_unread_tail() {
        let mut packet = Packet::new();
        packet.write_i32(1);
        packet.write_i32(2);
        packet.read_i32().unwrap();

        packet.reset(true);
        assert_eq!(packet.len(), 4);
        assert_eq!(packet.read_i32().unwrap(), 2);

        packet.reset(false);
        assert!(packet.is_empty());
        assert_eq!(packet.unread_len(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut packet = Packet::new();
        packet.write_i32(99);
        assert_eq!(packet.peek_i32().unwrap(), 99);
        assert_eq!(packet.read_i32().unwrap(), 99);
        assert!(packet.peek_i32().is_err());
    }
}
