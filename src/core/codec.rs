//! # Stream Framing
//!
//! TCP delivers bytes, not messages: one read may hold a fragment of a frame,
//! exactly one frame, or several frames back to back. [`PacketCodec`] keeps the
//! unconsumed bytes between reads and extracts every complete length-prefixed
//! frame, in order, exactly once.
//!
//! [`PacketCodec`] is a tokio-util [`Decoder`] and [`Encoder`], so a stream
//! channel reads through `FramedRead` and writes through `FramedWrite`.
//! [`StreamFramer`] applies the same rules to byte slices handed in by the
//! caller, for code that does its own reads.
//!
//! ## Frame Rules
//! - a declared length `<= 0` terminates the stream
//! - a declared length above `MAX_PACKET_SIZE` terminates the stream
//! - a trailing prefix that declares `KEEP_ALIVE_LENGTH` with no payload yet
//!   buffered clears the carry-over
//! - anything else short of a full frame stays buffered for the next read

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{KEEP_ALIVE_LENGTH, LENGTH_PREFIX_SIZE, MAX_PACKET_SIZE};
use crate::core::packet::Packet;
use crate::error::{NetError, Result};

/// Reassembles length-prefixed frames from arbitrarily split reads
#[derive(Debug, Default)]
pub struct StreamFramer {
    received: BytesMut,
    codec: PacketCodec,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read's worth of bytes, handing each complete frame to `emit`.
    ///
    /// Frames completed before a terminating prefix are still emitted. An error
    /// means the stream must be closed; the carry-over is discarded.
    pub fn push<F>(&mut self, data: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(Packet),
    {
        self.received.extend_from_slice(data);
        loop {
            match self.codec.decode(&mut self.received) {
                Ok(Some(packet)) => emit(packet),
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.received.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.received.len()
    }
}

/// Length-prefix codec for stream packets
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if declared <= 0 {
            src.clear();
            return Err(NetError::ConnectionClosed);
        }

        let length = declared as usize;
        if length > MAX_PACKET_SIZE {
            src.clear();
            return Err(NetError::OversizedPacket(length));
        }

        let buffered = src.len() - LENGTH_PREFIX_SIZE;
        if buffered < length {
            if declared <= KEEP_ALIVE_LENGTH && buffered == 0 {
                src.clear();
            } else {
                src.reserve(length - buffered);
            }
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let frame = src.split_to(length);
        Ok(Some(Packet::from(frame.to_vec())))
    }

    // a peer that hangs up mid-frame has simply closed the stream
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = NetError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_PACKET_SIZE {
            return Err(NetError::OversizedPacket(item.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_i32_le(item.len() as i32);
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}
