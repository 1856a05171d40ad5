//! Packet framing for the TCP control channel.
//!
//! Each send is one packet, prefixed with its length:
//! ```text
//! [0..2]   payload_length (u16, big-endian)
//! [2..]    payload (UTF-8 handshake token)
//! ```
//! A packet is delivered to the receiver only once all of its bytes have
//! arrived, so one send on one side is exactly one receive on the other.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PACKET_LEN_SIZE: usize = 2;
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Prefix `payload` with its length.
pub fn encode_packet(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(PACKET_LEN_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Reassembles packets from an arbitrarily chunked byte stream.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        if self.buf.len() < PACKET_LEN_SIZE {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < PACKET_LEN_SIZE + len {
            return None;
        }
        self.buf.advance(PACKET_LEN_SIZE);
        Some(self.buf.split_to(len).freeze())
    }

    /// Bytes of a partially received packet still waiting for the rest.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("packet too large: {0} bytes (max {MAX_PACKET_SIZE})")]
    TooLarge(usize),
}
