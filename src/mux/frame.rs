//! Frame encoding/decoding for mux sessions
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |      Stream ID (3B)      |
//! +--------+--------+--------+--------+
//! |      Length (2B)      |  Payload  |
//! +--------+--------+--------+--------+
//! ```

use super::MuxError;
use crate::protocol::Signal;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 6;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload
    Data = 0x00,
    /// Stream open request, payload carries the tagged target address
    StreamOpen = 0x01,
    /// Stream close
    StreamClose = 0x02,
    /// Flow-control window update
    WindowUpdate = 0x03,
    /// Keepalive probe
    Ping = 0x04,
    /// Keepalive response
    Pong = 0x05,
    /// Session closing
    GoAway = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::StreamOpen),
            0x02 => Ok(FrameType::StreamClose),
            0x03 => Ok(FrameType::WindowUpdate),
            0x04 => Ok(FrameType::Ping),
            0x05 => Ok(FrameType::Pong),
            0x06 => Ok(FrameType::GoAway),
            other => Err(MuxError::InvalidFrame(format!(
                "unknown frame type: {other:#04x}"
            ))),
        }
    }
}

/// A session frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Stream open carrying the target address, tagged with the payload kind
    /// the stream will carry.
    pub fn stream_open(stream_id: u32, tag: Signal, target: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + target.len());
        payload.put_u8(tag as u8);
        payload.extend_from_slice(target.as_bytes());
        Self {
            frame_type: FrameType::StreamOpen,
            stream_id,
            payload: payload.freeze(),
        }
    }

    pub fn stream_close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::StreamClose,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: payload.freeze(),
        }
    }

    pub fn ping(seq: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(seq);
        Self {
            frame_type: FrameType::Ping,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    pub fn pong(seq: u64) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(seq);
        Self {
            frame_type: FrameType::Pong,
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    pub fn goaway() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Parse a `StreamOpen` payload back into its tag and target address.
    pub fn parse_stream_open(payload: &[u8]) -> Result<(Signal, String), MuxError> {
        if payload.is_empty() {
            return Err(MuxError::InvalidFrame("empty stream open".to_string()));
        }
        let tag = Signal::try_from(payload[0])
            .map_err(|_| MuxError::InvalidFrame(format!("bad stream tag: {:#04x}", payload[0])))?;
        let target = std::str::from_utf8(&payload[1..])
            .map_err(|_| MuxError::InvalidFrame("target is not UTF-8".to_string()))?
            .to_string();
        Ok((tag, target))
    }

    /// Parse a `WindowUpdate` payload.
    pub fn parse_window_update(payload: &[u8]) -> Result<u32, MuxError> {
        if payload.len() < 4 {
            return Err(MuxError::InvalidFrame("short window update".to_string()));
        }
        Ok(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Encode frame to bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());

        buf.put_u8(self.frame_type as u8);

        // Stream ID, 3 bytes big endian
        buf.put_u8((self.stream_id >> 16) as u8);
        buf.put_u16(self.stream_id as u16);

        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode one frame from the buffer, if a complete one is available.
    /// Consumes the frame's bytes on success.
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>, MuxError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let stream_id = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | (buf[3] as u32);
        let payload_len = ((buf[4] as usize) << 8) | (buf[5] as usize);

        if payload_len > max_payload {
            return Err(MuxError::FrameTooLarge(payload_len, max_payload));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"hello tunnel"));
        let mut encoded = original.encode();

        let decoded = Frame::decode(&mut encoded, 65535).unwrap().unwrap();

        assert_eq!(decoded.frame_type, original.frame_type);
        assert_eq!(decoded.stream_id, original.stream_id);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_stream_open_roundtrip() {
        let frame = Frame::stream_open(7, Signal::Tcp, "127.0.0.1:9090");
        let mut encoded = frame.encode();

        let decoded = Frame::decode(&mut encoded, 65535).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::StreamOpen);

        let (tag, target) = Frame::parse_stream_open(&decoded.payload).unwrap();
        assert_eq!(tag, Signal::Tcp);
        assert_eq!(target, "127.0.0.1:9090");
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let frame = Frame::data(1, Bytes::from_static(b"partial"));
        let encoded = frame.encode();

        let mut short = BytesMut::from(&encoded[..4]);
        assert!(Frame::decode(&mut short, 65535).unwrap().is_none());

        let mut header_only = BytesMut::from(&encoded[..FRAME_HEADER_SIZE]);
        assert!(Frame::decode(&mut header_only, 65535).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; 2048]));
        let mut encoded = frame.encode();

        assert!(matches!(
            Frame::decode(&mut encoded, 1024),
            Err(MuxError::FrameTooLarge(2048, 1024))
        ));
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = BytesMut::from(&[0x7fu8, 0, 0, 1, 0, 0][..]);
        assert!(Frame::decode(&mut buf, 65535).is_err());
    }

    #[test]
    fn test_three_byte_stream_id() {
        let frame = Frame::stream_close(0x00ab_cdef);
        let mut encoded = frame.encode();

        let decoded = Frame::decode(&mut encoded, 65535).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 0x00ab_cdef);
    }

    #[test]
    fn test_window_update_roundtrip() {
        let frame = Frame::window_update(3, 65536);
        assert_eq!(Frame::parse_window_update(&frame.payload).unwrap(), 65536);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::ping(1).encode());
        buf.extend_from_slice(&Frame::data(2, Bytes::from_static(b"xy")).encode());

        let first = Frame::decode(&mut buf, 65535).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Ping);

        let second = Frame::decode(&mut buf, 65535).unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Data);
        assert_eq!(&second.payload[..], b"xy");

        assert!(Frame::decode(&mut buf, 65535).unwrap().is_none());
    }
}
