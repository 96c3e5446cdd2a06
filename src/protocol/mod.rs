//! Control-plane wire protocol
//!
//! The tunnel coordinates its peers with a deliberately tiny alphabet: single
//! signal bytes, length-prefixed strings, and tagged strings (a string with
//! one leading signal byte). The handshake and target-address frames use the
//! tagged form; steady-state signals are bare bytes with no framing.

mod codec;

pub use codec::{
    recv_signal, recv_string, recv_tagged_string, send_signal, send_string, send_tagged_string,
    MAX_STRING_LEN,
};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown signal byte: {0:#04x}")]
    UnknownSignal(u8),

    #[error("string too long: {0} bytes (max {MAX_STRING_LEN})")]
    StringTooLong(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One-byte control signals.
///
/// The discriminants are stable wire values shared with every deployed peer;
/// never renumber them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// Heartbeat, sent periodically by the server
    Heartbeat = 0x00,
    /// Request a new tunnel connection (or mux session)
    ReqChan = 0x01,
    /// Ping
    Ping = 0x02,
    /// Peer-initiated shutdown of the control channel
    Closed = 0x03,
    /// The tunnel connection or stream carries TCP payload
    Tcp = 0x04,
    /// The tunnel connection or stream carries UDP payload
    Udp = 0x05,
}

impl TryFrom<u8> for Signal {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Signal::Heartbeat),
            0x01 => Ok(Signal::ReqChan),
            0x02 => Ok(Signal::Ping),
            0x03 => Ok(Signal::Closed),
            0x04 => Ok(Signal::Tcp),
            0x05 => Ok(Signal::Udp),
            other => Err(ProtocolError::UnknownSignal(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_wire_values() {
        assert_eq!(Signal::Heartbeat as u8, 0x00);
        assert_eq!(Signal::ReqChan as u8, 0x01);
        assert_eq!(Signal::Ping as u8, 0x02);
        assert_eq!(Signal::Closed as u8, 0x03);
        assert_eq!(Signal::Tcp as u8, 0x04);
        assert_eq!(Signal::Udp as u8, 0x05);
    }

    #[test]
    fn test_signal_roundtrip() {
        for byte in 0x00..=0x05u8 {
            let signal = Signal::try_from(byte).unwrap();
            assert_eq!(signal as u8, byte);
        }
    }

    #[test]
    fn test_unknown_signal() {
        assert!(matches!(
            Signal::try_from(0x42),
            Err(ProtocolError::UnknownSignal(0x42))
        ));
    }
}
