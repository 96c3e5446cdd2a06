//! Mux session layer
//!
//! Optional variant of the tunnel in which one physical connection carries
//! many logical streams. The server side opens a stream per public
//! connection; the client side accepts streams and demultiplexes them to the
//! local services. Sessions retire after a configured number of streams.
//!
//! Provides:
//! - Frame encoding/decoding
//! - Per-stream flow control
//! - An async session driver with its own keepalive

mod frame;
mod session;
mod stream;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE};
pub use session::{MuxSession, MuxStream, SessionRole, StreamEvent, StreamSender};
pub use stream::{LogicalStream, StreamState};

use std::time::Duration;
use thiserror::Error;

/// Mux layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("stream not found: {0}")]
    StreamNotFound(u32),

    #[error("stream closed")]
    StreamClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("too many streams")]
    TooManyStreams,

    #[error("flow control violation")]
    FlowControl,

    #[error("keepalive timeout")]
    KeepaliveTimeout,

    #[error("unsupported mux version: {0}")]
    UnsupportedVersion(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hard cap on concurrent streams per session, independent of the retire
/// budget the dispatcher enforces.
pub const MAX_STREAMS: usize = 1024;

/// Session keepalive ping interval. Independent of the control-channel
/// heartbeat.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Quiet period after which a session is considered dead.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(40);

/// Tunables handed to every session.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Protocol compatibility version (1 or 2)
    pub version: u8,
    /// Maximum payload bytes per frame
    pub max_frame_size: usize,
    /// Session receive buffer capacity in bytes
    pub max_receive_buffer: usize,
    /// Per-stream flow-control window in bytes
    pub max_stream_buffer: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: 1,
            max_frame_size: 32 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 256 * 1024,
        }
    }
}

impl MuxConfig {
    /// Reject parameter combinations no peer could honor.
    pub fn validate(&self) -> Result<(), MuxError> {
        if self.version != 1 && self.version != 2 {
            return Err(MuxError::UnsupportedVersion(self.version));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u16::MAX as usize {
            return Err(MuxError::InvalidFrame(format!(
                "max_frame_size out of range: {}",
                self.max_frame_size
            )));
        }
        if self.max_stream_buffer == 0 {
            return Err(MuxError::InvalidFrame("zero stream buffer".to_string()));
        }
        Ok(())
    }
}
