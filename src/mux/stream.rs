//! Per-stream state machine and flow control

use super::MuxError;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open and active
    Open,
    /// Local side has closed
    HalfClosedLocal,
    /// Remote side has closed
    HalfClosedRemote,
    /// Stream is fully closed
    Closed,
}

/// Bookkeeping for one logical stream within a session.
///
/// Data itself never passes through here; the session driver forwards payload
/// over channels and consults this state machine for legality and windows.
#[derive(Debug)]
pub struct LogicalStream {
    id: u32,
    state: StreamState,
    /// Bytes we may still send before a window update arrives
    send_window: u32,
    /// Bytes the peer may still send us
    recv_window: u32,
    /// Configured window size both windows replenish toward
    window_limit: u32,
}

impl LogicalStream {
    pub fn new(id: u32, window_limit: u32) -> Self {
        Self {
            id,
            state: StreamState::Open,
            send_window: window_limit,
            recv_window: window_limit,
            window_limit,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    pub fn update_send_window(&mut self, increment: u32) {
        self.send_window = self.send_window.saturating_add(increment);
    }

    pub fn consume_send_window(&mut self, amount: u32) -> Result<(), MuxError> {
        if amount > self.send_window {
            return Err(MuxError::FlowControl);
        }
        self.send_window -= amount;
        Ok(())
    }

    pub fn consume_recv_window(&mut self, amount: u32) -> Result<(), MuxError> {
        if amount > self.recv_window {
            return Err(MuxError::FlowControl);
        }
        self.recv_window -= amount;
        Ok(())
    }

    /// Replenishment to announce once the receive window dips below half of
    /// its configured size.
    pub fn window_update_needed(&self) -> Option<u32> {
        if self.recv_window < self.window_limit / 2 {
            Some(self.window_limit - self.recv_window)
        } else {
            None
        }
    }

    pub fn apply_window_update(&mut self, increment: u32) {
        self.recv_window = self.recv_window.saturating_add(increment);
    }

    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_states() {
        let mut stream = LogicalStream::new(1, 1024);
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.can_send());
        assert!(stream.can_recv());

        stream.close_local();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_close_is_terminal() {
        let mut stream = LogicalStream::new(1, 1024);
        stream.close_remote();
        stream.close_local();
        assert!(stream.is_closed());

        stream.close_local();
        stream.close_remote();
        assert!(stream.is_closed());
    }

    #[test]
    fn test_send_window_accounting() {
        let mut stream = LogicalStream::new(1, 100);

        stream.consume_send_window(60).unwrap();
        assert_eq!(stream.send_window(), 40);

        assert!(matches!(
            stream.consume_send_window(41),
            Err(MuxError::FlowControl)
        ));

        stream.update_send_window(60);
        assert_eq!(stream.send_window(), 100);
    }

    #[test]
    fn test_window_update_threshold() {
        let mut stream = LogicalStream::new(1, 100);
        assert!(stream.window_update_needed().is_none());

        stream.consume_recv_window(40).unwrap();
        assert!(stream.window_update_needed().is_none());

        stream.consume_recv_window(20).unwrap();
        assert_eq!(stream.window_update_needed(), Some(60));

        stream.apply_window_update(60);
        assert!(stream.window_update_needed().is_none());
    }
}
