//! Async session driver
//!
//! One driver task owns the physical connection. Stream handles talk to it
//! over a command channel; inbound payload reaches handles over per-stream
//! event channels. The opener side creates streams, the acceptor side
//! receives them ready-made with the tagged target address already parsed.

use super::{
    Frame, FrameType, LogicalStream, MuxConfig, MuxError, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT,
    MAX_STREAMS,
};
use crate::protocol::Signal;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const CMD_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 64;
const ACCEPT_CHANNEL_SIZE: usize = 64;

/// Which side of the session this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Creates streams (the tunnel server)
    Opener,
    /// Receives streams (the tunnel client)
    Acceptor,
}

/// Event delivered to a stream handle.
#[derive(Debug)]
pub enum StreamEvent {
    /// Payload received for this stream
    Data(Bytes),
    /// Stream closed by the remote peer or the session
    Close,
    /// Session-level failure
    Error(MuxError),
}

enum Command {
    Open {
        tag: Signal,
        target: String,
        reply: oneshot::Sender<Result<MuxStream, MuxError>>,
    },
    Send {
        stream_id: u32,
        data: Bytes,
    },
    Close {
        stream_id: u32,
    },
    Shutdown,
}

/// Sending half of a stream handle.
#[derive(Clone)]
pub struct StreamSender {
    stream_id: u32,
    cmd_tx: mpsc::Sender<Command>,
}

impl StreamSender {
    pub async fn send(&self, data: Bytes) -> Result<(), MuxError> {
        self.cmd_tx
            .send(Command::Send {
                stream_id: self.stream_id,
                data,
            })
            .await
            .map_err(|_| MuxError::SessionClosed)
    }

    pub async fn close(&self) {
        let _ = self
            .cmd_tx
            .send(Command::Close {
                stream_id: self.stream_id,
            })
            .await;
    }
}

/// A logical stream handle.
pub struct MuxStream {
    id: u32,
    tag: Signal,
    target: String,
    sender: StreamSender,
    events: mpsc::Receiver<StreamEvent>,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload kind this stream carries (`Tcp` or `Udp`).
    pub fn tag(&self) -> Signal {
        self.tag
    }

    /// Target address forwarded by the opener.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn send(&self, data: Bytes) -> Result<(), MuxError> {
        self.sender.send(data).await
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub async fn close(&self) {
        self.sender.close().await;
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (StreamSender, mpsc::Receiver<StreamEvent>) {
        (self.sender, self.events)
    }
}

/// An established mux session over one tunnel connection.
pub struct MuxSession {
    cmd_tx: mpsc::Sender<Command>,
    accept_rx: mpsc::Receiver<MuxStream>,
    done: CancellationToken,
}

impl MuxSession {
    /// Wrap a connection and spawn the driver task. The session dies with
    /// `cancel`, when either peer sends `GoAway`, or on keepalive timeout.
    pub fn new<C>(conn: C, config: MuxConfig, role: SessionRole, cancel: CancellationToken) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_SIZE);
        let done = CancellationToken::new();

        let driver = Driver {
            config,
            role,
            streams: HashMap::new(),
            next_stream_id: 1,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            accept_tx,
        };
        tokio::spawn(driver.run(conn, cancel, done.clone()));

        Self {
            cmd_tx,
            accept_rx,
            done,
        }
    }

    /// Open a new stream carrying `tag` payload toward `target`.
    /// Opener side only.
    pub async fn open_stream(&self, tag: Signal, target: &str) -> Result<MuxStream, MuxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open {
                tag,
                target: target.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| MuxError::SessionClosed)?;
        reply_rx.await.map_err(|_| MuxError::SessionClosed)?
    }

    /// Next stream opened by the peer. Acceptor side only. `None` once the
    /// session is down.
    pub async fn accept_stream(&mut self) -> Option<MuxStream> {
        self.accept_rx.recv().await
    }

    /// Announce `GoAway` and tear the session down.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Token cancelled when the driver exits.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

struct StreamSlot {
    stream: LogicalStream,
    event_tx: mpsc::Sender<StreamEvent>,
    /// Payload accepted from the handle but not yet covered by send window
    pending_out: VecDeque<Bytes>,
}

struct Driver {
    config: MuxConfig,
    role: SessionRole,
    streams: HashMap<u32, StreamSlot>,
    next_stream_id: u32,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    accept_tx: mpsc::Sender<MuxStream>,
}

impl Driver {
    async fn run<C>(mut self, conn: C, cancel: CancellationToken, done: CancellationToken)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read, mut write) = tokio::io::split(conn);
        let mut read_buf = BytesMut::with_capacity(self.config.max_receive_buffer.min(64 * 1024));

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );
        let mut last_heard = Instant::now();
        let mut ping_seq = 0u64;

        let result: Result<(), MuxError> = 'session: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.write_all(&Frame::goaway().encode()).await;
                    break 'session Ok(());
                }

                res = read.read_buf(&mut read_buf) => {
                    match res {
                        Ok(0) => break 'session Err(MuxError::SessionClosed),
                        Err(e) => break 'session Err(e.into()),
                        Ok(_) => {
                            last_heard = Instant::now();
                            loop {
                                match Frame::decode(&mut read_buf, self.config.max_frame_size) {
                                    Ok(None) => break,
                                    Ok(Some(frame)) => {
                                        if let Err(e) = self.handle_frame(frame, &mut write).await {
                                            break 'session Err(e);
                                        }
                                    }
                                    Err(e) => break 'session Err(e),
                                }
                            }
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(Command::Shutdown) => {
                            let _ = write.write_all(&Frame::goaway().encode()).await;
                            break 'session Ok(());
                        }
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd, &mut write).await {
                                break 'session Err(e);
                            }
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if last_heard.elapsed() > KEEPALIVE_TIMEOUT {
                        break 'session Err(MuxError::KeepaliveTimeout);
                    }
                    ping_seq = ping_seq.wrapping_add(1);
                    if write.write_all(&Frame::ping(ping_seq).encode()).await.is_err() {
                        break 'session Err(MuxError::SessionClosed);
                    }
                }
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "mux session ended");
        }

        for (_, slot) in self.streams.drain() {
            let _ = slot.event_tx.try_send(StreamEvent::Close);
        }
        done.cancel();
    }

    async fn handle_frame<C>(
        &mut self,
        frame: Frame,
        write: &mut WriteHalf<C>,
    ) -> Result<(), MuxError>
    where
        C: AsyncWrite,
    {
        match frame.frame_type {
            FrameType::Data => {
                let stream_id = frame.stream_id;
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    trace!(stream_id, "data for unknown stream");
                    return Ok(());
                };
                if !slot.stream.can_recv() {
                    return Ok(());
                }
                slot.stream.consume_recv_window(frame.payload.len() as u32)?;

                if slot.event_tx.send(StreamEvent::Data(frame.payload)).await.is_err() {
                    // Handle dropped; close our side of the stream
                    slot.stream.close_local();
                    let fully_closed = slot.stream.is_closed();
                    write.write_all(&Frame::stream_close(stream_id).encode()).await?;
                    if fully_closed {
                        self.streams.remove(&stream_id);
                    }
                    return Ok(());
                }

                if let Some(increment) = slot.stream.window_update_needed() {
                    slot.stream.apply_window_update(increment);
                    write
                        .write_all(&Frame::window_update(stream_id, increment).encode())
                        .await?;
                }
                Ok(())
            }

            FrameType::StreamOpen => {
                if self.role != SessionRole::Acceptor {
                    return Err(MuxError::InvalidFrame(
                        "stream open on opener side".to_string(),
                    ));
                }
                let stream_id = frame.stream_id;
                if self.streams.len() >= MAX_STREAMS {
                    write.write_all(&Frame::stream_close(stream_id).encode()).await?;
                    return Ok(());
                }

                let (tag, target) = Frame::parse_stream_open(&frame.payload)?;
                let stream = self.register_stream(stream_id, tag, target);
                if self.accept_tx.send(stream).await.is_err() {
                    // Nobody accepting anymore; refuse the stream
                    self.streams.remove(&stream_id);
                    write.write_all(&Frame::stream_close(stream_id).encode()).await?;
                }
                Ok(())
            }

            FrameType::StreamClose => {
                let stream_id = frame.stream_id;
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.stream.close_remote();
                    let _ = slot.event_tx.send(StreamEvent::Close).await;
                    if slot.stream.is_closed() {
                        self.streams.remove(&stream_id);
                    }
                }
                Ok(())
            }

            FrameType::WindowUpdate => {
                let increment = Frame::parse_window_update(&frame.payload)?;
                if let Some(slot) = self.streams.get_mut(&frame.stream_id) {
                    slot.stream.update_send_window(increment);
                }
                self.flush_pending(frame.stream_id, write).await
            }

            FrameType::Ping => {
                let seq = if frame.payload.len() >= 8 {
                    u64::from_be_bytes(frame.payload[..8].try_into().unwrap())
                } else {
                    0
                };
                write.write_all(&Frame::pong(seq).encode()).await?;
                Ok(())
            }

            FrameType::Pong => Ok(()),

            FrameType::GoAway => Err(MuxError::SessionClosed),
        }
    }

    async fn handle_command<C>(
        &mut self,
        cmd: Command,
        write: &mut WriteHalf<C>,
    ) -> Result<(), MuxError>
    where
        C: AsyncWrite,
    {
        match cmd {
            Command::Open { tag, target, reply } => {
                if self.role != SessionRole::Opener {
                    let _ = reply.send(Err(MuxError::InvalidFrame(
                        "open on acceptor side".to_string(),
                    )));
                    return Ok(());
                }
                if self.streams.len() >= MAX_STREAMS {
                    let _ = reply.send(Err(MuxError::TooManyStreams));
                    return Ok(());
                }

                let stream_id = self.next_stream_id;
                self.next_stream_id += 2;

                write
                    .write_all(&Frame::stream_open(stream_id, tag, &target).encode())
                    .await?;

                let stream = self.register_stream(stream_id, tag, target);
                let _ = reply.send(Ok(stream));
                Ok(())
            }

            Command::Send { stream_id, data } => {
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    trace!(stream_id, "send on closed stream dropped");
                    return Ok(());
                };
                if !slot.stream.can_send() {
                    return Ok(());
                }
                slot.pending_out.push_back(data);
                self.flush_pending(stream_id, write).await
            }

            Command::Close { stream_id } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.stream.close_local();
                    let fully_closed = slot.stream.is_closed();
                    write.write_all(&Frame::stream_close(stream_id).encode()).await?;
                    if fully_closed {
                        self.streams.remove(&stream_id);
                    }
                }
                Ok(())
            }

            Command::Shutdown => Ok(()),
        }
    }

    fn register_stream(&mut self, stream_id: u32, tag: Signal, target: String) -> MuxStream {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        self.streams.insert(
            stream_id,
            StreamSlot {
                stream: LogicalStream::new(stream_id, self.config.max_stream_buffer),
                event_tx,
                pending_out: VecDeque::new(),
            },
        );
        MuxStream {
            id: stream_id,
            tag,
            target,
            sender: StreamSender {
                stream_id,
                cmd_tx: self.cmd_tx.clone(),
            },
            events: event_rx,
        }
    }

    /// Emit as much queued payload as the send window allows, chunked to the
    /// frame-size cap.
    async fn flush_pending<C>(
        &mut self,
        stream_id: u32,
        write: &mut WriteHalf<C>,
    ) -> Result<(), MuxError>
    where
        C: AsyncWrite,
    {
        let max_frame = self.config.max_frame_size;
        let Some(slot) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };

        while let Some(front) = slot.pending_out.front_mut() {
            let window = slot.stream.send_window() as usize;
            if window == 0 {
                break;
            }
            let take = front.len().min(window).min(max_frame);
            let chunk = front.split_to(take);
            if front.is_empty() {
                slot.pending_out.pop_front();
            }
            slot.stream.consume_send_window(take as u32)?;
            write.write_all(&Frame::data(stream_id, chunk).encode()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair(config: MuxConfig) -> (MuxSession, MuxSession, CancellationToken) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let cancel = CancellationToken::new();
        let opener = MuxSession::new(a, config.clone(), SessionRole::Opener, cancel.clone());
        let acceptor = MuxSession::new(b, config, SessionRole::Acceptor, cancel.clone());
        (opener, acceptor, cancel)
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (opener, mut acceptor, _cancel) = session_pair(MuxConfig::default());

        let stream = opener
            .open_stream(Signal::Tcp, "127.0.0.1:9090")
            .await
            .unwrap();
        assert_eq!(stream.id(), 1);

        let accepted = acceptor.accept_stream().await.unwrap();
        assert_eq!(accepted.id(), 1);
        assert_eq!(accepted.tag(), Signal::Tcp);
        assert_eq!(accepted.target(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_data_both_directions() {
        let (opener, mut acceptor, _cancel) = session_pair(MuxConfig::default());

        let opened = opener.open_stream(Signal::Tcp, ":80").await.unwrap();
        let mut accepted = acceptor.accept_stream().await.unwrap();

        opened.send(Bytes::from_static(b"request")).await.unwrap();
        match accepted.recv().await.unwrap() {
            StreamEvent::Data(data) => assert_eq!(&data[..], b"request"),
            other => panic!("unexpected event: {other:?}"),
        }

        accepted.send(Bytes::from_static(b"response")).await.unwrap();
        let mut opened = opened;
        match opened.recv().await.unwrap() {
            StreamEvent::Data(data) => assert_eq!(&data[..], b"response"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_payload_chunked_by_frame_size() {
        let config = MuxConfig {
            max_frame_size: 1024,
            ..MuxConfig::default()
        };
        let (opener, mut acceptor, _cancel) = session_pair(config);

        let opened = opener.open_stream(Signal::Tcp, ":80").await.unwrap();
        let mut accepted = acceptor.accept_stream().await.unwrap();

        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        opened.send(Bytes::from(payload.clone())).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            match accepted.recv().await.unwrap() {
                StreamEvent::Data(data) => {
                    assert!(data.len() <= 1024);
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_stream_close_propagates() {
        let (opener, mut acceptor, _cancel) = session_pair(MuxConfig::default());

        let opened = opener.open_stream(Signal::Tcp, ":80").await.unwrap();
        let mut accepted = acceptor.accept_stream().await.unwrap();

        opened.close().await;
        assert!(matches!(
            accepted.recv().await.unwrap(),
            StreamEvent::Close
        ));
    }

    #[tokio::test]
    async fn test_goaway_ends_peer_session() {
        let (opener, mut acceptor, _cancel) = session_pair(MuxConfig::default());

        opener.close().await;
        assert!(acceptor.accept_stream().await.is_none());

        tokio::time::timeout(std::time::Duration::from_secs(1), acceptor.done().cancelled())
            .await
            .unwrap();
        assert!(acceptor.is_closed());
    }

    #[tokio::test]
    async fn test_open_on_acceptor_side_rejected() {
        let (_opener, acceptor, _cancel) = session_pair(MuxConfig::default());

        assert!(acceptor.open_stream(Signal::Tcp, ":80").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_tears_down_both() {
        let (opener, mut acceptor, cancel) = session_pair(MuxConfig::default());

        cancel.cancel();
        assert!(acceptor.accept_stream().await.is_none());
        tokio::time::timeout(std::time::Duration::from_secs(1), opener.done().cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_ids_are_odd_and_increasing() {
        let (opener, mut acceptor, _cancel) = session_pair(MuxConfig::default());

        let first = opener.open_stream(Signal::Tcp, ":1").await.unwrap();
        let second = opener.open_stream(Signal::Tcp, ":2").await.unwrap();
        let third = opener.open_stream(Signal::Tcp, ":3").await.unwrap();
        assert_eq!((first.id(), second.id(), third.id()), (1, 3, 5));

        for _ in 0..3 {
            acceptor.accept_stream().await.unwrap();
        }
    }
}
