//! Byte-level encode/decode for signals and length-prefixed strings
//!
//! String framing is a big-endian `u16` length followed by that many UTF-8
//! bytes; length 0 is legal. The tagged variants carry one extra leading
//! signal byte and are used for the handshake and target-address frames.
//!
//! None of these functions impose a deadline of their own; callers that need
//! one (the handshake does) wrap the receive in `tokio::time::timeout`.

use super::{ProtocolError, Signal};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encodable string length
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Write exactly one signal byte.
pub async fn send_signal<W>(conn: &mut W, signal: Signal) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    conn.write_all(&[signal as u8]).await?;
    Ok(())
}

/// Read exactly one signal byte; fails on EOF, I/O error, or a byte outside
/// the alphabet.
pub async fn recv_signal<R>(conn: &mut R) -> Result<Signal, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    conn.read_exact(&mut byte).await?;
    Signal::try_from(byte[0])
}

/// Write a length-prefixed string.
///
/// The prefix and body go out in a single write so a signal byte from another
/// task can never interleave mid-frame.
pub async fn send_string<W>(conn: &mut W, msg: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if msg.len() > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(msg.len()));
    }

    let mut buf = Vec::with_capacity(2 + msg.len());
    buf.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    buf.extend_from_slice(msg.as_bytes());
    conn.write_all(&buf).await?;
    Ok(())
}

/// Read a length-prefixed string.
pub async fn recv_string<R>(conn: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Write a signal byte followed by a length-prefixed string, as one write.
pub async fn send_tagged_string<W>(
    conn: &mut W,
    msg: &str,
    tag: Signal,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if msg.len() > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(msg.len()));
    }

    let mut buf = Vec::with_capacity(3 + msg.len());
    buf.push(tag as u8);
    buf.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    buf.extend_from_slice(msg.as_bytes());
    conn.write_all(&buf).await?;
    Ok(())
}

/// Read a tagged string; returns the tag and the string.
pub async fn recv_tagged_string<R>(conn: &mut R) -> Result<(Signal, String), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let tag = recv_signal(conn).await?;
    let msg = recv_string(conn).await?;
    Ok((tag, msg))
}
