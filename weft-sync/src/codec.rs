//! Length-prefixed JSON framing for the plaintext plane.
//!
//! Every wire message is a 4-byte big-endian length followed by JSON.
//! Both directions enforce [`MAX_MESSAGE_SIZE`].

use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Reads a length-prefixed JSON message.
///
/// A clean EOF at the length prefix maps to
/// [`SyncError::ConnectionClosed`] so callers can tell session end from
/// transport faults.
pub async fn read_message<T, M>(io: &mut T) -> SyncResult<M>
where
    T: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            SyncError::ConnectionClosed
        } else {
            SyncError::Io(e)
        }
    })?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(SyncError::Protocol(format!("message too large: {len} bytes")));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            SyncError::ConnectionClosed
        } else {
            SyncError::Io(e)
        }
    })?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Reads a message, failing with [`SyncError::Timeout`] after `dur`.
pub async fn read_message_timeout<T, M>(io: &mut T, dur: Duration) -> SyncResult<M>
where
    T: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    tokio::time::timeout(dur, read_message(io))
        .await
        .map_err(|_| SyncError::Timeout)?
}

/// Writes a length-prefixed JSON message.
pub async fn write_message<T, M>(io: &mut T, message: &M) -> SyncResult<()>
where
    T: AsyncWrite + Unpin,
    M: Serialize,
{
    let data = serde_json::to_vec(message)?;

    if data.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::Protocol(format!(
            "message too large: {} bytes",
            data.len()
        )));
    }

    let len_bytes = (data.len() as u32).to_be_bytes();
    io.write_all(&len_bytes).await?;
    io.write_all(&data).await?;
    io.flush().await?;

    Ok(())
}
