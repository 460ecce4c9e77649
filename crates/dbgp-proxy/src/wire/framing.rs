//! The two wire shapes used by the debug protocol: NUL-terminated text
//! commands, and length-prefixed response payloads. See the framing
//! invariants in the project's design notes for the exact byte layout.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::FramingError;

/// Outcome of a bounded-time response read: either a full message arrived,
/// or the deadline elapsed with nothing to show for it. Timing out is not
/// an error — callers loop on it to interleave shutdown/eviction checks.
pub enum ReadOutcome {
    Message(Vec<u8>),
    TimedOut,
}

/// Reads a single NUL-terminated command line, stripping the terminator.
pub async fn read_command<R>(stream: &mut R) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(FramingError::Incomplete);
        }
        if byte[0] == 0 {
            return Ok(buf);
        }
        buf.push(byte[0]);
    }
}

/// Reads one length-prefixed response: `<decimal-length>\0<payload>\0`.
pub async fn read_response<R>(stream: &mut R) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let length = read_length_prefix(stream).await?;
    read_payload(stream, length).await
}

/// Same as [`read_response`], but bounded by `deadline`. Used on long-lived
/// connections where blocking indefinitely would prevent shutdown/eviction
/// checks from ever running.
pub async fn read_response_timeout<R>(
    stream: &mut R,
    deadline: Duration,
) -> Result<ReadOutcome, FramingError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(deadline, read_response(stream)).await {
        Ok(result) => result.map(ReadOutcome::Message),
        Err(_) => Ok(ReadOutcome::TimedOut),
    }
}

async fn read_length_prefix<R>(stream: &mut R) -> Result<usize, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut digits = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(FramingError::Incomplete);
        }
        if byte[0] == 0 {
            break;
        }
        digits.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&digits).into_owned();
    text.parse::<usize>()
        .map_err(|_| FramingError::BadLength(text))
}

async fn read_payload<R>(stream: &mut R, length: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;

    let mut trailer = [0u8; 1];
    let n = stream.read(&mut trailer).await?;
    if n == 0 || trailer[0] != 0 {
        return Err(FramingError::MissingTrailer);
    }
    Ok(payload)
}

/// Writes a NUL-terminated command line.
pub async fn write_command<W>(stream: &mut W, text: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(text).await?;
    stream.write_all(&[0u8]).await?;
    stream.flush().await?;
    Ok(())
}

/// Writes a length-prefixed response payload.
pub async fn write_response<W>(stream: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("{}\0", payload.len());
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(payload).await?;
    stream.write_all(&[0u8]).await?;
    stream.flush().await?;
    Ok(())
}
