//! Length-prefixed message framing over a byte stream.
//!
//! A frame is exactly one encoded `Request` or `Response`. The reader learns
//! the frame size from the fixed header (`HeadLength + BodyLength`) and reads
//! exactly that many bytes; `read_exact`/`write_all` retry short reads and
//! writes until the stream closes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, Result};
use crate::protocol::{FixedHeader, FIXED_HEADER_SIZE};

/// Read one complete frame.
///
/// # Errors
///
/// - `ConnectionClosed` if the stream ends cleanly before a new frame starts
/// - `Io(UnexpectedEof)` if it ends in the middle of a frame
/// - `Protocol`/`MessageTooLarge` if the declared lengths are implausible;
///   nothing beyond the fixed header is allocated in that case
pub async fn read_frame<R>(reader: &mut R, max_message_size: u32) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; FIXED_HEADER_SIZE];

    // The first byte decides between a clean close and a truncated frame.
    let n = reader.read(&mut head[..1]).await?;
    if n == 0 {
        return Err(RpcError::ConnectionClosed);
    }
    reader.read_exact(&mut head[1..]).await?;

    let header = FixedHeader::decode(&head)
        .ok_or_else(|| RpcError::Protocol("short fixed header".to_string()))?;
    header.validate(max_message_size)?;

    let total = header.total_length() as usize;
    let mut frame = vec![0u8; total];
    frame[..FIXED_HEADER_SIZE].copy_from_slice(&head);
    reader.read_exact(&mut frame[FIXED_HEADER_SIZE..]).await?;

    Ok(frame)
}

/// Write one complete, already encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
