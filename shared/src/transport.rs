//! Async framing over a tokio byte stream.

use crate::error::CodecError;
use crate::protocol::{decode_body, encode, frame_length, NetMessage, FRAME_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Items on a connection's outbound queue, drained by its writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(NetMessage),
    /// Flush what is queued and close the stream.
    Close,
}

/// Reads one message. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<NetMessage>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = frame_length(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

/// Writes one message and returns the number of bytes put on the wire.
pub async fn write_message<W>(writer: &mut W, message: &NetMessage) -> Result<usize, CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}
