//! Byte-level frame encode/decode.
//!
//! The length prefix makes the reader stream-safe without look-ahead, and
//! the separate header length lets a receiver reject a malformed request
//! and route on service/method before touching the body.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::Serializer;
use crate::error::{Result, RpcError};
use crate::protocol::{Header, Message, MAGIC, VERSION};

/// Hard cap on `total_len`, guarding against hostile length prefixes.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// The fixed, build-time codec for the header bytes. Both peers must agree.
pub const HEADER_SERIALIZER: Serializer = Serializer::MessagePack;

/// Serializes a message into a single frame.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let header_bytes = HEADER_SERIALIZER.encode(&message.header)?;
    let total_len = 4 + header_bytes.len() + message.body.len();

    let mut buf = Vec::with_capacity(7 + total_len);
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&(total_len as u32).to_be_bytes());
    buf.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&message.body);
    Ok(buf)
}

/// Reads one frame off the stream.
///
/// An EOF before the first byte is an io error (the peer closed between
/// frames); anything short after that is a [`RpcError::Framing`], as are a
/// bad magic, a bad version, an impossible length, or header bytes the
/// header codec rejects.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let mut first = [0u8; 3];
    r.read_exact(&mut first).await?;

    if first[..2] != MAGIC {
        return Err(RpcError::Framing("wrong protocol magic".to_string()));
    }
    if first[2] != VERSION {
        return Err(RpcError::Framing(format!(
            "unsupported protocol version {}",
            first[2]
        )));
    }

    let mut total_len_bytes = [0u8; 4];
    read_framed(r, &mut total_len_bytes).await?;
    let total_len = u32::from_be_bytes(total_len_bytes) as usize;
    if total_len < 4 {
        return Err(RpcError::Framing("invalid total length".to_string()));
    }
    if total_len > MAX_MESSAGE_SIZE {
        return Err(RpcError::Framing(format!(
            "message too large: {total_len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }

    let mut data = vec![0u8; total_len];
    read_framed(r, &mut data).await?;

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if header_len + 4 > total_len {
        return Err(RpcError::Framing("header length exceeds frame".to_string()));
    }

    let header: Header = HEADER_SERIALIZER
        .decode(&data[4..4 + header_len])
        .map_err(|e| RpcError::Framing(format!("bad header: {e}")))?;
    let body = data[4 + header_len..].to_vec();

    Ok(Message { header, body })
}

/// `read_exact` that reports a truncated frame as a framing error rather
/// than a plain io error.
async fn read_framed<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::Framing("unexpected eof inside frame".to_string())
        } else {
            RpcError::Io(e)
        }
    })?;
    Ok(())
}
