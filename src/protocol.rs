//! The binary wire protocol (§4.6, §6): a fixed 12-byte frame header
//! followed by a MessagePack-encoded payload.
//!
//! ```text
//! bytes 0-3   magic   0x4E 0x45 0x58 0x41  ("NEXA")
//! byte  4     version  0x01
//! byte  5     message type
//! bytes 6-7   flags    reserved, 0
//! bytes 8-11  payload length, big-endian u32, max 16 MiB
//! ```
//!
//! [`read_frame`]/[`write_frame`] handle the header; the payload itself is
//! just a [`Value`], which already round-trips through `rmp_serde` as a
//! MessagePack map for object-shaped payloads.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::document::Value;
use crate::error::{NexaError, Result};

pub const MAGIC: [u8; 4] = [0x4E, 0x45, 0x58, 0x41];
pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD_BYTES: u32 = 16 * 1024 * 1024;

// Request message types (client -> server).
pub const MSG_CONNECT: u8 = 0x01;
pub const MSG_CREATE: u8 = 0x02;
pub const MSG_READ: u8 = 0x03;
pub const MSG_UPDATE: u8 = 0x04;
pub const MSG_DELETE: u8 = 0x05;
pub const MSG_QUERY: u8 = 0x06;
pub const MSG_VECTOR_SEARCH: u8 = 0x07;
pub const MSG_BATCH_WRITE: u8 = 0x08;
pub const MSG_PING: u8 = 0x09;
pub const MSG_DISCONNECT: u8 = 0x0A;

// Response message types (server -> client).
pub const MSG_SUCCESS: u8 = 0x81;
pub const MSG_ERROR: u8 = 0x82;
pub const MSG_NOT_FOUND: u8 = 0x83;
pub const MSG_DUPLICATE: u8 = 0x84;
pub const MSG_PONG: u8 = 0x88;

/// A decoded frame: the message type byte and its payload, already parsed
/// as a [`Value`] (an empty object for payload-less requests like `PING`).
pub struct Frame {
    pub msg_type: u8,
    pub payload: Value,
}

/// Reads one frame from `reader`. Returns `Ok(None)` on a clean
/// end-of-stream before any header bytes arrive (graceful disconnect).
/// Any other framing problem — wrong magic, unknown version, oversize
/// length, or a MessagePack payload that fails to decode — surfaces as
/// [`NexaError::BadFrame`] / [`NexaError::BadPayload`], which the session
/// loop turns into a terminal `ERROR` response.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    read_frame_with_limit(reader, MAX_PAYLOAD_BYTES).await
}

/// Like [`read_frame`], but rejects any payload over `max_payload_bytes`
/// rather than the protocol-wide 16 MiB ceiling. The server uses this with
/// `ServerConfig::max_in_flight_bytes` so a connection's backpressure cap
/// can be tightened below the wire format's hard maximum without changing
/// the frame format itself (§4.6, §4.7).
pub async fn read_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_bytes: u32,
) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match read_exact_or_eof(reader, &mut header).await? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Partial => return Err(NexaError::BadFrame("truncated frame header".into())),
        ReadOutcome::Full => {}
    }

    if header[0..4] != MAGIC {
        return Err(NexaError::BadFrame("bad magic".into()));
    }
    if header[4] != VERSION {
        return Err(NexaError::BadFrame(format!("unsupported protocol version {}", header[4])));
    }
    let msg_type = header[5];
    let payload_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let effective_limit = max_payload_bytes.min(MAX_PAYLOAD_BYTES);
    if payload_len > effective_limit {
        return Err(NexaError::BadFrame(format!(
            "payload length {payload_len} exceeds the {effective_limit}-byte maximum"
        )));
    }

    let payload = if payload_len == 0 {
        Value::object()
    } else {
        let mut buf = vec![0u8; payload_len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| NexaError::BadFrame("truncated frame payload".into()))?;
        rmp_serde::from_slice(&buf)?
    };

    Ok(Some(Frame { msg_type, payload }))
}

/// Encodes and writes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg_type: u8, payload: &Value) -> Result<()> {
    let body = rmp_serde::to_vec(payload)?;
    if body.len() as u64 > MAX_PAYLOAD_BYTES as u64 {
        return Err(NexaError::Internal("response payload exceeds maximum frame size".into()));
    }

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&MAGIC);
    header[4] = VERSION;
    header[5] = msg_type;
    header[6..8].copy_from_slice(&0u16.to_be_bytes());
    header[8..12].copy_from_slice(&(body.len() as u32).to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]).await? {
            0 => {
                return Ok(if read == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial });
            }
            n => read += n,
        }
    }
    Ok(ReadOutcome::Full)
}

/// Builds the `{error, kind}` payload an `ERROR`/`NOT_FOUND`/`DUPLICATE`
/// response carries, and picks the response message type, from a
/// [`NexaError`] (§7).
pub fn error_response(err: &NexaError) -> (u8, Value) {
    use crate::error::ErrorKind;

    let msg_type = match err.kind() {
        ErrorKind::NotFound => MSG_NOT_FOUND,
        ErrorKind::Duplicate => MSG_DUPLICATE,
        _ => MSG_ERROR,
    };

    let mut fields = vec![("error".to_string(), Value::String(err.to_string()))];
    if msg_type == MSG_ERROR {
        fields.push(("kind".to_string(), Value::String(err.kind().as_str().to_string())));
    }
    (msg_type, Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let payload = Value::Object(vec![("hello".to_string(), Value::String("world".into()))]);
        let mut buf = Vec::new();
        write_frame(&mut buf, MSG_SUCCESS, &payload).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MSG_SUCCESS);
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&[0, 0, 0, 0]);
        let mut cursor = Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(NexaError::BadFrame(_))));
    }

    #[tokio::test]
    async fn oversize_payload_length_is_rejected() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[8..12].copy_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(NexaError::BadFrame(_))));
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_is_a_graceful_disconnect() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }
}
