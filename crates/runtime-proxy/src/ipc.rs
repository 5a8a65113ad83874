//! IPC framing between notebook windows and the proxy daemon.
//!
//! Every frame is a big-endian `u32` byte count followed by that many bytes
//! of JSON. The first frame on a connection is a [`Handshake`]; it is held
//! to a much smaller limit than the request and event frames after it.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size limits for the two kinds of frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLimit {
    /// 64 KiB.
    Handshake,
    /// 16 MiB. Binary kernel buffers travel as JSON byte arrays.
    Message,
}

impl FrameLimit {
    pub const fn bytes(self) -> usize {
        match self {
            FrameLimit::Handshake => 64 * 1024,
            FrameLimit::Message => 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// First frame on every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Handshake {
    /// A notebook window. It owns the sockets it opens; they are swept
    /// when the connection ends.
    Window {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// Status, termination notices, shutdown. May not open sockets.
    Control,
}

/// Encode `value` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    let max = FrameLimit::Message.bytes();
    if payload.len() > max {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max,
        });
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame's raw payload. `None` means the peer closed cleanly
/// between frames.
pub async fn read_raw_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: FrameLimit,
) -> Result<Option<Vec<u8>>, FrameError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let max = limit.bytes();
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Read and decode one message frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_raw_frame(reader, FrameLimit::Message).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Handshake>, FrameError> {
    match read_raw_frame(reader, FrameLimit::Handshake).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frames_share_a_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"n": 1})).await.unwrap();
        write_frame(&mut buf, &json!("two")).await.unwrap();
        assert_eq!(&buf[..4], &7u32.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let first: Value = read_frame(&mut cursor).await.unwrap().unwrap();
        let second: Value = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first["n"], 1);
        assert_eq!(second, "two");
        assert!(read_frame::<_, Value>(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frames_are_rejected_before_reading() {
        let header = (FrameLimit::Handshake.bytes() as u32 + 1).to_be_bytes();
        let err = read_handshake(&mut Cursor::new(header.to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max, .. } if max == 64 * 1024));

        // The same header is fine for a message frame; the body is missing.
        let err = read_raw_frame(&mut Cursor::new(header.to_vec()), FrameLimit::Message)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_undecodable_payload() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{x}");
        let err = read_frame::<_, Value>(&mut Cursor::new(buf)).await.unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[tokio::test]
    async fn test_handshake_wire_format() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Handshake::Control).await.unwrap();
        assert_eq!(&buf[4..], br#"{"channel":"control"}"#);

        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Handshake::Window {
                label: Some("nb-1".into()),
            },
        )
        .await
        .unwrap();
        match read_handshake(&mut Cursor::new(buf)).await.unwrap().unwrap() {
            Handshake::Window { label } => assert_eq!(label.as_deref(), Some("nb-1")),
            other => panic!("unexpected handshake: {:?}", other),
        }
    }
}
