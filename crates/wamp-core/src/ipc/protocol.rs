//! Frame codec for the TCP transport.
//!
//! Every message, whether client to worker or worker to coordinator, is one
//! frame: a 4-byte big-endian length prefix followed by that many bytes of
//! UTF-8 JSON.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::IpcConfig;
use crate::{Result, WampError};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn oversize(len: usize) -> WampError {
    WampError::Validation {
        field: "ipc_frame".to_string(),
        message: format!(
            "IPC message size {} exceeds maximum {}",
            len,
            IpcConfig::MAX_MESSAGE_SIZE
        ),
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(oversize(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(oversize(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a frame payload as JSON.
pub fn decode_payload(frame: Vec<u8>) -> Result<Value> {
    let text = String::from_utf8(frame).map_err(|_| WampError::Validation {
        field: "ipc_payload".to_string(),
        message: "Invalid UTF-8 in IPC frame".to_string(),
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Read one frame and decode it as JSON. `None` on clean EOF.
pub async fn read_value<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Value>> {
    match read_frame(reader).await? {
        Some(frame) => decode_payload(frame).map(Some),
        None => Ok(None),
    }
}

/// Encode `value` and write it as one frame.
pub async fn write_value<W: AsyncWriteExt + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    write_frame(writer, &bytes).await
}
