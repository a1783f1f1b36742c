//! Wire codec for the local socket transport.
//!
//! Each message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 payload. Request and reply bytes travel hex-encoded.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::buffer::{SharedAllocator, TransportBuffer};
use crate::config::TransportConfig;
use crate::fault::TransportFault;
use crate::status::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One call on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: CallParams,
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallParams {
    /// Hex-encoded request bytes.
    pub payload: String,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, payload: &[u8], id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: CallParams {
                payload: hex::encode(payload),
            },
            id,
        }
    }
}

/// Reply to one call: either an operation result or a transport fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallFault>,
    pub id: Option<u64>,
}

/// The operation's own outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReply {
    pub status: u32,
    /// Hex-encoded reply bytes; absent for an empty result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// A fault raised by the serving transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFault {
    pub code: u32,
    pub message: String,
}

impl CallResponse {
    pub fn reply(id: u64, status: StatusCode, payload: Option<&[u8]>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(CallReply {
                status: status.raw(),
                payload: payload.map(hex::encode),
            }),
            error: None,
            id: Some(id),
        }
    }

    pub fn fault(id: Option<u64>, fault: &TransportFault) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(CallFault {
                code: fault.status().raw(),
                message: fault.to_string(),
            }),
            id,
        }
    }
}

/// Decode hex payload text straight into a transport-owned buffer.
pub fn decode_payload(
    hex_payload: &str,
    allocator: &SharedAllocator,
) -> Result<TransportBuffer, TransportFault> {
    if hex_payload.len() % 2 != 0 {
        return Err(TransportFault::Protocol {
            message: "odd-length payload".to_string(),
        });
    }

    let mut buffer = TransportBuffer::zeroed(hex_payload.len() / 2, allocator.clone())
        .map_err(|e| TransportFault::from_status(StatusCode::RPC_S_OUT_OF_RESOURCES, e.to_string()))?;
    hex::decode_to_slice(hex_payload, buffer.as_mut_slice()).map_err(|e| {
        TransportFault::Protocol {
            message: format!("bad payload encoding: {}", e),
        }
    })?;
    Ok(buffer)
}

/// Read a length-prefixed frame.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, TransportFault> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_fault(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(TransportFault::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(io_fault)?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportFault> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(TransportFault::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                TransportConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await.map_err(io_fault)?;
    writer.write_all(payload).await.map_err(io_fault)?;
    writer.flush().await.map_err(io_fault)?;
    Ok(())
}

fn io_fault(err: std::io::Error) -> TransportFault {
    TransportFault::CallFailed {
        message: err.to_string(),
    }
}
