//! Length-prefixed CBOR framing shared by the request and hey protocols.
//! Frames are a 4-byte big-endian length followed by the CBOR body.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cbor;
use crate::error::{ExchangeError, Result};

/// Upper bound on a single frame. Requests and handshakes are tiny; anything
/// larger is a protocol violation.
pub const MAX_FRAME_SIZE: u32 = 1 << 20;

pub async fn write_framed<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = cbor::to_vec(value)?;
    if body.len() as u32 > MAX_FRAME_SIZE {
        return Err(ExchangeError::Protocol(format!(
            "frame too large: {} bytes",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_framed<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(ExchangeError::Protocol(format!(
            "frame too large: {len} bytes"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    cbor::from_slice(&body)
}
