//! Length-prefixed framing used on the Unity socket.
//!
//! Every message in both directions is a 4-byte big-endian length followed by
//! exactly that many bytes of UTF-8 JSON (or the literal `ping` for liveness).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::unity_messages::BridgeError;

/// Upper bound on a declared frame length. Larger frames are rejected before any allocation.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Size of the length prefix in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// Writes one frame: the big-endian length prefix and the payload in a single write
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len()).map_err(|_| BridgeError::MessageTooLarge {
        size: payload.len() as u64,
        limit: u32::MAX as usize,
    })?;

    let mut buffer = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer.extend_from_slice(payload);

    writer
        .write_all(&buffer)
        .await
        .map_err(|e| BridgeError::from_io("Failed to write frame", &e))?;
    writer
        .flush()
        .await
        .map_err(|e| BridgeError::from_io("Failed to flush frame", &e))?;
    Ok(())
}

/// Reads one frame with the default size ceiling
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    read_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

/// Reads one frame, rejecting declared lengths above `limit`
pub async fn read_frame_with_limit<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_exact_counted(reader, &mut prefix).await?;

    let length = u32::from_be_bytes(prefix);
    if length as usize > limit {
        return Err(BridgeError::MessageTooLarge {
            size: u64::from(length),
            limit,
        });
    }

    let mut payload = vec![0u8; length as usize];
    read_exact_counted(reader, &mut payload).await?;
    Ok(payload)
}

/// Fills `buffer` completely, looping over partial reads.
///
/// `read_exact` would lose the number of bytes received before the stream closed,
/// which is the useful part of the error.
async fn read_exact_counted<R>(reader: &mut R, buffer: &mut [u8]) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut received = 0;
    while received < buffer.len() {
        let n = reader
            .read(&mut buffer[received..])
            .await
            .map_err(|e| BridgeError::from_io("Failed to read frame", &e))?;
        if n == 0 {
            return Err(BridgeError::TransportClosed {
                expected: buffer.len(),
                received,
            });
        }
        received += n;
    }
    Ok(())
}
