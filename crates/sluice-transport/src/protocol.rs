//! Length-prefixed framing shared by the stream transports.
//!
//! Every frame is a big-endian `u32` length followed by that many bytes.
//! A transfer on a stream is `[header frame][payload frame]` where the header
//! is the JSON-encoded [`TransferMetadata`]; the receiving side acknowledges
//! by writing a single [`ACK`] byte before closing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{TransferMetadata, TransportError};

/// Acknowledgement byte written by a receiver after a complete transfer.
pub const ACK: u8 = 0x06;

/// Upper bound for a metadata header frame.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Request tag sent by a receiving peer asking for a transfer's payload.
pub const PULL_TAG: &[u8] = b"SLUICE_PULL:";

/// Write a length-prefixed frame.
pub async fn write_framed<W>(stream: &mut W, data: &[u8]) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting anything larger than `max_size`.
pub async fn read_framed<R>(stream: &mut R, max_size: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::io("frame", e))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::io("frame", e))?;

    Ok(buf)
}

/// Write the metadata header followed by the payload frame.
pub async fn write_transfer<W>(
    stream: &mut W,
    meta: &TransferMetadata,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let header = meta
        .to_bytes()
        .map_err(|e| TransportError::Frame(format!("header encode: {e}")))?;
    write_framed(stream, &header)
        .await
        .map_err(|e| TransportError::io("frame", e))?;
    write_framed(stream, payload)
        .await
        .map_err(|e| TransportError::io("frame", e))?;
    Ok(())
}

/// Read a metadata header and the payload that follows it.
pub async fn read_transfer<R>(
    stream: &mut R,
    max_payload: usize,
) -> Result<(TransferMetadata, Vec<u8>), TransportError>
where
    R: AsyncRead + Unpin,
{
    let header = read_framed(stream, MAX_HEADER_SIZE).await?;
    let meta = TransferMetadata::from_bytes(&header)
        .map_err(|e| TransportError::Frame(format!("header decode: {e}")))?;
    let payload = read_framed(stream, max_payload).await?;
    Ok((meta, payload))
}

/// Wait for the single acknowledgement byte from the peer.
pub async fn read_ack<R>(stream: &mut R) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    stream
        .read_exact(&mut byte)
        .await
        .map_err(|e| TransportError::io("frame", e))?;
    if byte[0] != ACK {
        return Err(TransportError::Frame(format!(
            "unexpected acknowledgement byte 0x{:02x}",
            byte[0]
        )));
    }
    Ok(())
}

/// Build the pull request frame a receiver sends for `transfer_id`.
pub fn pull_request(transfer_id: &str) -> Vec<u8> {
    let mut frame = PULL_TAG.to_vec();
    frame.extend_from_slice(transfer_id.as_bytes());
    frame
}
