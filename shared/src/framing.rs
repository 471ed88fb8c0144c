//! Length-prefixed framing.
//!
//! Every message is a 4-byte big-endian length followed by that many bytes of encoded
//! `Packet`. Zero-length frames are keep-alive no-ops and are skipped by the reader.

use crate::error::{ProtocolError, Result};
use crate::protocol::Packet;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX: usize = 4;
pub const MAX_FRAME_SIZE: usize = 32 * 1024;

/// Prefixes `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    encode_frame(&packet.encode()?)
}

/// Checks that `bytes` holds exactly one complete frame and returns its payload
pub fn split_frame(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < LENGTH_PREFIX {
        return Err(ProtocolError::Io(ErrorKind::UnexpectedEof.into()));
    }
    let mut prefix = [0u8; LENGTH_PREFIX];
    prefix.copy_from_slice(&bytes[..LENGTH_PREFIX]);
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if bytes.len() != LENGTH_PREFIX + len {
        return Err(ProtocolError::Io(ErrorKind::InvalidData.into()));
    }
    Ok(&bytes[LENGTH_PREFIX..])
}

/// Reads the next non-empty frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 {
            continue;
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        return Ok(Some(payload));
    }
}

pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(Packet::decode(&payload)?)),
        None => Ok(None),
    }
}

/// Writes an already framed buffer and flushes it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_packet(packet)?;
    write_frame(writer, &frame).await
}
