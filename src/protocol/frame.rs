//! Frame encode/decode
//!
//! Each codec-encoded value (a header or a body) is carried in one frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use xxhash_rust::xxh3::xxh3_64;

use super::{CHECKSUM_SIZE, Error, LENGTH_SIZE, MIN_FRAME_SIZE, Result};

/// Encode a payload into a frame
///
/// # Format
///
/// ```text
/// [LENGTH (4 bytes, LE)] [PAYLOAD (variable)] [CHECKSUM (8 bytes, LE)]
/// ```
///
/// The checksum is XXH3-64 over the payload.
pub fn encode_frame(payload: &[u8], max: usize, dst: &mut BytesMut) -> Result<()> {
    if payload.len() > max {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| Error::FrameTooLarge {
        size: payload.len(),
        max,
    })?;

    dst.reserve(MIN_FRAME_SIZE + payload.len());
    dst.put_u32_le(len);
    dst.put_slice(payload);
    dst.put_u64_le(xxh3_64(payload));
    Ok(())
}

/// Decode one frame from the front of `bytes`, returning its payload.
///
/// # Errors
///
/// Returns an error if:
/// - Buffer is too small
/// - Declared length exceeds `max`
/// - Checksum doesn't match
pub fn decode_frame(bytes: &mut Bytes, max: usize) -> Result<Bytes> {
    if bytes.len() < MIN_FRAME_SIZE {
        return Err(Error::BufferTooSmall {
            needed: MIN_FRAME_SIZE,
            got: bytes.len(),
        });
    }

    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max {
        return Err(Error::FrameTooLarge { size: len, max });
    }

    let total = LENGTH_SIZE + len + CHECKSUM_SIZE;
    if bytes.len() < total {
        return Err(Error::BufferTooSmall {
            needed: total,
            got: bytes.len(),
        });
    }

    bytes.advance(LENGTH_SIZE);
    let payload = bytes.split_to(len);
    let stored = bytes.get_u64_le();
    verify(&payload, stored)?;
    Ok(payload)
}

/// Read one frame from an async reader, returning its payload.
///
/// A stream that ends before the length prefix yields an
/// `UnexpectedEof` IO error, which callers treat as a clean close.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32_le().await? as usize;
    if len > max {
        return Err(Error::FrameTooLarge { size: len, max });
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    let stored = reader.read_u64_le().await?;

    let payload = payload.freeze();
    verify(&payload, stored)?;
    Ok(payload)
}

/// Write an already-encoded buffer and flush it.
pub async fn write_frame<W>(writer: &mut W, frames: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frames).await?;
    writer.flush().await?;
    Ok(())
}

fn verify(payload: &[u8], stored: u64) -> Result<()> {
    let calculated = xxh3_64(payload);
    if stored != calculated {
        return Err(Error::ChecksumMismatch {
            expected: calculated,
            found: stored,
        });
    }
    Ok(())
}
