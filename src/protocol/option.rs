//! Connection-level option negotiation
//!
//! The initiator writes one `Options` value as a single line of JSON before
//! any codec-framed bytes. The acceptor reads exactly that line, so the codec
//! frames that follow stay untouched in the reader's buffer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecRegistry, CodecType, Error, MAGIC_NUMBER, Result};

/// Negotiation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`]
    pub magic_number: u32,
    /// Codec used for every frame after negotiation
    pub codec_type: CodecType,
}

impl Options {
    /// Options selecting `codec_type`.
    #[must_use]
    pub fn with_codec(codec_type: impl Into<CodecType>) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec_type.into(),
        }
    }

    /// Fill in what a caller may leave out.
    ///
    /// The magic number always becomes [`MAGIC_NUMBER`] and an empty codec
    /// type becomes the default codec.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.magic_number = MAGIC_NUMBER;
        if self.codec_type.is_empty() {
            self.codec_type = CodecType::default();
        }
        self
    }

    /// Check the magic number and that the codec is known to `registry`.
    pub fn validate(&self, registry: &CodecRegistry) -> Result<()> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(Error::InvalidMagic {
                found: self.magic_number,
            });
        }
        if !registry.contains(&self.codec_type) {
            return Err(Error::UnknownCodec(self.codec_type.to_string()));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::with_codec(CodecType::default())
    }
}

/// Write the negotiation line.
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line =
        serde_json::to_vec(options).map_err(|e| Error::MalformedOptions(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the negotiation line without consuming anything after it.
///
/// Lines longer than `max` are rejected.
pub async fn read_options<R>(reader: &mut R, max: usize) -> Result<Options>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = u64::try_from(max).unwrap_or(u64::MAX);
    let read = reader.take(limit).read_until(b'\n', &mut line).await?;

    if read == 0 {
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if line.last() != Some(&b'\n') {
        if read >= max {
            return Err(Error::MalformedOptions(format!(
                "negotiation line exceeds {max} bytes"
            )));
        }
        return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    serde_json::from_slice(&line).map_err(|e| Error::MalformedOptions(e.to_string()))
}
