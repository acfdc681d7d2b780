//! Option negotiation for both ends of a connection.
//!
//! The initiator sends its [`Options`] before any codec frames; the
//! responder validates them and either binds the chosen codec or closes the
//! connection without sending anything back.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::conn::{ConnReader, ConnWriter, split};
use super::Config;
use crate::protocol::metrics::Metrics;
use crate::protocol::{CodecRegistry, Error, Options, Result, read_options, write_options};

/// Send `options` on a fresh connection and bind the negotiated codec.
///
/// The codec must be known locally; an unknown codec is rejected before
/// anything is written.
pub async fn initiate<S>(
    stream: S,
    options: &Options,
    config: &Config,
    registry: &CodecRegistry,
) -> Result<(ConnReader, ConnWriter)>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(codec) = registry.get(&options.codec_type) else {
        return Err(Error::UnknownCodec(options.codec_type.to_string()));
    };

    let (reader, mut writer) = split(stream);
    if let Err(err) = write_options(&mut writer, options).await {
        warn!(error = %err, "failed to send options");
        let _ = writer.shutdown().await;
        return Err(err);
    }
    debug!(codec = %options.codec_type, "options sent");

    Ok((
        ConnReader::new(reader, codec.clone(), config.max_frame_size),
        ConnWriter::new(writer, codec, config.max_frame_size),
    ))
}

/// Read and validate the peer's options, then bind the negotiated codec.
///
/// Any failure shuts the connection down; no response is ever sent, since
/// no framing was agreed.
pub async fn respond<S>(
    stream: S,
    config: &Config,
    registry: &CodecRegistry,
) -> Result<(Options, ConnReader, ConnWriter)>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = split(stream);

    let negotiated = match read_options(&mut reader, config.max_option_size).await {
        Ok(options) => options.validate(registry).map(|()| options),
        Err(err) => Err(err),
    };

    let options = match negotiated {
        Ok(options) => options,
        Err(err) => {
            Metrics::record_rejected_handshake();
            let _ = writer.shutdown().await;
            return Err(err);
        }
    };

    let Some(codec) = registry.get(&options.codec_type) else {
        let _ = writer.shutdown().await;
        return Err(Error::UnknownCodec(options.codec_type.to_string()));
    };
    debug!(codec = %options.codec_type, "options accepted");

    Ok((
        options,
        ConnReader::new(reader, codec.clone(), config.max_frame_size),
        ConnWriter::new(writer, codec, config.max_frame_size),
    ))
}
