//! Codec-bound connection halves.
//!
//! A duplex stream is split once. The read half is owned by exactly one
//! reader loop; the write half sits behind the connection's send lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::protocol::{
    Codec, CodecType, DecodeTarget, Error, Header, Result, encode_frame, read_frame, write_frame,
};

/// Boxed read half of a connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split a duplex stream into boxed halves.
///
/// The read half is buffered so negotiation can read a line without losing
/// the frames that follow it.
pub fn split<S>(stream: S) -> (BufReader<BoxedReader>, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader: BoxedReader = Box::new(read_half);
    let writer: BoxedWriter = Box::new(write_half);
    (BufReader::new(reader), writer)
}

/// Reading side: one header, then one body, repeated.
pub struct ConnReader {
    reader: BufReader<BoxedReader>,
    codec: Arc<dyn Codec>,
    max_frame_size: usize,
}

impl ConnReader {
    /// Bind a codec to the read half.
    #[must_use]
    pub fn new(reader: BufReader<BoxedReader>, codec: Arc<dyn Codec>, max_frame_size: usize) -> Self {
        Self {
            reader,
            codec,
            max_frame_size,
        }
    }

    /// Codec in use.
    #[must_use]
    pub fn codec_type(&self) -> CodecType {
        self.codec.codec_type()
    }

    /// Read the next header.
    pub async fn read_header(&mut self) -> Result<Header> {
        let payload = read_frame(&mut self.reader, self.max_frame_size).await?;
        self.codec.decode_header(&payload)
    }

    /// Read the body that follows a header.
    ///
    /// With no target the body is read and dropped, keeping the stream in
    /// step for the next header. A decode failure is returned as
    /// [`Error::Decode`] after the whole frame has been consumed, so the
    /// connection stays usable.
    pub async fn read_body(&mut self, target: Option<&mut dyn DecodeTarget>) -> Result<()> {
        let payload = read_frame(&mut self.reader, self.max_frame_size).await?;
        match target {
            Some(target) => self.codec.decode_body(&payload, target),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ConnReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnReader")
            .field("codec", &self.codec.codec_type())
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

/// Writing side: header and body go out as one unit.
pub struct ConnWriter {
    writer: BoxedWriter,
    codec: Arc<dyn Codec>,
    max_frame_size: usize,
    buf: BytesMut,
    closed: bool,
    /// Set while a frame is partly on the wire
    in_flight: bool,
}

impl ConnWriter {
    /// Bind a codec to the write half.
    #[must_use]
    pub fn new(writer: BoxedWriter, codec: Arc<dyn Codec>, max_frame_size: usize) -> Self {
        Self {
            writer,
            codec,
            max_frame_size,
            buf: BytesMut::new(),
            closed: false,
            in_flight: false,
        }
    }

    /// Whether the write half has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write one header and its body.
    ///
    /// Both are encoded before anything reaches the stream. Any failure
    /// flushes what is buffered and shuts the write half down, so a peer
    /// never waits on a half-written frame.
    pub fn write<'a>(
        &'a mut self,
        header: &Header,
        body: &dyn erased_serde::Serialize,
    ) -> impl Future<Output = Result<()>> + Send + use<'a> {
        let staged = self.stage(header, body);
        self.send_staged(staged)
    }

    /// Encode one header and its body into the outgoing buffer.
    ///
    /// Nothing reaches the stream until [`ConnWriter::send_staged`].
    pub fn stage(&mut self, header: &Header, body: &dyn erased_serde::Serialize) -> Result<()> {
        if self.closed || self.in_flight {
            return Err(Error::Shutdown);
        }
        self.buf.clear();
        let header_payload = self.codec.encode_header(header)?;
        encode_frame(&header_payload, self.max_frame_size, &mut self.buf)?;
        let body_payload = self.codec.encode_body(body)?;
        encode_frame(&body_payload, self.max_frame_size, &mut self.buf)?;
        Ok(())
    }

    /// Send what [`ConnWriter::stage`] produced.
    ///
    /// If an earlier send was dropped partway through a frame, the stream is
    /// out of step: the connection is shut down and this returns
    /// [`Error::Shutdown`].
    pub async fn send_staged(&mut self, staged: Result<()>) -> Result<()> {
        if self.in_flight {
            warn!("previous write was interrupted mid-frame, closing connection");
            self.in_flight = false;
            self.close().await;
            return Err(Error::Shutdown);
        }

        let result = match staged {
            Ok(()) => {
                self.in_flight = true;
                let written = write_frame(&mut self.writer, &self.buf).await;
                self.in_flight = false;
                written
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            if !self.closed {
                warn!(error = %err, "write failed, closing connection");
                self.close().await;
            }
        }
        result
    }

    /// Flush and shut down the write half. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer.flush().await;
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = %err, "shutdown of write half failed");
        }
    }
}

impl fmt::Debug for ConnWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnWriter")
            .field("codec", &self.codec.codec_type())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
