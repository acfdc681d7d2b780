//! wirecall error types

use thiserror::Error;

/// Errors produced by the protocol, the client and the server
#[derive(Error, Debug)]
pub enum Error {
    /// IO error on the underlying connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client was closed or its connection failed
    #[error("connection is shut down")]
    Shutdown,

    /// The connection failed while the call was pending
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Negotiation carried the wrong magic number
    #[error("invalid magic number: expected 0x3bef5c, got {found:#x}")]
    InvalidMagic {
        /// Found magic number
        found: u32,
    },

    /// Negotiation named a codec nobody registered
    #[error("invalid codec type {0}")]
    UnknownCodec(String),

    /// Negotiation line could not be parsed
    #[error("malformed options: {0}")]
    MalformedOptions(String),

    /// Encoding a header or body failed
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding a header or body failed
    #[error("decode error: {0}")]
    Decode(String),

    /// Frame checksum mismatch
    #[error("checksum mismatch: expected {expected:#x}, got {found:#x}")]
    ChecksumMismatch {
        /// Expected checksum
        expected: u64,
        /// Found checksum
        found: u64,
    },

    /// Frame payload too large
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Buffer too small to hold a frame
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Needed size
        needed: usize,
        /// Actual size
        got: usize,
    },

    /// Request named something other than `Service.Method`
    #[error("service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// No service registered under the requested name
    #[error("can't find service: {0}")]
    UnknownService(String),

    /// Service exists but has no such method
    #[error("can't find method: {0}")]
    UnknownMethod(String),

    /// A service with this name is already registered
    #[error("service already defined: {0}")]
    DuplicateService(String),

    /// Service name is not a usable identifier
    #[error("{0} is not a valid service name")]
    InvalidServiceName(String),

    /// Error text returned by the remote side
    #[error("{0}")]
    Remote(String),
}

impl Error {
    /// Whether this error leaves the connection unusable.
    ///
    /// Transport and protocol failures are fatal; application failures and
    /// per-call decode failures only affect the request they belong to.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Shutdown
                | Self::ConnectionLost(_)
                | Self::InvalidMagic { .. }
                | Self::UnknownCodec(_)
                | Self::MalformedOptions(_)
                | Self::ChecksumMismatch { .. }
                | Self::FrameTooLarge { .. }
                | Self::BufferTooSmall { .. }
        )
    }

    /// Whether this is a clean end of stream rather than a real failure.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

impl From<erased_serde::Error> for Error {
    fn from(err: erased_serde::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
