//! Wire-level building blocks
//!
//! This module provides the header envelope, the negotiation option, the
//! codec contract with its built-in implementations, and the frame format
//! every codec-encoded value travels in.

mod codec;
mod codecs;
mod error;
mod frame;
mod header;
pub(crate) mod metrics;
mod option;

pub use codec::{Codec, CodecRegistry, CodecType, DecodeTarget, NewCodecFn};
pub use codecs::{BincodeCodec, JsonCodec};
pub use error::{Error, Result};
pub use frame::{decode_frame, encode_frame, read_frame, write_frame};
pub use header::{Header, Invalid};
pub use metrics::{MetricsSnapshot, snapshot as metrics_snapshot};
pub use option::{Options, read_options, write_options};

/// Negotiation magic number shared by both ends of a connection.
pub const MAGIC_NUMBER: u32 = 0x003b_ef5c;

/// Maximum encoded size of a single header or body (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of the JSON negotiation line.
pub const MAX_OPTION_SIZE: usize = 4 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_SIZE: usize = 4;

/// Checksum size in bytes.
pub const CHECKSUM_SIZE: usize = 8;

/// Smallest possible encoded frame (empty payload).
pub const MIN_FRAME_SIZE: usize = LENGTH_SIZE + CHECKSUM_SIZE;
