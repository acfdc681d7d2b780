//! Codec contract and registry
//!
//! A codec turns headers and bodies into frame payloads and back. Bodies
//! cross the codec boundary type-erased, so any codec can be stored behind
//! `Arc<dyn Codec>` and chosen at negotiation time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{BincodeCodec, Header, JsonCodec, Result};

/// Encoding identifier exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecType(String);

impl CodecType {
    /// Binary codec, the default
    pub const BINCODE: &'static str = "application/bincode";
    /// JSON codec
    pub const JSON: &'static str = "application/json";

    /// Create a codec identifier.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Binary codec identifier.
    #[must_use]
    pub fn bincode() -> Self {
        Self::new(Self::BINCODE)
    }

    /// JSON codec identifier.
    #[must_use]
    pub fn json() -> Self {
        Self::new(Self::JSON)
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (meaning "use the default").
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CodecType {
    fn default() -> Self {
        Self::bincode()
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Destination for a decoded body.
///
/// The caller picks the destination's shape from the header it has just
/// read; the codec writes the decoded value into it.
pub trait DecodeTarget: Send {
    /// Deserialize a value from `deserializer` and store it.
    fn decode(
        &mut self,
        deserializer: &mut dyn erased_serde::Deserializer<'_>,
    ) -> std::result::Result<(), erased_serde::Error>;
}

impl<T> DecodeTarget for Option<T>
where
    T: DeserializeOwned + Send,
{
    fn decode(
        &mut self,
        deserializer: &mut dyn erased_serde::Deserializer<'_>,
    ) -> std::result::Result<(), erased_serde::Error> {
        *self = Some(erased_serde::deserialize(deserializer)?);
        Ok(())
    }
}

/// Pluggable encoder/decoder for headers and bodies.
pub trait Codec: Send + Sync + 'static {
    /// Identifier this codec is registered under.
    fn codec_type(&self) -> CodecType;

    /// Encode a header into a frame payload.
    fn encode_header(&self, header: &Header) -> Result<Vec<u8>>;

    /// Decode a header from a frame payload.
    fn decode_header(&self, payload: &[u8]) -> Result<Header>;

    /// Encode a body into a frame payload.
    fn encode_body(&self, body: &dyn erased_serde::Serialize) -> Result<Vec<u8>>;

    /// Decode a body from a frame payload into `target`.
    fn decode_body(&self, payload: &[u8], target: &mut dyn DecodeTarget) -> Result<()>;
}

/// Codec constructor stored in the registry
pub type NewCodecFn = fn() -> Arc<dyn Codec>;

/// Maps codec identifiers to constructors.
///
/// `CodecRegistry::default()` knows the built-in bincode and JSON codecs.
#[derive(Clone)]
pub struct CodecRegistry {
    constructors: HashMap<CodecType, NewCodecFn>,
}

impl CodecRegistry {
    /// Create a registry with no codecs.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a constructor, replacing any previous one for the same type.
    pub fn register(&mut self, codec_type: CodecType, constructor: NewCodecFn) -> &mut Self {
        self.constructors.insert(codec_type, constructor);
        self
    }

    /// Whether a codec is registered under `codec_type`.
    #[must_use]
    pub fn contains(&self, codec_type: &CodecType) -> bool {
        self.constructors.contains_key(codec_type)
    }

    /// Construct the codec registered under `codec_type`.
    #[must_use]
    pub fn get(&self, codec_type: &CodecType) -> Option<Arc<dyn Codec>> {
        self.constructors.get(codec_type).map(|new_codec| new_codec())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(CodecType::bincode(), BincodeCodec::new_codec)
            .register(CodecType::json(), JsonCodec::new_codec);
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}
