//! Built-in codecs
//!
//! `BincodeCodec` is compact and the default; `JsonCodec` is readable on the
//! wire and handy for debugging.

use std::sync::Arc;

use bincode::Options;
use serde::de::{DeserializeSeed, Error as _};

use super::{Codec, CodecType, DecodeTarget, Error, Header, Result};

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Binary codec backed by `bincode`
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    /// Registry constructor.
    #[must_use]
    pub fn new_codec() -> Arc<dyn Codec> {
        Arc::new(Self)
    }
}

impl Codec for BincodeCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::bincode()
    }

    fn encode_header(&self, header: &Header) -> Result<Vec<u8>> {
        bincode_options()
            .serialize(header)
            .map_err(|e| Error::Encode(format!("bincode header: {e}")))
    }

    fn decode_header(&self, payload: &[u8]) -> Result<Header> {
        bincode_options()
            .deserialize(payload)
            .map_err(|e| Error::Decode(format!("bincode header: {e}")))
    }

    fn encode_body(&self, body: &dyn erased_serde::Serialize) -> Result<Vec<u8>> {
        bincode_options()
            .serialize(body)
            .map_err(|e| Error::Encode(format!("bincode body: {e}")))
    }

    fn decode_body(&self, payload: &[u8], target: &mut dyn DecodeTarget) -> Result<()> {
        // Going through the options rejects trailing bytes.
        bincode_options()
            .deserialize_seed(IntoTarget(target), payload)
            .map_err(|e| Error::Decode(format!("bincode body: {e}")))
    }
}

struct IntoTarget<'a>(&'a mut dyn DecodeTarget);

impl<'de> DeserializeSeed<'de> for IntoTarget<'_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let mut erased = <dyn erased_serde::Deserializer>::erase(deserializer);
        self.0.decode(&mut erased).map_err(D::Error::custom)
    }
}

/// Text codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Registry constructor.
    #[must_use]
    pub fn new_codec() -> Arc<dyn Codec> {
        Arc::new(Self)
    }
}

impl Codec for JsonCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::json()
    }

    fn encode_header(&self, header: &Header) -> Result<Vec<u8>> {
        serde_json::to_vec(header).map_err(|e| Error::Encode(format!("json header: {e}")))
    }

    fn decode_header(&self, payload: &[u8]) -> Result<Header> {
        serde_json::from_slice(payload).map_err(|e| Error::Decode(format!("json header: {e}")))
    }

    fn encode_body(&self, body: &dyn erased_serde::Serialize) -> Result<Vec<u8>> {
        serde_json::to_vec(body).map_err(|e| Error::Encode(format!("json body: {e}")))
    }

    fn decode_body(&self, payload: &[u8], target: &mut dyn DecodeTarget) -> Result<()> {
        let mut de = serde_json::Deserializer::from_slice(payload);
        target.decode(&mut <dyn erased_serde::Deserializer>::erase(&mut de))?;
        de.end()
            .map_err(|e| Error::Decode(format!("json body: {e}")))
    }
}
