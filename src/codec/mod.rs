//! Codec module - pluggable body serializers and compressors.
//!
//! Both plugin kinds are identified on the wire by a one-byte code:
//!
//! | Kind | Code | Plugin |
//! |------|------|--------|
//! | serializer | 1 | [`JsonSerializer`] |
//! | serializer | 2 | [`MsgPackSerializer`] |
//! | compressor | 0 | [`IdentityCompressor`] |
//! | compressor | 1 | [`GzipCompressor`] |
//!
//! A body is always `serialize → compress` on the way out and
//! `uncompress → deserialize` on the way in. The built-in serializers
//! report a [`Format`] so typed bodies go straight through `serde_json` or
//! `rmp-serde`; other plugins exchange `serde_json::Value`, which keeps the
//! trait object-safe.
//!
//! # Example
//!
//! ```
//! use microrpc::codec::{Codecs, COMPRESSOR_GZIP, SERIALIZER_MSGPACK};
//!
//! let codecs = Codecs::default();
//! let body = codecs
//!     .encode_body(SERIALIZER_MSGPACK, COMPRESSOR_GZIP, &vec![1, 2, 3])
//!     .unwrap();
//! let back: Vec<i32> = codecs
//!     .decode_body(SERIALIZER_MSGPACK, COMPRESSOR_GZIP, &body)
//!     .unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

mod compress;
mod json;
mod msgpack;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{RpcError, Result};

pub use compress::{GzipCompressor, IdentityCompressor};
pub use json::JsonSerializer;
pub use msgpack::MsgPackSerializer;

/// Wire code of [`JsonSerializer`].
pub const SERIALIZER_JSON: u8 = 1;
/// Wire code of [`MsgPackSerializer`].
pub const SERIALIZER_MSGPACK: u8 = 2;
/// Wire code of [`IdentityCompressor`].
pub const COMPRESSOR_NONE: u8 = 0;
/// Wire code of [`GzipCompressor`].
pub const COMPRESSOR_GZIP: u8 = 1;

/// How [`Codecs`] drives a serializer for typed bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Typed values go directly through `serde_json`.
    Json,
    /// Typed values go directly through `rmp-serde`, structs as maps.
    MsgPack,
    /// Typed values pass through [`Value`] and the plugin's `encode`/`decode`.
    Dynamic,
}

/// Body serializer plugin.
pub trait Serializer: Send + Sync + 'static {
    /// One-byte wire code.
    fn code(&self) -> u8;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Typed encoding path. Plugins outside this crate keep the default.
    fn format(&self) -> Format {
        Format::Dynamic
    }

    /// Serialize a value to bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value.
    fn decode(&self, data: &[u8]) -> Result<Value>;
}

/// Body compressor plugin.
pub trait Compressor: Send + Sync + 'static {
    /// One-byte wire code.
    fn code(&self) -> u8;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Compress serialized bytes.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Reverse of [`Compressor::compress`].
    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Serializer and compressor tables, looked up by code on every message.
///
/// Passed explicitly into client and server configuration; there is no
/// process-wide registry. Cloning shares the tables.
#[derive(Clone)]
pub struct Codecs {
    serializers: Arc<HashMap<u8, Arc<dyn Serializer>>>,
    compressors: Arc<HashMap<u8, Arc<dyn Compressor>>>,
}

impl Codecs {
    /// Default tables: JSON, MsgPack, identity and gzip.
    pub fn new() -> Self {
        Self::empty()
            .with_serializer(JsonSerializer)
            .with_serializer(MsgPackSerializer)
            .with_compressor(IdentityCompressor)
            .with_compressor(GzipCompressor::default())
    }

    /// Tables with nothing registered.
    pub fn empty() -> Self {
        Self {
            serializers: Arc::new(HashMap::new()),
            compressors: Arc::new(HashMap::new()),
        }
    }

    /// Register a serializer, replacing any previous one with the same code.
    pub fn with_serializer(mut self, serializer: impl Serializer) -> Self {
        Arc::make_mut(&mut self.serializers).insert(serializer.code(), Arc::new(serializer));
        self
    }

    /// Register a compressor, replacing any previous one with the same code.
    pub fn with_compressor(mut self, compressor: impl Compressor) -> Self {
        Arc::make_mut(&mut self.compressors).insert(compressor.code(), Arc::new(compressor));
        self
    }

    /// Look up a serializer by code.
    pub fn serializer(&self, code: u8) -> Result<&dyn Serializer> {
        self.serializers
            .get(&code)
            .map(|s| s.as_ref())
            .ok_or(RpcError::UnsupportedSerializer(code))
    }

    /// Look up a compressor by code.
    pub fn compressor(&self, code: u8) -> Result<&dyn Compressor> {
        self.compressors
            .get(&code)
            .map(|c| c.as_ref())
            .ok_or(RpcError::UnsupportedCompressor(code))
    }

    /// Fail with `Unsupported*` unless both codes are registered.
    pub fn check(&self, serializer: u8, compressor: u8) -> Result<()> {
        self.serializer(serializer)?;
        self.compressor(compressor)?;
        Ok(())
    }

    /// `serialize → compress` a value.
    ///
    /// A value that serializes like `()` (a unit return, `None`) becomes an
    /// empty body.
    pub fn encode_body<T: Serialize + ?Sized>(
        &self,
        serializer: u8,
        compressor: u8,
        value: &T,
    ) -> Result<Bytes> {
        let serializer = self.serializer(serializer)?;
        let compressor = self.compressor(compressor)?;
        let raw = serialize(serializer, value)?;
        if raw == serialize(serializer, &())? {
            return Ok(Bytes::new());
        }
        Ok(Bytes::from(compressor.compress(&raw)?))
    }

    /// `uncompress → deserialize` a body. An empty body decodes like `null`.
    pub fn decode_body<T: DeserializeOwned>(
        &self,
        serializer: u8,
        compressor: u8,
        data: &[u8],
    ) -> Result<T> {
        let serializer = self.serializer(serializer)?;
        let compressor = self.compressor(compressor)?;
        if data.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        let raw = compressor.uncompress(data)?;
        deserialize(serializer, &raw)
    }
}

fn serialize<T: Serialize + ?Sized>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    match serializer.format() {
        Format::Json => Ok(serde_json::to_vec(value)?),
        Format::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
        Format::Dynamic => serializer.encode(&serde_json::to_value(value)?),
    }
}

fn deserialize<T: DeserializeOwned>(serializer: &dyn Serializer, data: &[u8]) -> Result<T> {
    match serializer.format() {
        Format::Json => Ok(serde_json::from_slice(data)?),
        Format::MsgPack => Ok(rmp_serde::from_slice(data)?),
        Format::Dynamic => Ok(serde_json::from_value(serializer.decode(data)?)?),
    }
}

/// The serializer and compressor chosen for one message, with the tables to
/// resolve them.
#[derive(Clone, Debug)]
pub struct BodyCodec {
    codecs: Codecs,
    serializer: u8,
    compressor: u8,
}

impl BodyCodec {
    pub fn new(codecs: Codecs, serializer: u8, compressor: u8) -> Self {
        Self {
            codecs,
            serializer,
            compressor,
        }
    }

    #[inline]
    pub fn serializer(&self) -> u8 {
        self.serializer
    }

    #[inline]
    pub fn compressor(&self) -> u8 {
        self.compressor
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        self.codecs.encode_body(self.serializer, self.compressor, value)
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        self.codecs.decode_body(self.serializer, self.compressor, data)
    }
}

impl Default for Codecs {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut serializers: Vec<_> = self
            .serializers
            .iter()
            .map(|(code, s)| (*code, s.name()))
            .collect();
        serializers.sort_unstable();
        let mut compressors: Vec<_> = self
            .compressors
            .iter()
            .map(|(code, c)| (*code, c.name()))
            .collect();
        compressors.sort_unstable();

        f.debug_struct("Codecs")
            .field("serializers", &serializers)
            .field("compressors", &compressors)
            .finish()
    }
}
