//! MsgPack serializer using `rmp-serde`.
//!
//! Always encodes with `to_vec_named` so structs become maps keyed by field
//! name, the layout other MessagePack implementations expect. Typed bodies
//! skip [`Value`] entirely (see [`Format::MsgPack`]), so `bin` payloads,
//! integer map keys and non-finite floats survive; the `Value` methods below
//! only serve callers that work with dynamic values.

use serde_json::Value;

use super::{Format, Serializer, SERIALIZER_MSGPACK};
use crate::error::Result;

/// Compact binary serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn code(&self) -> u8 {
        SERIALIZER_MSGPACK
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn format(&self) -> Format {
        Format::MsgPack
    }

    #[inline]
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    fn decode(&self, data: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
