//! JSON serializer using `serde_json`.

use serde_json::Value;

use super::{Format, Serializer, SERIALIZER_JSON};
use crate::error::Result;

/// Textual structured-data serializer, registered by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn code(&self) -> u8 {
        SERIALIZER_JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn format(&self) -> Format {
        Format::Json
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}
