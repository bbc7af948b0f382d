//! Protocol module - wire format and message encoding.
//!
//! This module implements the binary message format:
//! - 15-byte fixed header encoding/decoding
//! - `Request`/`Response` with their variable header sections

mod message;
mod wire_format;

pub use message::{Request, Response};
pub use wire_format::{
    contains_separator, FixedHeader, DEFAULT_MAX_MESSAGE_SIZE, FIELD_SEPARATOR,
    FIXED_HEADER_SIZE, KV_SEPARATOR, META_DEADLINE, META_ONEWAY, PROTOCOL_VERSION,
};
