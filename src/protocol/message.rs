//! `Request` and `Response` messages and their binary encoding.
//!
//! Request variable header:
//! ```text
//! service \n method \n key1 \r value1 \n key2 \r value2 \n ...
//! ```
//! Response variable header: the raw UTF-8 error text.
//!
//! Head and body lengths are never stored on the structs; they are computed
//! from the fields at encode time so they always match the encoded bytes.

use std::collections::HashMap;

use bytes::Bytes;

use super::wire_format::{
    contains_separator, FixedHeader, FIELD_SEPARATOR, FIXED_HEADER_SIZE, KV_SEPARATOR,
    META_ONEWAY, PROTOCOL_VERSION,
};
use crate::error::{RpcError, Result};

/// An RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlates the response within one connection.
    pub request_id: u32,
    /// Protocol version.
    pub version: u8,
    /// Compressor code applied to `data`.
    pub compressor: u8,
    /// Serializer code applied to `data`.
    pub serializer: u8,
    /// Target service.
    pub service_name: String,
    /// Target method.
    pub method_name: String,
    /// Out-of-band directives (deadline, oneway, application meta).
    pub meta: HashMap<String, String>,
    /// Serialized, compressed argument.
    pub data: Bytes,
}

impl Request {
    /// Create a request for `service.method` with an empty body.
    pub fn new(service_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            version: PROTOCOL_VERSION,
            compressor: 0,
            serializer: 0,
            service_name: service_name.into(),
            method_name: method_name.into(),
            meta: HashMap::new(),
            data: Bytes::new(),
        }
    }

    /// `15 + service + 1 + method + 1 + Σ(key + 1 + value + 1)`.
    pub fn head_length(&self) -> u32 {
        let meta: usize = self.meta.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        (FIXED_HEADER_SIZE + self.service_name.len() + 1 + self.method_name.len() + 1 + meta)
            as u32
    }

    /// Length of `data`.
    #[inline]
    pub fn body_length(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the request carries `one-way: true`.
    pub fn is_oneway(&self) -> bool {
        self.meta
            .get(META_ONEWAY)
            .is_some_and(|v| v == "true")
    }

    /// Reject names and meta that contain reserved separator bytes.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() || contains_separator(&self.service_name) {
            return Err(RpcError::Config(format!(
                "invalid service name {:?}",
                self.service_name
            )));
        }
        if self.method_name.is_empty() || contains_separator(&self.method_name) {
            return Err(RpcError::Config(format!(
                "invalid method name {:?}",
                self.method_name
            )));
        }
        for (key, value) in &self.meta {
            if contains_separator(key) || contains_separator(value) {
                return Err(RpcError::Config(format!("invalid meta entry {:?}", key)));
            }
        }
        Ok(())
    }

    /// Fixed header derived from the current fields.
    pub fn fixed_header(&self) -> FixedHeader {
        FixedHeader {
            head_length: self.head_length(),
            body_length: self.body_length(),
            request_id: self.request_id,
            version: self.version,
            compressor: self.compressor,
            serializer: self.serializer,
        }
    }

    /// Encode into a single contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.fixed_header();
        let mut buf = Vec::with_capacity(header.total_length() as usize);
        buf.extend_from_slice(&header.encode());

        buf.extend_from_slice(self.service_name.as_bytes());
        buf.push(FIELD_SEPARATOR);
        buf.extend_from_slice(self.method_name.as_bytes());
        buf.push(FIELD_SEPARATOR);
        for (key, value) in &self.meta {
            buf.extend_from_slice(key.as_bytes());
            buf.push(KV_SEPARATOR);
            buf.extend_from_slice(value.as_bytes());
            buf.push(FIELD_SEPARATOR);
        }

        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a complete frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = checked_header(buf)?;
        let head_end = header.head_length as usize;

        let mut rest = &buf[FIXED_HEADER_SIZE..head_end];
        let service_name = take_field(&mut rest, FIELD_SEPARATOR, "service name")?;
        let method_name = take_field(&mut rest, FIELD_SEPARATOR, "method name")?;

        let mut meta = HashMap::new();
        while !rest.is_empty() {
            let key = take_field(&mut rest, KV_SEPARATOR, "meta key")?;
            let value = take_field(&mut rest, FIELD_SEPARATOR, "meta value")?;
            meta.insert(key, value);
        }

        Ok(Self {
            request_id: header.request_id,
            version: header.version,
            compressor: header.compressor,
            serializer: header.serializer,
            service_name,
            method_name,
            meta,
            data: Bytes::copy_from_slice(&buf[head_end..]),
        })
    }
}

/// An RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Copied from the request.
    pub request_id: u32,
    /// Protocol version.
    pub version: u8,
    /// Compressor code applied to `data`.
    pub compressor: u8,
    /// Serializer code applied to `data`.
    pub serializer: u8,
    /// Business or protocol error text, empty on success.
    pub error: String,
    /// Serialized, compressed return value.
    pub data: Bytes,
}

impl Response {
    /// Empty response addressed to `req`, using its codec codes.
    pub fn for_request(req: &Request) -> Self {
        Self {
            request_id: req.request_id,
            version: req.version,
            compressor: req.compressor,
            serializer: req.serializer,
            error: String::new(),
            data: Bytes::new(),
        }
    }

    /// `15 + len(error)`.
    #[inline]
    pub fn head_length(&self) -> u32 {
        (FIXED_HEADER_SIZE + self.error.len()) as u32
    }

    /// Length of `data`.
    #[inline]
    pub fn body_length(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the response carries an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Fixed header derived from the current fields.
    pub fn fixed_header(&self) -> FixedHeader {
        FixedHeader {
            head_length: self.head_length(),
            body_length: self.body_length(),
            request_id: self.request_id,
            version: self.version,
            compressor: self.compressor,
            serializer: self.serializer,
        }
    }

    /// Encode into a single contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.fixed_header();
        let mut buf = Vec::with_capacity(header.total_length() as usize);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(self.error.as_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a complete frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = checked_header(buf)?;
        let head_end = header.head_length as usize;

        let error = std::str::from_utf8(&buf[FIXED_HEADER_SIZE..head_end])
            .map_err(|_| RpcError::Protocol("error text is not valid UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            request_id: header.request_id,
            version: header.version,
            compressor: header.compressor,
            serializer: header.serializer,
            error,
            data: Bytes::copy_from_slice(&buf[head_end..]),
        })
    }
}

/// Parse the fixed header and check the declared lengths against the buffer.
fn checked_header(buf: &[u8]) -> Result<FixedHeader> {
    let header = FixedHeader::decode(buf).ok_or_else(|| {
        RpcError::Protocol(format!("frame of {} bytes has no fixed header", buf.len()))
    })?;

    if (header.head_length as usize) < FIXED_HEADER_SIZE {
        return Err(RpcError::Protocol(format!(
            "head length {} shorter than fixed header",
            header.head_length
        )));
    }
    if header.total_length() != buf.len() as u64 {
        return Err(RpcError::Protocol(format!(
            "declared length {} does not match frame length {}",
            header.total_length(),
            buf.len()
        )));
    }

    Ok(header)
}

/// Split the next `sep`-terminated field off `rest`.
fn take_field(rest: &mut &[u8], sep: u8, what: &str) -> Result<String> {
    let pos = rest
        .iter()
        .position(|&b| b == sep)
        .ok_or_else(|| RpcError::Protocol(format!("missing separator after {}", what)))?;

    let field = std::str::from_utf8(&rest[..pos])
        .map_err(|_| RpcError::Protocol(format!("{} is not valid UTF-8", what)))?
        .to_string();

    *rest = &rest[pos + 1..];
    Ok(field)
}
