//! Wire format constants and the fixed header.
//!
//! Every message starts with a 15-byte fixed header:
//! ```text
//! ┌───────────┬───────────┬───────────┬─────────┬────────────┬────────────┐
//! │ HeadLength│ BodyLength│ RequestID │ Version │ Compressor │ Serializer │
//! │ 4 bytes   │ 4 bytes   │ 4 bytes   │ 1 byte  │ 1 byte     │ 1 byte     │
//! │ uint32 BE │ uint32 BE │ uint32 BE │         │            │            │
//! └───────────┴───────────┴───────────┴─────────┴────────────┴────────────┘
//! ```
//!
//! `HeadLength` covers the fixed header plus the variable header section,
//! `BodyLength` covers the payload that follows it.

use crate::error::{RpcError, Result};

/// Fixed header size in bytes (exactly 15).
pub const FIXED_HEADER_SIZE: usize = 15;

/// Protocol version stamped into every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default upper bound for `HeadLength + BodyLength` (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Terminates the service name, the method name and every meta entry.
pub const FIELD_SEPARATOR: u8 = b'\n';

/// Separates a meta key from its value.
pub const KV_SEPARATOR: u8 = b'\r';

/// Reserved meta key carrying the absolute deadline in epoch milliseconds.
pub const META_DEADLINE: &str = "deadline";

/// Reserved meta key marking a oneway request (`"true"` or absent).
pub const META_ONEWAY: &str = "one-way";

/// Check whether a string contains a reserved separator byte.
#[inline]
pub fn contains_separator(s: &str) -> bool {
    s.bytes().any(|b| b == FIELD_SEPARATOR || b == KV_SEPARATOR)
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Fixed header plus variable header length.
    pub head_length: u32,
    /// Payload length.
    pub body_length: u32,
    /// Request identifier, echoed back in the response.
    pub request_id: u32,
    /// Protocol version.
    pub version: u8,
    /// Compressor code applied to the body.
    pub compressor: u8,
    /// Serializer code applied to the body.
    pub serializer: u8,
}

impl FixedHeader {
    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use microrpc::protocol::FixedHeader;
    ///
    /// let header = FixedHeader {
    ///     head_length: 20,
    ///     body_length: 5,
    ///     request_id: 7,
    ///     version: 1,
    ///     compressor: 0,
    ///     serializer: 1,
    /// };
    /// assert_eq!(header.encode().len(), 15);
    /// ```
    pub fn encode(&self) -> [u8; FIXED_HEADER_SIZE] {
        let mut buf = [0u8; FIXED_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `FIXED_HEADER_SIZE` (15 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.head_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.body_length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.request_id.to_be_bytes());
        buf[12] = self.version;
        buf[13] = self.compressor;
        buf[14] = self.serializer;
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FIXED_HEADER_SIZE {
            return None;
        }
        Some(Self {
            head_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            body_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            request_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            version: buf[12],
            compressor: buf[13],
            serializer: buf[14],
        })
    }

    /// Total encoded size of the message described by this header.
    #[inline]
    pub fn total_length(&self) -> u64 {
        self.head_length as u64 + self.body_length as u64
    }

    /// Validate the length fields.
    ///
    /// Checks:
    /// - `head_length` covers at least the fixed header
    /// - `head_length + body_length` doesn't exceed `max_message_size`
    pub fn validate(&self, max_message_size: u32) -> Result<()> {
        if (self.head_length as usize) < FIXED_HEADER_SIZE {
            return Err(RpcError::Protocol(format!(
                "head length {} shorter than fixed header",
                self.head_length
            )));
        }

        let total = self.total_length();
        if total > max_message_size as u64 {
            return Err(RpcError::MessageTooLarge {
                size: total,
                max: max_message_size,
            });
        }

        Ok(())
    }
}
