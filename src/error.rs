//! Error types for microrpc.

use thiserror::Error;

/// Boxed error returned by business handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for all RPC operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Invalid proxy target, bad service/method name, reserved meta key, etc.
    #[error("configuration error: {0}")]
    Config(String),

    /// No serializer registered for the code.
    #[error("unsupported codec: serializer {0}")]
    UnsupportedSerializer(u8),

    /// No compressor registered for the code.
    #[error("unsupported codec: compressor {0}")]
    UnsupportedCompressor(u8),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream at a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection-level read/write timeout.
    #[error("I/O timeout")]
    Timeout,

    /// No connection became available within the checkout policy.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool was closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// Malformed frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame length field larger than the configured maximum.
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: u64, max: u32 },

    /// No service registered under the name.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Service exists but has no such method.
    #[error("method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Other serializer/compressor failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Error returned by a registered business method (server side).
    #[error("{0}")]
    Business(String),

    /// Non-empty `Response.Error` received from the server (client side).
    #[error("remote error: {0}")]
    Remote(String),

    /// The call deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Oneway request written; no response is expected.
    #[error("oneway request, no response expected")]
    Oneway,
}

impl RpcError {
    /// Whether the error leaves the connection in an unknown state.
    ///
    /// Connections that saw one of these are closed instead of returned to the pool.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_)
                | RpcError::ConnectionClosed
                | RpcError::Timeout
                | RpcError::Protocol(_)
                | RpcError::MessageTooLarge { .. }
                | RpcError::DeadlineExceeded
        )
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_not_found_message() {
        let err = RpcError::ServiceNotFound("ghost".to_string());
        assert_eq!(err.to_string(), "service not found: ghost");
    }

    #[test]
    fn test_business_error_is_verbatim() {
        let err = RpcError::Business("user 42 is banned".to_string());
        assert_eq!(err.to_string(), "user 42 is banned");
    }

    #[test]
    fn test_transport_classification() {
        assert!(RpcError::Timeout.is_transport());
        assert!(RpcError::ConnectionClosed.is_transport());
        assert!(RpcError::Protocol("bad".into()).is_transport());
        assert!(!RpcError::Remote("boom".into()).is_transport());
        assert!(!RpcError::Oneway.is_transport());
        assert!(!RpcError::PoolExhausted.is_transport());
    }
}
