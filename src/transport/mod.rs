//! Transport module - framed TCP I/O and connection pooling.
//!
//! - [`framing`] reads and writes one complete message at a time
//! - [`pool`] hands out reusable connections, one request/response cycle per checkout

pub mod framing;
pub mod pool;

pub use framing::{read_frame, write_frame};
pub use pool::{CheckoutPolicy, ConnectionFactory, ConnectionPool, PoolConfig, PooledConnection};
