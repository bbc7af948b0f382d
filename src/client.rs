//! Client builder and request/response exchange.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring codecs, the
//! connection pool and timeouts. The [`Client`] implements [`Proxy`]: each
//! call checks out a pooled connection, writes one request frame and, unless
//! the call is oneway, reads exactly one response frame before returning the
//! connection to the pool.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use microrpc::codec::COMPRESSOR_GZIP;
//! use microrpc::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("127.0.0.1:8081")
//!         .compressor(COMPRESSOR_GZIP)
//!         .max_connections(8)
//!         .build()
//!         .await?;
//!
//!     let client = Arc::new(client);
//!     // init_client_proxy::<MyStub>(client.clone())?
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::codec::{Codecs, COMPRESSOR_NONE, SERIALIZER_JSON};
use crate::context::CallContext;
use crate::error::{RpcError, Result};
use crate::handler::BoxFuture;
use crate::protocol::{Request, Response, DEFAULT_MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::proxy::Proxy;
use crate::transport::{read_frame, write_frame, CheckoutPolicy, ConnectionPool, PoolConfig};

/// Default timeout for a single frame read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Serializer code for request bodies.
    pub serializer: u8,
    /// Compressor code for request bodies.
    pub compressor: u8,
    /// Available serializers and compressors.
    pub codecs: Codecs,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Bound on each frame write and on waiting for a response.
    pub io_timeout: Duration,
    /// Largest response frame accepted.
    pub max_message_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serializer: SERIALIZER_JSON,
            compressor: COMPRESSOR_NONE,
            codecs: Codecs::default(),
            pool: PoolConfig::default(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Builder for configuring and connecting a [`Client`].
pub struct ClientBuilder {
    addr: String,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: ClientConfig::default(),
        }
    }

    /// Serializer code used for requests.
    ///
    /// Default: JSON (1)
    pub fn serializer(mut self, code: u8) -> Self {
        self.config.serializer = code;
        self
    }

    /// Compressor code used for requests.
    ///
    /// Default: none (0)
    pub fn compressor(mut self, code: u8) -> Self {
        self.config.compressor = code;
        self
    }

    /// Replace the codec set (to add custom serializers or compressors).
    pub fn codecs(mut self, codecs: Codecs) -> Self {
        self.config.codecs = codecs;
        self
    }

    /// Replace the whole pool configuration.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Maximum number of pooled connections.
    ///
    /// Default: 16
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.pool.max_cap = n;
        self
    }

    /// Connections opened on connect.
    ///
    /// Default: 1
    pub fn min_idle(mut self, n: usize) -> Self {
        self.config.pool.min_idle = n;
        self
    }

    /// What to do when every connection is busy.
    ///
    /// Default: wait up to 3 seconds
    pub fn checkout(mut self, policy: CheckoutPolicy) -> Self {
        self.config.pool.checkout = policy;
        self
    }

    /// Per-frame I/O timeout.
    ///
    /// Default: 30 seconds
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    /// Largest response accepted.
    ///
    /// Default: 16 MiB
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Validate the configuration and open the initial connections.
    pub async fn build(self) -> Result<Client> {
        Client::connect(self.addr, self.config).await
    }
}

/// RPC client over a pool of TCP connections.
pub struct Client {
    addr: String,
    config: ClientConfig,
    pool: ConnectionPool<TcpStream>,
    next_request_id: AtomicU32,
    reaper: JoinHandle<()>,
}

impl Client {
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Connect to `addr`.
    ///
    /// Unknown serializer/compressor codes and invalid pool settings fail here,
    /// before any connection is opened.
    pub async fn connect(addr: impl Into<String>, config: ClientConfig) -> Result<Self> {
        let addr = addr.into();
        config.codecs.check(config.serializer, config.compressor)?;

        let pool = ConnectionPool::tcp(addr.clone(), config.pool.clone())?;
        pool.warm().await?;
        let reaper = pool.spawn_reaper(config.pool.idle_timeout);

        tracing::info!(
            addr = %addr,
            serializer = config.serializer,
            compressor = config.compressor,
            "client connected"
        );

        Ok(Self {
            addr,
            config,
            pool,
            next_request_id: AtomicU32::new(1),
            reaper,
        })
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The underlying pool, for stats.
    #[inline]
    pub fn pool(&self) -> &ConnectionPool<TcpStream> {
        &self.pool
    }

    /// Close the pool. Calls in flight finish; later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
        self.reaper.abort();
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn exchange(&self, ctx: &CallContext, mut req: Request) -> Result<Response> {
        req.request_id = self.next_request_id();
        req.version = PROTOCOL_VERSION;
        let request_id = req.request_id;
        let oneway = req.is_oneway();

        let frame = req.encode();
        if frame.len() as u64 > self.config.max_message_size as u64 {
            return Err(RpcError::MessageTooLarge {
                size: frame.len() as u64,
                max: self.config.max_message_size,
            });
        }

        let mut conn = self.pool.get().await?;

        match tokio::time::timeout(self.config.io_timeout, write_frame(&mut *conn, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RpcError::Timeout),
        }

        if oneway {
            conn.release();
            tracing::trace!(request_id, "oneway request written");
            return Err(RpcError::Oneway);
        }

        // The caller's deadline and the connection timeout both bound the wait.
        let (wait, deadline_bound) = match ctx.remaining() {
            Some(remaining) if remaining < self.config.io_timeout => (remaining, true),
            _ => (self.config.io_timeout, false),
        };

        let reply = match tokio::time::timeout(
            wait,
            read_frame(&mut *conn, self.config.max_message_size),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return Err(e),
            Err(_) if deadline_bound => return Err(RpcError::DeadlineExceeded),
            Err(_) => return Err(RpcError::Timeout),
        };

        let resp = Response::decode(&reply)?;
        if resp.request_id != request_id {
            return Err(RpcError::Protocol(format!(
                "response id {} does not match request id {}",
                resp.request_id, request_id
            )));
        }

        conn.release();
        Ok(resp)
    }
}

impl Proxy for Client {
    fn codecs(&self) -> &Codecs {
        &self.config.codecs
    }

    fn serializer(&self) -> u8 {
        self.config.serializer
    }

    fn compressor(&self) -> u8 {
        self.config.compressor
    }

    fn invoke<'a>(&'a self, ctx: &'a CallContext, req: Request) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let service = req.service_name.clone();
            let method = req.method_name.clone();

            let result = self.exchange(ctx, req).await;
            match &result {
                Ok(resp) if resp.is_error() => tracing::debug!(
                    %service, %method, error = %resp.error, "call returned error"
                ),
                Err(e) if e.is_transport() || matches!(e, RpcError::PoolExhausted) => {
                    tracing::warn!(%service, %method, error = %e, "call failed")
                }
                _ => {}
            }
            result
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("serializer", &self.config.serializer)
            .field("compressor", &self.config.compressor)
            .field("open_connections", &self.pool.open_count())
            .finish()
    }
}
