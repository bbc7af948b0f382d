//! Server: accept loop and per-connection dispatcher.
//!
//! Lifecycle:
//! 1. Build a [`Server`] and register services (Created)
//! 2. [`Server::start`] binds and spawns the accept loop (Listening)
//! 3. Each accepted connection gets its own task that reads one request
//!    frame, dispatches it, writes the response and repeats (Serving)
//! 4. [`ServerHandle::shutdown`] stops accepting and aborts open
//!    connections and running oneway calls (Closed)
//!
//! A failed request never ends the connection: routing, codec and business
//! errors are reported in the response's error text. Only framing failures
//! (EOF, I/O errors, oversized frames) close it.
//!
//! # Example
//!
//! ```ignore
//! use microrpc::handler::ServiceDefinition;
//! use microrpc::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let echo = ServiceDefinition::new("echo")
//!         .method("Upper", |_ctx, s: String| async move { Ok(s.to_uppercase()) });
//!
//!     let handle = Server::builder().service(echo).build()?.start("127.0.0.1:8081").await?;
//!     handle.join().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::codec::{BodyCodec, Codecs};
use crate::context::CallContext;
use crate::error::{RpcError, Result};
use crate::handler::{ServiceDefinition, ServiceRegistry};
use crate::protocol::{FixedHeader, Request, Response, DEFAULT_MAX_MESSAGE_SIZE};
use crate::transport::{read_frame, write_frame};

/// Default timeout for writing one response frame.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Serializers and compressors the server understands.
    pub codecs: Codecs,
    /// Bound on writing one response frame.
    pub io_timeout: Duration,
    /// Close connections that send nothing for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Largest request frame accepted.
    pub max_message_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            codecs: Codecs::default(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            idle_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Builder for a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    services: Vec<ServiceDefinition>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codecs(mut self, codecs: Codecs) -> Self {
        self.config.codecs = codecs;
        self
    }

    /// Response write timeout.
    ///
    /// Default: 30 seconds
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    /// Close connections idle for longer than `timeout`.
    ///
    /// Default: never
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Largest request accepted.
    ///
    /// Default: 16 MiB
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Add a service. A later service with the same name replaces it.
    pub fn service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    /// Build the server; invalid service definitions are reported here.
    pub fn build(self) -> Result<Server> {
        let mut server = Server::new(self.config);
        for service in self.services {
            server.register_service(service)?;
        }
        Ok(server)
    }
}

/// An RPC server that has not started listening yet.
pub struct Server {
    config: ServerConfig,
    registry: ServiceRegistry,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: ServiceRegistry::new(),
        }
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Register a service, replacing any service with the same name.
    pub fn register_service(&mut self, service: ServiceDefinition) -> Result<()> {
        let name = service.name().to_string();
        let methods = service.method_names().len();
        if self.registry.register(service)?.is_some() {
            tracing::warn!(service = %name, "replaced previously registered service");
        }
        tracing::debug!(service = %name, methods, "service registered");
        Ok(())
    }

    #[inline]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Bind `addr` and spawn the accept loop.
    pub async fn start(self, addr: impl ToSocketAddrs) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tracing::info!(addr = %local_addr, services = self.registry.len(), "server listening");

        let dispatcher = Arc::new(Dispatcher::new(self.config, self.registry));
        let join = tokio::spawn(accept_loop(listener, dispatcher, async move {
            // A dropped handle detaches the server instead of stopping it.
            if shutdown_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        }));

        Ok(ServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            join,
        })
    }

    /// Serve connections from `listener` on the current task until an error.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let dispatcher = Arc::new(Dispatcher::new(self.config, self.registry));
        accept_loop(listener, dispatcher, std::future::pending()).await
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("services", &self.registry.service_names())
            .finish()
    }
}

/// Handle to a listening server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// The bound address (useful with port 0).
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close open connections and wait for the loop to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the accept loop to exit.
    pub async fn join(self) -> Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(RpcError::Io(std::io::Error::other(e))),
        }
    }
}

/// Routing state shared by every connection task.
struct Dispatcher {
    config: ServerConfig,
    registry: ServiceRegistry,
    /// Oneway calls still running; aborted on shutdown.
    oneway: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    fn new(config: ServerConfig, registry: ServiceRegistry) -> Self {
        Self {
            config,
            registry,
            oneway: Mutex::new(JoinSet::new()),
        }
    }

    fn spawn_oneway(self: &Arc<Self>, ctx: CallContext, req: Request) {
        let this = self.clone();
        let mut tasks = self.oneway.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(e) = this.call(ctx, &req).await {
                tracing::debug!(
                    request_id = req.request_id,
                    service = %req.service_name,
                    method = %req.method_name,
                    error = %e,
                    "oneway call failed"
                );
            }
        });
    }

    /// Abort oneway calls that are still running and wait for them to unwind.
    async fn shutdown_oneway(&self) {
        let mut tasks = std::mem::take(&mut *self.oneway.lock());
        if !tasks.is_empty() {
            tracing::debug!(running = tasks.len(), "aborting oneway calls");
        }
        tasks.shutdown().await;
    }

    /// Decode and dispatch one frame. `None` means nothing is written back.
    async fn handle_frame(self: &Arc<Self>, frame: &[u8]) -> Option<Response> {
        let req = match Request::decode(frame) {
            Ok(req) => req,
            Err(e) => {
                // The fixed header already passed framing; answer on its request ID.
                let header = FixedHeader::decode(frame)?;
                tracing::debug!(request_id = header.request_id, error = %e, "undecodable request");
                return Some(Response {
                    request_id: header.request_id,
                    version: header.version,
                    compressor: header.compressor,
                    serializer: header.serializer,
                    error: e.to_string(),
                    data: Bytes::new(),
                });
            }
        };

        let ctx = CallContext::from_request(&req);

        if req.is_oneway() {
            self.spawn_oneway(ctx, req);
            return None;
        }

        let mut resp = Response::for_request(&req);
        match self.call(ctx, &req).await {
            Ok(data) => resp.data = data,
            Err(e) => {
                tracing::debug!(
                    request_id = req.request_id,
                    service = %req.service_name,
                    method = %req.method_name,
                    error = %e,
                    "call failed"
                );
                resp.error = e.to_string();
            }
        }
        Some(resp)
    }

    /// Route, then decode the argument, run the handler under the caller's
    /// deadline and encode its result with the request's codecs.
    async fn call(&self, ctx: CallContext, req: &Request) -> Result<Bytes> {
        let handler = self.registry.lookup(&req.service_name, &req.method_name)?;
        let body = BodyCodec::new(self.config.codecs.clone(), req.serializer, req.compressor);

        let remaining = ctx.remaining();
        let fut = handler.call(ctx, body, &req.data);
        match remaining {
            Some(budget) => tokio::time::timeout(budget, fut)
                .await
                .map_err(|_| RpcError::DeadlineExceeded)?,
            None => fut.await,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    connections.spawn(serve_connection(stream, peer, dispatcher.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    tracing::info!(open = connections.len(), "server shutting down");
    connections.shutdown().await;
    dispatcher.shutdown_oneway().await;
    Ok(())
}

async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, dispatcher: Arc<Dispatcher>) {
    tracing::debug!(%peer, "connection accepted");
    let config = &dispatcher.config;

    loop {
        let read = read_frame(&mut stream, config.max_message_size);
        let frame = match config.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, read).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(%peer, "closing idle connection");
                    return;
                }
            },
            None => read.await,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(RpcError::ConnectionClosed) => {
                tracing::debug!(%peer, "connection closed by peer");
                return;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping connection");
                return;
            }
        };

        let Some(resp) = dispatcher.handle_frame(&frame).await else {
            continue;
        };

        let encoded = resp.encode();
        match tokio::time::timeout(config.io_timeout, write_frame(&mut stream, &encoded)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "failed to write response");
                return;
            }
            Err(_) => {
                tracing::warn!(%peer, "response write timed out");
                return;
            }
        }
    }
}
