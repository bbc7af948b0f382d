//! # microrpc
//!
//! Minimal RPC framework over TCP.
//!
//! ## Architecture
//!
//! - **Wire protocol**: 15-byte big-endian fixed header, a variable header
//!   (service, method, meta) and a serialized, compressed body
//! - **Client**: typed stubs ([`rpc_client!`]) whose fields send requests
//!   over a bounded pool of connections, one request in flight per connection
//! - **Server**: one task per connection, dispatching decoded requests to
//!   registered [`ServiceDefinition`](handler::ServiceDefinition)s
//!
//! Deadlines and oneway calls travel as reserved request meta
//! (`deadline`, `one-way`).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use microrpc::handler::ServiceDefinition;
//! use microrpc::{init_client_proxy, rpc_client, CallContext, Client, Server};
//!
//! rpc_client! {
//!     pub struct EchoClient for "echo" {
//!         pub upper: "Upper" => fn(String) -> String,
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let echo = ServiceDefinition::new("echo")
//!         .method("Upper", |_ctx, s: String| async move { Ok(s.to_uppercase()) });
//!     let server = Server::builder().service(echo).build()?.start("127.0.0.1:0").await?;
//!
//!     let client = Arc::new(Client::builder(server.local_addr().to_string()).build().await?);
//!     let stub: EchoClient = init_client_proxy(client)?;
//!
//!     let out = stub.upper.call(&CallContext::new(), &"hi".to_string()).await?;
//!     assert_eq!(out, "HI");
//!
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod transport;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use context::CallContext;
pub use error::{BoxError, Result, RpcError};
pub use proxy::{init_client_proxy, init_client_proxy_as, Proxy, RemoteMethod, ServiceProxy};
pub use server::{Server, ServerBuilder, ServerConfig, ServerHandle};
