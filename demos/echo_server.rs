//! Echo server - serves the `echo` service on a TCP port.
//!
//! This demo shows:
//! - Defining a service with typed method handlers
//! - Returning business errors
//! - Reading the caller's deadline and meta
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=debug cargo run --example echo_server -- 127.0.0.1:8081
//! ```

use std::time::Duration;

use microrpc::handler::ServiceDefinition;
use microrpc::{BoxError, CallContext, Server};
use serde::{Deserialize, Serialize};

/// Input structure for the `Echo` method.
#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the `Echo` method.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
    trace_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8081".to_string());

    let echo = ServiceDefinition::new("echo")
        .method("Echo", |ctx: CallContext, input: EchoInput| async move {
            Ok(EchoOutput {
                echo: input.message,
                trace_id: ctx.meta_value("trace-id").map(str::to_string),
            })
        })
        .method("Upper", |_ctx, s: String| async move { Ok(s.to_uppercase()) })
        .method("Fail", |_ctx, reason: String| async move {
            Err::<(), BoxError>(reason.into())
        })
        .method("Slow", |ctx: CallContext, ms: u64| async move {
            tracing::info!(remaining = ?ctx.remaining(), "slow call started");
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .method("Log", |_ctx, line: String| async move {
            tracing::info!(%line, "oneway log");
            Ok(())
        });

    let handle = Server::builder()
        .service(echo)
        .idle_timeout(Duration::from_secs(300))
        .build()?
        .start(addr.as_str())
        .await?;

    tracing::info!(addr = %handle.local_addr(), "echo server ready, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await?;

    Ok(())
}
