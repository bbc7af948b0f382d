//! Echo client - calls the `echo` service started by the `echo_server` demo.
//!
//! # Running
//!
//! ```sh
//! cargo run --example echo_server &
//! RUST_LOG=microrpc=debug cargo run --example echo_client -- 127.0.0.1:8081
//! ```

use std::sync::Arc;
use std::time::Duration;

use microrpc::codec::{COMPRESSOR_GZIP, SERIALIZER_MSGPACK};
use microrpc::{init_client_proxy, rpc_client, CallContext, Client, RpcError};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Deserialize, Debug)]
struct EchoOutput {
    echo: String,
    trace_id: Option<String>,
}

rpc_client! {
    /// Stub for the demo `echo` service.
    struct EchoClient for "echo" {
        echo: "Echo" => fn(EchoInput) -> EchoOutput,
        upper: "Upper" => fn(String) -> String,
        fail: "Fail" => fn(String) -> (),
        slow: "Slow" => fn(u64) -> u64,
        log: "Log" => fn(String) -> (),
    }
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

    let client = Arc::new(
        Client::builder(addr)
            .serializer(SERIALIZER_MSGPACK)
            .compressor(COMPRESSOR_GZIP)
            .max_connections(4)
            .build()
            .await?,
    );
    let stub: EchoClient = init_client_proxy(client.clone())?;

    let ctx = CallContext::new()
        .with_timeout(Duration::from_secs(2))
        .with_meta("trace-id", "demo-1");
    let out = stub
        .echo
        .call(&ctx, &EchoInput {
            message: "hello".to_string(),
        })
        .await?;
    println!("Echo -> {} (trace {:?})", out.echo, out.trace_id);

    let upper = stub.upper.call(&CallContext::new(), &"hi".to_string()).await?;
    println!("Upper -> {}", upper);

    match stub.fail.call(&CallContext::new(), &"not today".to_string()).await {
        Err(RpcError::Remote(text)) => println!("Fail -> remote error {:?}", text),
        other => println!("Fail -> unexpected {:?}", other),
    }

    let ctx = CallContext::new().with_timeout(Duration::from_millis(200));
    match stub.slow.call(&ctx, &1_000).await {
        Err(e) => println!("Slow -> {}", e),
        Ok(ms) => println!("Slow -> finished after {}ms", ms),
    }

    stub.log
        .notify(&CallContext::new(), &"fire and forget".to_string())
        .await?;
    println!("Log -> sent oneway");

    println!(
        "pool: {} open, {} idle",
        client.pool().open_count(),
        client.pool().idle_count()
    );
    client.close();

    Ok(())
}
