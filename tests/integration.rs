//! Integration tests for microrpc.
//!
//! Each test runs a real server on an ephemeral port and talks to it
//! through a pooled client and generated stubs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::sync::mpsc;

use microrpc::codec::{COMPRESSOR_GZIP, SERIALIZER_MSGPACK};
use microrpc::handler::ServiceDefinition;
use microrpc::transport::CheckoutPolicy;
use microrpc::{
    init_client_proxy, init_client_proxy_as, rpc_client, BoxError, CallContext, Client, RpcError,
    Server, ServerHandle,
};

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
struct User {
    id: u64,
    name: String,
    tags: Vec<String>,
}

rpc_client! {
    struct EchoClient for "echo" {
        upper: "Upper" => fn(String) -> String,
        fail: "Fail" => fn(u64) -> String,
        sleep: "Sleep" => fn(u64) -> u64,
        trace: "Trace" => fn(()) -> Option<String>,
        nope: "Nope" => fn(()) -> (),
    }
}

rpc_client! {
    struct UserClient for "users" {
        get: "Get" => fn(u64) -> User,
        record: "Record" => fn(User) -> (),
        check_deadline: "CheckDeadline" => fn(()) -> bool,
    }
}

rpc_client! {
    #[derive(Debug)]
    struct EmptyClient for "echo" {}
}

rpc_client! {
    struct BlobClient for "blob" {
        reverse: "Reverse" => fn(ByteBuf) -> ByteBuf,
        index: "Index" => fn(Vec<String>) -> BTreeMap<u32, String>,
        ratio: "Ratio" => fn((f64, f64)) -> f64,
    }
}

/// Channels the handlers report to.
struct Reports {
    recorded: mpsc::UnboundedReceiver<User>,
    expired: mpsc::UnboundedReceiver<bool>,
}

async fn start_server() -> (ServerHandle, Reports) {
    let (record_tx, recorded) = mpsc::unbounded_channel();
    let (expired_tx, expired) = mpsc::unbounded_channel();

    let echo = ServiceDefinition::new("echo")
        .method("Upper", |_ctx, s: String| async move { Ok(s.to_uppercase()) })
        .method("Fail", |_ctx, id: u64| async move {
            Err::<String, BoxError>(format!("user {} is banned", id).into())
        })
        .method("Sleep", |_ctx, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .method("Trace", |ctx: CallContext, _: ()| async move {
            Ok(ctx.meta_value("trace-id").map(str::to_string))
        });

    let users = ServiceDefinition::new("users")
        .method("Get", |_ctx, id: u64| async move {
            Ok(User {
                id,
                name: format!("user-{}", id),
                tags: vec!["a".repeat(200), "b".repeat(200)],
            })
        })
        .method("Record", move |_ctx, user: User| {
            let tx = record_tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = tx.send(user);
                Ok(())
            }
        })
        .method("CheckDeadline", move |ctx: CallContext, _: ()| {
            let tx = expired_tx.clone();
            async move {
                let expired = ctx.is_expired();
                let _ = tx.send(expired);
                Ok(expired)
            }
        });

    let handle = Server::builder()
        .service(echo)
        .service(users)
        .build()
        .unwrap()
        .start("127.0.0.1:0")
        .await
        .unwrap();

    (handle, Reports { recorded, expired })
}

async fn connect(handle: &ServerHandle) -> Arc<Client> {
    Arc::new(
        Client::builder(handle.local_addr().to_string())
            .build()
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_echo_call() {
    let (server, _reports) = start_server().await;
    let client = connect(&server).await;
    let echo: EchoClient = init_client_proxy(client).unwrap();

    let out = echo
        .upper
        .call(&CallContext::new(), &"hi".to_string())
        .await
        .unwrap();
    assert_eq!(out, "HI");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_service_and_method() {
    let (server, _reports) = start_server().await;
    let client = connect(&server).await;

    let ghost: EchoClient = init_client_proxy_as(client.clone(), "ghost").unwrap();
    let err = ghost
        .upper
        .call(&CallContext::new(), &"hi".to_string())
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(text) => assert_eq!(text, "service not found: ghost"),
        other => panic!("expected remote error, got {:?}", other),
    }

    let echo: EchoClient = init_client_proxy(client.clone()).unwrap();
    let err = echo.nope.call(&CallContext::new(), &()).await.unwrap_err();
    assert_eq!(err.to_string(), "remote error: method not found: echo.Nope");

    // The connection stays usable after routing errors.
    let out = echo
        .upper
        .call(&CallContext::new(), &"still here".to_string())
        .await
        .unwrap();
    assert_eq!(out, "STILL HERE");
    assert_eq!(client.pool().open_count(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_business_error_is_verbatim() {
    let (server, _reports) = start_server().await;
    let echo: EchoClient = init_client_proxy(connect(&server).await).unwrap();

    let err = echo.fail.call(&CallContext::new(), &42).await.unwrap_err();
    assert!(matches!(&err, RpcError::Remote(text) if text == "user 42 is banned"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_meta_reaches_handler() {
    let (server, _reports) = start_server().await;
    let echo: EchoClient = init_client_proxy(connect(&server).await).unwrap();

    let ctx = CallContext::new().with_meta("trace-id", "abc123");
    assert_eq!(
        echo.trace.call(&ctx, &()).await.unwrap().as_deref(),
        Some("abc123")
    );
    assert_eq!(echo.trace.call(&CallContext::new(), &()).await.unwrap(), None);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oneway_returns_without_waiting() {
    let (server, mut reports) = start_server().await;
    let users: UserClient = init_client_proxy(connect(&server).await).unwrap();

    let user = User {
        id: 7,
        name: "ann".to_string(),
        tags: vec![],
    };

    // The handler sleeps 300ms; the notify must not wait for it.
    let started = Instant::now();
    users.record.notify(&CallContext::new(), &user).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));

    let received = tokio::time::timeout(Duration::from_secs(5), reports.recorded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, user);

    // `call` with a oneway context surfaces the marker error.
    let err = users
        .record
        .call(&CallContext::new().oneway(), &user)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Oneway));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_past_deadline_is_observed_by_handler() {
    let (server, mut reports) = start_server().await;
    let client = connect(&server).await;
    let users: UserClient = init_client_proxy(client.clone()).unwrap();

    let ctx = CallContext::new().with_deadline(chrono::Utc::now() - chrono::Duration::seconds(1));
    // The client gives up at once; the request is still delivered.
    let result = users.check_deadline.call(&ctx, &()).await;
    assert!(matches!(result, Err(RpcError::DeadlineExceeded) | Ok(true)));

    let expired = tokio::time::timeout(Duration::from_secs(5), reports.expired.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(expired);

    // A live deadline is not expired.
    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));
    assert!(!users.check_deadline.call(&ctx, &()).await.unwrap());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deadline_cuts_slow_call_and_discards_connection() {
    let (server, _reports) = start_server().await;
    let client = connect(&server).await;
    let echo: EchoClient = init_client_proxy(client.clone()).unwrap();

    let ctx = CallContext::new().with_timeout(Duration::from_millis(200));
    let started = Instant::now();
    let err = echo.sleep.call(&ctx, &5_000).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        RpcError::DeadlineExceeded => {}
        RpcError::Remote(text) => assert_eq!(text, "deadline exceeded"),
        other => panic!("unexpected error {:?}", other),
    }

    // The timed-out connection may still carry a late response; it is never reused.
    let out = echo
        .upper
        .call(&CallContext::new(), &"fresh".to_string())
        .await
        .unwrap();
    assert_eq!(out, "FRESH");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pool_exhaustion_fail_fast() {
    let (server, _reports) = start_server().await;
    let client = Arc::new(
        Client::builder(server.local_addr().to_string())
            .max_connections(1)
            .checkout(CheckoutPolicy::FailFast)
            .build()
            .await
            .unwrap(),
    );
    let echo: EchoClient = init_client_proxy(client.clone()).unwrap();

    let slow = {
        let sleep = echo.sleep.clone();
        tokio::spawn(async move { sleep.call(&CallContext::new(), &500).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = echo
        .upper
        .call(&CallContext::new(), &"x".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::PoolExhausted));

    assert_eq!(slow.await.unwrap().unwrap(), 500);
    assert_eq!(client.pool().idle_count(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_share_bounded_pool() {
    let (server, _reports) = start_server().await;
    let client = Arc::new(
        Client::builder(server.local_addr().to_string())
            .max_connections(4)
            .checkout(CheckoutPolicy::Wait(Duration::from_secs(10)))
            .build()
            .await
            .unwrap(),
    );
    let echo: EchoClient = init_client_proxy(client.clone()).unwrap();

    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..20 {
        let upper = echo.upper.clone();
        let client = client.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let out = upper
                .call(&CallContext::new(), &format!("msg-{}", i))
                .await
                .unwrap();
            peak.fetch_max(client.pool().open_count(), Ordering::SeqCst);
            out
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), format!("MSG-{}", i));
    }
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert!(client.pool().open_count() <= 4);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_msgpack_and_gzip() {
    let (server, _reports) = start_server().await;
    let client = Arc::new(
        Client::builder(server.local_addr().to_string())
            .serializer(SERIALIZER_MSGPACK)
            .compressor(COMPRESSOR_GZIP)
            .build()
            .await
            .unwrap(),
    );
    let users: UserClient = init_client_proxy(client).unwrap();

    let user = users.get.call(&CallContext::new(), &9).await.unwrap();
    assert_eq!(user.id, 9);
    assert_eq!(user.name, "user-9");
    assert_eq!(user.tags[0], "a".repeat(200));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_msgpack_native_types() {
    let blob = ServiceDefinition::new("blob")
        .method("Reverse", |_ctx, b: ByteBuf| async move {
            let mut v = b.into_vec();
            v.reverse();
            Ok(ByteBuf::from(v))
        })
        .method("Index", |_ctx, names: Vec<String>| async move {
            Ok((1u32..).zip(names).collect::<BTreeMap<u32, String>>())
        })
        .method("Ratio", |_ctx, (a, b): (f64, f64)| async move { Ok(a / b) });
    let server = Server::builder()
        .service(blob)
        .build()
        .unwrap()
        .start("127.0.0.1:0")
        .await
        .unwrap();
    let client = Arc::new(
        Client::builder(server.local_addr().to_string())
            .serializer(SERIALIZER_MSGPACK)
            .build()
            .await
            .unwrap(),
    );
    let stub: BlobClient = init_client_proxy(client).unwrap();
    let ctx = CallContext::new();

    let out = stub.reverse.call(&ctx, &ByteBuf::from(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(out.into_vec(), vec![3, 2, 1]);

    let index = stub
        .index
        .call(&ctx, &vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(index.get(&2).map(String::as_str), Some("b"));

    let ratio = stub.ratio.call(&ctx, &(0.0, 0.0)).await.unwrap();
    assert!(ratio.is_nan());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stub_without_methods_fails_before_io() {
    let (server, _reports) = start_server().await;
    let client = connect(&server).await;

    let err = init_client_proxy::<EmptyClient>(client.clone()).unwrap_err();
    assert!(matches!(err, RpcError::Config(_)));
    assert_eq!(client.pool().idle_count(), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_restart_is_transport_error() {
    let (server, _reports) = start_server().await;
    let client = connect(&server).await;
    let echo: EchoClient = init_client_proxy(client.clone()).unwrap();

    echo.upper
        .call(&CallContext::new(), &"a".to_string())
        .await
        .unwrap();
    server.shutdown().await.unwrap();

    let err = echo
        .upper
        .call(&CallContext::new(), &"b".to_string())
        .await
        .unwrap_err();
    assert!(err.is_transport(), "unexpected error {:?}", err);
    assert_eq!(client.pool().open_count(), 0);
}
