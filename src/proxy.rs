//! Client-side service stubs.
//!
//! A stub is a struct whose fields are [`RemoteMethod`]s, one per remote
//! method. [`init_client_proxy`] fills those fields in, binding each to the
//! service name and its wire method name, after which calling a field sends
//! a request through the shared [`Proxy`] (normally a [`Client`](crate::Client)).
//!
//! The [`rpc_client!`](crate::rpc_client) macro declares such a struct and its
//! [`ServiceProxy`] impl.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use microrpc::{init_client_proxy, rpc_client, CallContext, Client};
//!
//! rpc_client! {
//!     pub struct EchoClient for "echo" {
//!         pub upper: "Upper" => fn(String) -> String,
//!         pub log: "Log" => fn(String) -> (),
//!     }
//! }
//!
//! let client = Arc::new(Client::builder("127.0.0.1:8081").build().await?);
//! let echo: EchoClient = init_client_proxy(client)?;
//!
//! let out = echo.upper.call(&CallContext::new(), &"hi".to_string()).await?;
//! assert_eq!(out, "HI");
//!
//! echo.log.notify(&CallContext::new(), &"fire and forget".to_string()).await?;
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codecs;
use crate::context::CallContext;
use crate::error::{RpcError, Result};
use crate::handler::{validate_name, BoxFuture};
use crate::protocol::{Request, Response};

/// Transport seam between stubs and the network.
pub trait Proxy: Send + Sync + 'static {
    /// Codecs used to encode arguments and decode results.
    fn codecs(&self) -> &Codecs;

    /// Serializer code stamped on outgoing requests.
    fn serializer(&self) -> u8;

    /// Compressor code stamped on outgoing requests.
    fn compressor(&self) -> u8;

    /// Send `req` and wait for its response.
    ///
    /// For oneway requests this resolves to `Err(RpcError::Oneway)` once the
    /// request has been written.
    fn invoke<'a>(&'a self, ctx: &'a CallContext, req: Request) -> BoxFuture<'a, Result<Response>>;
}

/// A typed handle to one remote method.
pub struct RemoteMethod<A, R> {
    proxy: Arc<dyn Proxy>,
    service: Arc<str>,
    method: Arc<str>,
    _phantom: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteMethod<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Call the method and wait for its result.
    ///
    /// A non-empty error in the response becomes `RpcError::Remote`. With a
    /// oneway context this returns `Err(RpcError::Oneway)` after the write.
    pub async fn call(&self, ctx: &CallContext, arg: &A) -> Result<R> {
        let req = self.build_request(ctx, arg)?;
        let resp = self.proxy.invoke(ctx, req).await?;

        if resp.is_error() {
            return Err(RpcError::Remote(resp.error));
        }
        self.proxy
            .codecs()
            .decode_body(resp.serializer, resp.compressor, &resp.data)
    }

    /// Send the call oneway; returns once the request is written.
    pub async fn notify(&self, ctx: &CallContext, arg: &A) -> Result<()> {
        let ctx = ctx.clone().oneway();
        let req = self.build_request(&ctx, arg)?;
        match self.proxy.invoke(&ctx, req).await {
            Ok(_) | Err(RpcError::Oneway) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn build_request(&self, ctx: &CallContext, arg: &A) -> Result<Request> {
        let serializer = self.proxy.serializer();
        let compressor = self.proxy.compressor();

        let mut req = Request::new(&*self.service, &*self.method);
        req.serializer = serializer;
        req.compressor = compressor;
        req.data = self.proxy.codecs().encode_body(serializer, compressor, arg)?;
        ctx.apply_to(&mut req)?;
        req.validate()?;
        Ok(req)
    }
}

impl<A, R> Clone for RemoteMethod<A, R> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            service: self.service.clone(),
            method: self.method.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for RemoteMethod<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteMethod({}.{})", self.service, self.method)
    }
}

/// Hands out [`RemoteMethod`]s while a stub is being bound.
pub struct ProxyBinder {
    proxy: Arc<dyn Proxy>,
    service: Arc<str>,
    bound: usize,
}

impl ProxyBinder {
    /// Bind `name` on the service being initialized.
    pub fn method<A, R>(&mut self, name: &str) -> Result<RemoteMethod<A, R>> {
        validate_name("method", name)?;
        self.bound += 1;
        Ok(RemoteMethod {
            proxy: self.proxy.clone(),
            service: self.service.clone(),
            method: Arc::from(name),
            _phantom: PhantomData,
        })
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }
}

/// A stub struct made of [`RemoteMethod`] fields.
///
/// Usually implemented by [`rpc_client!`](crate::rpc_client).
pub trait ServiceProxy: Sized {
    /// Service name sent in every request.
    const SERVICE_NAME: &'static str;

    /// Build the stub, taking one [`RemoteMethod`] per field from `binder`.
    fn bind(binder: &mut ProxyBinder) -> Result<Self>;
}

/// Build a stub for `S` on top of `proxy`.
///
/// Fails with `RpcError::Config`, before any I/O, when the service name is
/// not usable on the wire or the stub declares no methods.
pub fn init_client_proxy<S: ServiceProxy>(proxy: Arc<dyn Proxy>) -> Result<S> {
    init_client_proxy_as(proxy, S::SERVICE_NAME)
}

/// Like [`init_client_proxy`] but targets the service registered as `service`.
pub fn init_client_proxy_as<S: ServiceProxy>(proxy: Arc<dyn Proxy>, service: &str) -> Result<S> {
    validate_name("service", service)?;

    let mut binder = ProxyBinder {
        proxy,
        service: Arc::from(service),
        bound: 0,
    };
    let stub = S::bind(&mut binder)?;

    if binder.bound == 0 {
        return Err(RpcError::Config(format!(
            "service proxy {:?} has no remote methods",
            service
        )));
    }
    tracing::debug!(service, methods = binder.bound, "client proxy initialized");
    Ok(stub)
}

/// Declare a client stub struct and its [`ServiceProxy`] impl.
///
/// Each field maps to a wire method name and has type
/// `RemoteMethod<Arg, Ret>`.
///
/// ```ignore
/// microrpc::rpc_client! {
///     #[derive(Clone, Debug)]
///     pub struct UserClient for "users" {
///         pub get: "Get" => fn(u64) -> User,
///         pub rename: "Rename" => fn(RenameArgs) -> (),
///     }
/// }
/// ```
#[macro_export]
macro_rules! rpc_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident for $service:literal {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $method:literal => fn($arg:ty) -> $ret:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $crate::proxy::RemoteMethod<$arg, $ret>,
            )*
        }

        impl $crate::proxy::ServiceProxy for $name {
            const SERVICE_NAME: &'static str = $service;

            fn bind(binder: &mut $crate::proxy::ProxyBinder) -> $crate::Result<Self> {
                ::std::result::Result::Ok(Self {
                    $( $field: binder.method($method)?, )*
                })
            }
        }
    };
}
