//! Service definitions and the registry the server dispatches through.
//!
//! A [`ServiceDefinition`] is a named set of typed method handlers. Each
//! handler is wrapped in a [`TypedHandler`] that decodes the request body
//! straight into the handler's argument type and encodes its return value
//! with the same [`BodyCodec`], so the registry only deals with type-erased
//! [`MethodHandler`]s.
//!
//! # Example
//!
//! ```
//! use microrpc::handler::{ServiceDefinition, ServiceRegistry};
//!
//! let echo = ServiceDefinition::new("echo")
//!     .method("Upper", |_ctx, s: String| async move { Ok(s.to_uppercase()) })
//!     .method("Len", |_ctx, s: String| async move { Ok(s.len()) });
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register(echo).unwrap();
//! assert!(registry.lookup("echo", "Upper").is_ok());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::BodyCodec;
use crate::context::CallContext;
use crate::error::{BoxError, RpcError, Result};
use crate::protocol::contains_separator;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type returned by business methods.
pub type HandlerResult<R> = std::result::Result<R, BoxError>;

/// Type-erased method handler.
pub trait MethodHandler: Send + Sync + 'static {
    /// Decode `data` with `body`, run the method and encode its result.
    fn call(
        &self,
        ctx: CallContext,
        body: BodyCodec,
        data: &[u8],
    ) -> BoxFuture<'static, Result<Bytes>>;
}

/// Adapter from a typed async closure to [`MethodHandler`].
pub struct TypedHandler<F, A, R, Fut>
where
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(A) -> (R, Fut)>,
}

impl<F, A, R, Fut> TypedHandler<F, A, R, Fut>
where
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, A, R, Fut> MethodHandler for TypedHandler<F, A, R, Fut>
where
    F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    fn call(
        &self,
        ctx: CallContext,
        body: BodyCodec,
        data: &[u8],
    ) -> BoxFuture<'static, Result<Bytes>> {
        let parsed: A = match body.decode(data) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(ctx, parsed);
        Box::pin(async move {
            let ret = fut
                .await
                .map_err(|e| RpcError::Business(e.to_string()))?;
            body.encode(&ret)
        })
    }
}

/// A named service and its methods.
pub struct ServiceDefinition {
    name: String,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register a method. A later registration under the same name wins.
    ///
    /// The handler receives the call context and the decoded argument and
    /// returns a value or an error whose text is sent back to the caller.
    pub fn method<F, A, R, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(TypedHandler::new(handler)));
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(method).cloned()
    }

    /// Check that the service and method names can be carried in a request header.
    pub fn validate(&self) -> Result<()> {
        validate_name("service", &self.name)?;
        if self.methods.is_empty() {
            return Err(RpcError::Config(format!(
                "service {:?} has no methods",
                self.name
            )));
        }
        for method in self.methods.keys() {
            validate_name("method", method)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Names that appear in the variable header must be non-empty and separator-free.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RpcError::Config(format!("{} name is empty", kind)));
    }
    if contains_separator(name) {
        return Err(RpcError::Config(format!(
            "{} name {:?} contains a separator byte",
            kind, name
        )));
    }
    Ok(())
}

/// Services by name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing any previous one with the same name.
    pub fn register(&mut self, service: ServiceDefinition) -> Result<Option<ServiceDefinition>> {
        service.validate()?;
        Ok(self.services.insert(service.name.clone(), service))
    }

    pub fn get(&self, service: &str) -> Option<&ServiceDefinition> {
        self.services.get(service)
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve `service.method`.
    pub fn lookup(&self, service: &str, method: &str) -> Result<Arc<dyn MethodHandler>> {
        let definition = self
            .services
            .get(service)
            .ok_or_else(|| RpcError::ServiceNotFound(service.to_string()))?;

        definition.get(method).ok_or_else(|| RpcError::MethodNotFound {
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    /// Route a call to `ctx.service().ctx.method()`.
    pub async fn dispatch(
        &self,
        ctx: CallContext,
        body: BodyCodec,
        data: &[u8],
    ) -> Result<Bytes> {
        let handler = self.lookup(ctx.service(), ctx.method())?;
        handler.call(ctx, body, data).await
    }
}
