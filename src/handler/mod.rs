//! Handler module - server-side services and dispatch.
//!
//! Provides:
//! - [`ServiceDefinition`] - a named set of typed method handlers
//! - [`ServiceRegistry`] - maps service names to definitions
//!
//! # Example
//!
//! ```ignore
//! use microrpc::handler::ServiceDefinition;
//! use microrpc::{BoxError, CallContext};
//!
//! let users = ServiceDefinition::new("users")
//!     .method("Get", |_ctx: CallContext, id: u64| async move {
//!         if id == 42 {
//!             return Err::<String, BoxError>("user 42 is banned".into());
//!         }
//!         Ok(format!("user-{}", id))
//!     });
//! ```

mod registry;

pub(crate) use registry::validate_name;
pub use registry::{
    BoxFuture, HandlerResult, MethodHandler, ServiceDefinition, ServiceRegistry, TypedHandler,
};
