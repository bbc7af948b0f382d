//! Per-call context shared by client and server.
//!
//! On the client a [`CallContext`] carries the caller's deadline, the oneway
//! flag and application meta; they travel in the request's meta map. The
//! server rebuilds a context from that meta and hands it to the handler.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use microrpc::CallContext;
//!
//! let ctx = CallContext::new()
//!     .with_timeout(Duration::from_secs(2))
//!     .with_meta("trace-id", "abc123");
//!
//! assert!(!ctx.is_expired());
//! assert_eq!(ctx.meta_value("trace-id"), Some("abc123"));
//! ```

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{RpcError, Result};
use crate::protocol::{contains_separator, Request, META_DEADLINE, META_ONEWAY};

/// Deadline, oneway flag and meta for one call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<DateTime<Utc>>,
    oneway: bool,
    meta: HashMap<String, String>,
    service: String,
    method: String,
    request_id: u32,
}

impl CallContext {
    /// Unbounded, two-way context with no meta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline to `now + timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Mark the call oneway: the client returns once the request is written.
    pub fn oneway(mut self) -> Self {
        self.oneway = true;
        self
    }

    /// Attach application meta. Reserved keys are rejected when the request is built.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    #[inline]
    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// Application meta (reserved keys excluded).
    #[inline]
    pub fn meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|s| s.as_str())
    }

    /// Service being called (server side).
    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method being called (server side).
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request ID of the call (server side).
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Time left before the deadline; zero once it has passed, `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= Utc::now())
    }

    /// Write deadline, oneway flag and application meta into `req.meta`.
    pub(crate) fn apply_to(&self, req: &mut Request) -> Result<()> {
        for (key, value) in &self.meta {
            if key == META_DEADLINE || key == META_ONEWAY {
                return Err(RpcError::Config(format!("meta key {:?} is reserved", key)));
            }
            if key.is_empty() || contains_separator(key) || contains_separator(value) {
                return Err(RpcError::Config(format!("invalid meta entry {:?}", key)));
            }
            req.meta.insert(key.clone(), value.clone());
        }

        if let Some(deadline) = self.deadline {
            req.meta
                .insert(META_DEADLINE.to_string(), deadline.timestamp_millis().to_string());
        }
        if self.oneway {
            req.meta.insert(META_ONEWAY.to_string(), "true".to_string());
        }
        Ok(())
    }

    /// Rebuild the caller's context from a decoded request.
    ///
    /// A deadline that does not parse as epoch milliseconds is ignored.
    pub(crate) fn from_request(req: &Request) -> Self {
        let deadline = req
            .meta
            .get(META_DEADLINE)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let meta = req
            .meta
            .iter()
            .filter(|(k, _)| k.as_str() != META_DEADLINE && k.as_str() != META_ONEWAY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            deadline,
            oneway: req.is_oneway(),
            meta,
            service: req.service_name.clone(),
            method: req.method_name.clone(),
            request_id: req.request_id,
        }
    }
}
