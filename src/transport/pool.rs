//! Bounded connection pool.
//!
//! Each checked-out connection holds one semaphore permit, so at most
//! `max_cap` connections are in use at once. New connections are only
//! opened when no idle one is available, which keeps the total number of
//! open connections within `max_cap` as well.
//!
//! A [`PooledConnection`] must be explicitly [`release`](PooledConnection::release)d
//! to go back to the idle list. Dropping it (or calling
//! [`discard`](PooledConnection::discard)) closes the connection: a call that
//! failed or was cancelled mid-frame leaves the stream in an unknown state.
//!
//! Idle connections older than `idle_timeout` are closed, except that the
//! newest `min_idle` of them stay open as the warm minimum.
//!
//! # Example
//!
//! ```ignore
//! let pool = ConnectionPool::tcp("127.0.0.1:8081", PoolConfig::default());
//! pool.warm().await?;
//!
//! let mut conn = pool.get().await?;
//! write_frame(&mut *conn, &bytes).await?;
//! conn.release();
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{RpcError, Result};

/// Default number of connections opened by [`ConnectionPool::warm`].
pub const DEFAULT_MIN_IDLE: usize = 1;

/// Default maximum number of connections.
pub const DEFAULT_MAX_CAP: usize = 16;

/// Default idle time after which a connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait for a free connection.
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout for opening a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Boxed future returned by a [`ConnectionFactory`].
pub type ConnectFuture<C> = Pin<Box<dyn Future<Output = Result<C>> + Send + 'static>>;

/// Opens new connections for the pool.
pub trait ConnectionFactory<C>: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture<C>;
}

impl<C, F, Fut> ConnectionFactory<C> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C>> + Send + 'static,
{
    fn connect(&self) -> ConnectFuture<C> {
        Box::pin(self())
    }
}

/// What `get()` does when all `max_cap` connections are in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutPolicy {
    /// Fail immediately with `PoolExhausted`.
    FailFast,
    /// Wait up to the duration for a connection to be returned.
    Wait(Duration),
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened eagerly by `warm()` and kept open through idle periods.
    pub min_idle: usize,
    /// Upper bound on open connections.
    pub max_cap: usize,
    /// Idle connections older than this are closed. Must be non-zero.
    pub idle_timeout: Duration,
    /// Behavior when capacity is exhausted.
    pub checkout: CheckoutPolicy,
    /// Timeout for the factory to open a connection.
    pub connect_timeout: Duration,
}

impl PoolConfig {
    pub fn min_idle(mut self, n: usize) -> Self {
        self.min_idle = n;
        self
    }

    pub fn max_cap(mut self, n: usize) -> Self {
        self.max_cap = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn checkout(mut self, policy: CheckoutPolicy) -> Self {
        self.checkout = policy;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_cap == 0 {
            return Err(RpcError::Config("pool max_cap must be at least 1".to_string()));
        }
        if self.min_idle > self.max_cap {
            return Err(RpcError::Config(format!(
                "pool min_idle {} exceeds max_cap {}",
                self.min_idle, self.max_cap
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(RpcError::Config(
                "pool idle_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: DEFAULT_MIN_IDLE,
            max_cap: DEFAULT_MAX_CAP,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            checkout: CheckoutPolicy::Wait(DEFAULT_CHECKOUT_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct Shared<C> {
    config: PoolConfig,
    factory: Box<dyn ConnectionFactory<C>>,
    idle: Mutex<VecDeque<IdleConn<C>>>,
    permits: Arc<Semaphore>,
    open: AtomicUsize,
    closed: AtomicBool,
}

impl<C> Shared<C> {
    fn connection_closed(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }

    /// Close idle connections older than `idle_timeout`, oldest first, never
    /// going below `min_idle`. Returns how many.
    fn reap(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock();
            // Oldest at the front: entries are pushed with the current time.
            while idle.len() > self.config.min_idle {
                match idle.front() {
                    Some(c) if now.duration_since(c.since) >= idle_timeout => {
                        expired.extend(idle.pop_front());
                    }
                    _ => break,
                }
            }
        }
        let reaped = expired.len();
        drop(expired);

        if reaped > 0 {
            self.open.fetch_sub(reaped, Ordering::AcqRel);
            tracing::debug!(reaped, "closed idle connections");
        }
        reaped
    }
}

/// A bounded pool of reusable connections.
pub struct ConnectionPool<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl ConnectionPool<TcpStream> {
    /// Pool of TCP connections to `addr` with `TCP_NODELAY` set.
    pub fn tcp(addr: impl Into<String>, config: PoolConfig) -> Result<Self> {
        let addr: Arc<str> = Arc::from(addr.into());
        Self::new(config, move || {
            let addr = addr.clone();
            async move {
                let stream = TcpStream::connect(&*addr).await?;
                stream.set_nodelay(true)?;
                Ok(stream)
            }
        })
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Create a pool; no connection is opened until `warm()` or `get()`.
    pub fn new(config: PoolConfig, factory: impl ConnectionFactory<C>) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_cap));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                factory: Box::new(factory),
                idle: Mutex::new(VecDeque::new()),
                permits,
                open: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Open idle connections until `min_idle` are available.
    pub async fn warm(&self) -> Result<()> {
        let target = self.shared.config.min_idle;
        while self.idle_count() < target && self.open_count() < self.shared.config.max_cap {
            let conn = self.open_new().await?;
            self.shared.idle.lock().push_back(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        Ok(())
    }

    /// Check out a connection, reusing an idle one when possible.
    pub async fn get(&self) -> Result<PooledConnection<C>> {
        if self.is_closed() {
            return Err(RpcError::PoolClosed);
        }

        let permit = self.acquire_permit().await?;

        if let Some(conn) = self.take_idle() {
            return Ok(PooledConnection::new(conn, permit, self.shared.clone()));
        }

        let conn = self.open_new().await?;
        Ok(PooledConnection::new(conn, permit, self.shared.clone()))
    }

    /// Close idle connections older than `idle_timeout`, keeping `min_idle`.
    /// Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap()
    }

    /// Run `reap_idle` every `interval` until the pool is closed or dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Shared<C>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.reap();
            }
        })
    }

    /// Close the pool: idle connections are dropped, waiters and later `get()`s fail.
    ///
    /// Connections currently checked out are closed when they come back.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();
        let drained: Vec<_> = self.shared.idle.lock().drain(..).collect();
        if !drained.is_empty() {
            self.shared.open.fetch_sub(drained.len(), Ordering::AcqRel);
        }
        tracing::debug!(closed = drained.len(), "connection pool closed");
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Connections waiting in the idle list.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Connections currently open (idle plus checked out).
    pub fn open_count(&self) -> usize {
        self.shared.open.load(Ordering::Acquire)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let permits = self.shared.permits.clone();
        match self.shared.config.checkout {
            CheckoutPolicy::FailFast => permits.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => RpcError::PoolClosed,
                TryAcquireError::NoPermits => RpcError::PoolExhausted,
            }),
            CheckoutPolicy::Wait(wait) => {
                match tokio::time::timeout(wait, permits.acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(RpcError::PoolClosed),
                    Err(_) => {
                        tracing::warn!(?wait, "timed out waiting for a pooled connection");
                        Err(RpcError::PoolExhausted)
                    }
                }
            }
        }
    }

    /// Pop the most recently returned idle connection, closing expired ones
    /// above the warm minimum.
    fn take_idle(&self) -> Option<C> {
        self.shared.reap();
        self.shared.idle.lock().pop_back().map(|idle| idle.conn)
    }

    async fn open_new(&self) -> Result<C> {
        let timeout = self.shared.config.connect_timeout;
        let conn = match tokio::time::timeout(timeout, self.shared.factory.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(RpcError::Timeout),
        };
        let open = self.shared.open.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(open, "opened pooled connection");
        Ok(conn)
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection<C> {
    conn: Option<C>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared<C>>,
}

impl<C> PooledConnection<C> {
    fn new(conn: C, permit: OwnedSemaphorePermit, shared: Arc<Shared<C>>) -> Self {
        Self {
            conn: Some(conn),
            permit: Some(permit),
            shared,
        }
    }

    /// Return the connection to the idle list.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if self.shared.closed.load(Ordering::Acquire) {
                self.shared.connection_closed();
            } else {
                self.shared.idle.lock().push_back(IdleConn {
                    conn,
                    since: Instant::now(),
                });
            }
        }
        self.permit.take();
    }

    /// Close the connection instead of returning it.
    pub fn discard(self) {
        drop(self);
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // `conn` is only taken by `release`, which consumes `self`.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.shared.connection_closed();
            tracing::debug!("discarded pooled connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeConn(usize);

    fn counting_pool(config: PoolConfig) -> (ConnectionPool<FakeConn>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = ConnectionPool::new(config, move || {
            let id = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(FakeConn(id)) }
        })
        .unwrap();
        (pool, created)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (pool, created) = counting_pool(PoolConfig::default());

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.0, 0);
        conn.release();
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.0, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.open_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_not_reused() {
        let (pool, created) = counting_pool(PoolConfig::default());

        let conn = pool.get().await.unwrap();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.open_count(), 0);

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.0, 1);
        conn.discard();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_warm_opens_min_idle() {
        let (pool, created) = counting_pool(PoolConfig::default().min_idle(3).max_cap(4));
        pool.warm().await.unwrap();
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(created.load(Ordering::SeqCst), 3);

        // Already warm.
        pool.warm().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_when_exhausted() {
        let (pool, _) =
            counting_pool(PoolConfig::default().max_cap(2).checkout(CheckoutPolicy::FailFast));

        let a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(RpcError::PoolExhausted)));

        a.release();
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_exhausted() {
        let (pool, _) = counting_pool(
            PoolConfig::default()
                .max_cap(1)
                .checkout(CheckoutPolicy::Wait(Duration::from_millis(200))),
        );

        let _held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(RpcError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_wait_unblocks_on_release() {
        let (pool, created) = counting_pool(
            PoolConfig::default()
                .max_cap(1)
                .checkout(CheckoutPolicy::Wait(Duration::from_secs(5))),
        );

        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|c| c.0) })
        };

        tokio::task::yield_now().await;
        held.release();

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_reaps() {
        let (pool, created) = counting_pool(
            PoolConfig::default()
                .min_idle(0)
                .idle_timeout(Duration::from_secs(10)),
        );

        pool.get().await.unwrap().release();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pool.reap_idle(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.open_count(), 0);

        // Expired connections are never handed out.
        pool.get().await.unwrap().release();
        tokio::time::advance(Duration::from_secs(11)).await;
        let conn = pool.get().await.unwrap();
        assert_eq!(conn.0, 2);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task() {
        let (pool, _) = counting_pool(
            PoolConfig::default()
                .min_idle(0)
                .idle_timeout(Duration::from_secs(1)),
        );
        let reaper = pool.spawn_reaper(Duration::from_millis(500));

        pool.get().await.unwrap().release();
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(pool.idle_count(), 0);

        pool.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reaper.is_finished());
    }

    #[tokio::test]
    async fn test_close() {
        let (pool, _) = counting_pool(PoolConfig::default());
        let held = pool.get().await.unwrap();
        pool.get().await.unwrap().release();

        pool.close();
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.get().await, Err(RpcError::PoolClosed)));

        held.release();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_factory_error_propagates() {
        let pool: ConnectionPool<FakeConn> = ConnectionPool::new(PoolConfig::default(), || async {
            Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        })
        .unwrap();

        assert!(matches!(pool.get().await, Err(RpcError::Io(_))));
        assert_eq!(pool.open_count(), 0);
        // The permit went back with the failed attempt.
        assert!(matches!(pool.get().await, Err(RpcError::Io(_))));
    }

    #[test]
    fn test_invalid_config() {
        let result = ConnectionPool::new(PoolConfig::default().max_cap(0), || async {
            Ok(FakeConn(0))
        });
        assert!(matches!(result, Err(RpcError::Config(_))));

        let result = ConnectionPool::new(PoolConfig::default().min_idle(5).max_cap(2), || async {
            Ok(FakeConn(0))
        });
        assert!(result.is_err());

        let result = ConnectionPool::new(
            PoolConfig::default().idle_timeout(Duration::ZERO),
            || async { Ok(FakeConn(0)) },
        );
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaping_keeps_min_idle() {
        let (pool, created) = counting_pool(
            PoolConfig::default()
                .min_idle(2)
                .idle_timeout(Duration::from_secs(10)),
        );
        pool.warm().await.unwrap();
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let c = pool.get().await.unwrap();
        a.release();
        b.release();
        c.release();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_count(), 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.open_count(), 2);

        // The warm minimum survives any number of idle periods.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(pool.reap_idle(), 0);
        assert_eq!(pool.idle_count(), 2);

        // And is reused rather than replaced.
        pool.get().await.unwrap().release();
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }
}
