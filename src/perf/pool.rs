//! Bounded connection pool keyed by endpoint.
//!
//! The pool caps live connections (idle plus checked-out) per endpoint at
//! `max_size`. A full endpoint fails acquisition immediately rather than
//! queueing. Idle entries past `idle_timeout` are dropped on the cleanup
//! tick.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode, ErrorContext, Result};

struct IdleConn<T> {
    conn: T,
    idle_since: Instant,
}

struct EndpointPool<T> {
    idle: Vec<IdleConn<T>>,
    checked_out: usize,
}

impl<T> Default for EndpointPool<T> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            checked_out: 0,
        }
    }
}

impl<T> EndpointPool<T> {
    fn live(&self) -> usize {
        self.idle.len() + self.checked_out
    }
}

/// Bounded pool of connections per endpoint.
pub struct ConnectionPool<T> {
    max_size: usize,
    idle_timeout: Duration,
    pools: Mutex<HashMap<String, EndpointPool<T>>>,
}

impl<T> std::fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_size", &self.max_size)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl<T> ConnectionPool<T> {
    /// Pool with the given per-endpoint bound and idle timeout.
    pub fn new(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            max_size,
            idle_timeout,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a connection for `endpoint`, creating one through `create`
    /// when no idle connection is available.
    ///
    /// Fails with `BrokerOverloaded` ("pool full") once `max_size`
    /// connections are live for the endpoint. The capacity slot is
    /// reserved before `create` runs, so concurrent acquisitions cannot
    /// oversubscribe the bound.
    pub async fn acquire_with<F, Fut>(&self, endpoint: &str, create: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut pools = self.lock();
            let pool = pools.entry(endpoint.to_string()).or_default();
            if let Some(idle) = pool.idle.pop() {
                pool.checked_out += 1;
                return Ok(idle.conn);
            }
            if pool.live() >= self.max_size {
                return Err(Error::new(ErrorCode::BrokerOverloaded, "pool full")
                    .with_context(ErrorContext::Endpoint {
                        address: endpoint.to_string(),
                    }));
            }
            pool.checked_out += 1;
        }

        match create().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                // Give the reserved slot back.
                let mut pools = self.lock();
                if let Some(pool) = pools.get_mut(endpoint) {
                    pool.checked_out = pool.checked_out.saturating_sub(1);
                }
                Err(e)
            }
        }
    }

    /// Return a connection to the endpoint's idle list.
    pub fn release(&self, endpoint: &str, conn: T) {
        let mut pools = self.lock();
        let pool = pools.entry(endpoint.to_string()).or_default();
        pool.checked_out = pool.checked_out.saturating_sub(1);
        pool.idle.push(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Discard a connection without returning it (e.g. after an error).
    pub fn discard(&self, endpoint: &str) {
        let mut pools = self.lock();
        if let Some(pool) = pools.get_mut(endpoint) {
            pool.checked_out = pool.checked_out.saturating_sub(1);
        }
    }

    /// Drop idle connections past the idle timeout. Returns the count.
    pub fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        let mut pools = self.lock();
        for pool in pools.values_mut() {
            let before = pool.idle.len();
            pool.idle
                .retain(|c| now.duration_since(c.idle_since) < self.idle_timeout);
            dropped += before - pool.idle.len();
        }
        dropped
    }

    /// Live connection count (idle + checked out) for `endpoint`.
    pub fn live(&self, endpoint: &str) -> usize {
        self.lock().get(endpoint).map_or(0, EndpointPool::live)
    }

    /// Idle connection count for `endpoint`.
    pub fn idle(&self, endpoint: &str) -> usize {
        self.lock().get(endpoint).map_or(0, |p| p.idle.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EndpointPool<T>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make(n: u32) -> Result<u32> {
        Ok(n)
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2, Duration::from_secs(60));

        let conn = pool.acquire_with("a", || make(1)).await.unwrap();
        assert_eq!(conn, 1);
        pool.release("a", conn);
        assert_eq!(pool.idle("a"), 1);

        // Reuse the idle connection instead of creating 2.
        let conn = pool.acquire_with("a", || make(2)).await.unwrap();
        assert_eq!(conn, 1);
    }

    #[tokio::test]
    async fn test_pool_full() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2, Duration::from_secs(60));
        let _a = pool.acquire_with("a", || make(1)).await.unwrap();
        let _b = pool.acquire_with("a", || make(2)).await.unwrap();

        let err = pool.acquire_with("a", || make(3)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BrokerOverloaded);

        // A different endpoint has its own budget.
        assert!(pool.acquire_with("b", || make(4)).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_create_releases_slot() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(1, Duration::from_secs(60));
        let err = pool
            .acquire_with("a", || async {
                Err::<u32, _>(Error::new(ErrorCode::ConnectionFailed, "refused"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);

        // The slot is free again.
        assert!(pool.acquire_with("a", || make(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_and_discard_bookkeeping() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2, Duration::from_secs(60));
        let a = pool.acquire_with("a", || make(1)).await.unwrap();
        let _b = pool.acquire_with("a", || make(2)).await.unwrap();
        assert_eq!(pool.live("a"), 2);

        pool.release("a", a);
        assert_eq!(pool.live("a"), 2);
        pool.discard("a");
        assert_eq!(pool.live("a"), 1);
    }

    #[tokio::test]
    async fn test_cleanup_reaps_idle() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(4, Duration::from_millis(0));
        let conn = pool.acquire_with("a", || make(1)).await.unwrap();
        pool.release("a", conn);

        assert_eq!(pool.cleanup_idle(), 1);
        assert_eq!(pool.idle("a"), 0);
    }
}
