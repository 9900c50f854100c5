//! Bounded connection pool.
//!
//! Engine-agnostic: holds any `Send` connection type. Callers block for at
//! most `acquire_timeout` and then get `PoolExhausted`; connections go back
//! to the pool when the guard drops.

use crate::error::{Result, StoreError};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

pub struct ConnectionPool<C> {
    name: &'static str,
    idle: Mutex<Vec<C>>,
    available: Condvar,
    size: usize,
    acquire_timeout: Duration,
}

impl<C> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("idle", &self.idle.lock().len())
            .finish()
    }
}

impl<C> ConnectionPool<C> {
    /// Pool over pre-opened connections.
    pub fn new(name: &'static str, connections: Vec<C>, acquire_timeout: Duration) -> Self {
        let size = connections.len();
        Self {
            name,
            idle: Mutex::new(connections),
            available: Condvar::new(),
            size,
            acquire_timeout,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Take a connection, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<PooledConnection<'_, C>> {
        let started = Instant::now();
        let mut idle = self.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
            let remaining = self.acquire_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() || self.available.wait_for(&mut idle, remaining).timed_out() {
                if let Some(conn) = idle.pop() {
                    return Ok(PooledConnection {
                        pool: self,
                        conn: Some(conn),
                    });
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(pool = self.name, size = self.size, waited_ms, "connection pool exhausted");
                return Err(StoreError::PoolExhausted {
                    pool: self.name,
                    waited_ms,
                });
            }
        }
    }

    fn release(&self, conn: C) {
        self.idle.lock().push(conn);
        self.available.notify_one();
    }
}

/// Connection checked out of a [`ConnectionPool`].
#[derive(Debug)]
pub struct PooledConnection<'a, C> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
