//! Connection Manager: a scoped borrow of a pooled Redis connection with
//! lazy construction, thread-affine storage, and a sticky closed flag.
//!
//! Grounded on the teacher crate's `persist::redis::RedisPool`/
//! `RedisPoolBuilder` (bb8 + bb8-redis), generalized from a single
//! process-wide pool to the "one pool per OS thread" model the spec
//! requires: a pool built from `ConnectionParameters` is cached per
//! `ThreadId` in a `DashMap` (the teacher crate reaches for `dashmap`
//! elsewhere for exactly this kind of keyed, concurrently-accessed cache)
//! and built lazily on first use from that thread.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use dashmap::DashMap;

use crate::config::ConnectionParameters;
use crate::error::{BusError, Result};

type RedisPool = Pool<RedisConnectionManager>;

/// A pooled connection, handed to the caller's closure for the duration of
/// one `acquire()` call. It derefs to the underlying `MultiplexedConnection`
/// so `redis::AsyncCommands` methods and `Pipeline::query_async` work
/// directly against it.
pub type Connection = bb8::PooledConnection<'static, RedisConnectionManager>;

enum PoolSource {
    /// Built lazily, one pool per OS thread, from these parameters.
    Lazy {
        parameters: ConnectionParameters,
        pools: DashMap<ThreadId, RedisPool>,
    },
    /// A single pre-built pool, usable only from the OS thread that
    /// constructed the transport.
    Injected {
        pool: RedisPool,
        owner: ThreadId,
    },
}

/// Per-transport connection manager. Cheap to clone: the pool(s) it wraps
/// are themselves `Arc`-backed.
pub struct ConnectionManager {
    source: PoolSource,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Build a manager that constructs its pool(s) lazily, one per OS
    /// thread, from `parameters`.
    pub fn from_parameters(parameters: ConnectionParameters) -> Self {
        Self {
            source: PoolSource::Lazy {
                parameters,
                pools: DashMap::new(),
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap a pre-built pool. The manager may only be used from the OS
    /// thread that called this constructor; use `from_parameters` instead
    /// if the transport will be shared across threads.
    pub fn from_pool(pool: RedisPool) -> Self {
        Self {
            source: PoolSource::Injected {
                pool,
                owner: std::thread::current().id(),
            },
            closed: AtomicBool::new(false),
        }
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::TransportIsClosed);
        }
        Ok(())
    }

    async fn pool_for_current_thread(&self) -> Result<RedisPool> {
        match &self.source {
            PoolSource::Injected { pool, owner } => {
                let current = std::thread::current().id();
                if current != *owner {
                    return Err(BusError::InvalidPool(
                        "injected redis pool used from a different OS thread; \
                         construct the transport with `connection_parameters` instead"
                            .to_owned(),
                    ));
                }
                Ok(pool.clone())
            }
            PoolSource::Lazy { parameters, pools } => {
                let tid = std::thread::current().id();
                if let Some(existing) = pools.get(&tid) {
                    return Ok(existing.clone());
                }
                let manager = RedisConnectionManager::new(parameters.address.clone())?;
                let built = Pool::builder()
                    .max_size(parameters.maxsize)
                    .build(manager)
                    .await
                    .map_err(|e| BusError::InvalidPool(e.to_string()))?;
                pools.insert(tid, built.clone());
                Ok(built)
            }
        }
    }

    fn warn_if_saturated(&self, pool: &RedisPool) {
        let Some(maxsize) = self.configured_maxsize() else {
            return;
        };
        let state = pool.state();
        if state.connections >= maxsize {
            log::warn!(
                "redis pool has reached its maximum size ({} connections); \
                 acquire() may now block waiting for a connection to free up",
                state.connections
            );
        }
    }

    /// `None` for an injected pool, since its max size was configured by
    /// whoever built it, not by this manager.
    fn configured_maxsize(&self) -> Option<u32> {
        match &self.source {
            PoolSource::Lazy { parameters, .. } => Some(parameters.maxsize),
            PoolSource::Injected { .. } => None,
        }
    }

    /// Run `f` against a pooled connection. The connection is returned to
    /// the pool on every exit path: success, error, or the future being
    /// dropped (cancellation), because `f`'s connection argument is a
    /// plain stack value that drops normally.
    pub async fn acquire<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.check_closed()?;
        let pool = self.pool_for_current_thread().await?;
        self.warn_if_saturated(&pool);

        let conn = pool.get_owned().await.map_err(|e| match e {
            bb8::RunError::User(inner) => BusError::Redis(inner),
            bb8::RunError::TimedOut => BusError::Pool(bb8::RunError::TimedOut),
        })?;

        // The pool may have been closed by a concurrent `close()` call
        // while we were waiting for a connection; treat that as a
        // shutdown-in-progress rather than handing out a connection whose
        // pool is being torn down underneath it.
        self.check_closed().map_err(|_| BusError::ShutdownInProgress)?;

        // `conn` is a `PooledConnection`, which derefs to `MultiplexedConnection`;
        // it drops back into the pool when this future resolves or is
        // dropped, on every exit path including cancellation.
        f(conn).await
    }

    /// Idempotent. Marks the manager closed (all subsequent `acquire()`
    /// calls fail fast with `TransportIsClosed`) and drops any cached
    /// per-thread pools so their connections are released. `bb8::Pool` has
    /// no explicit close/drain API (unlike the aioredis pool the original
    /// implementation wraps), so releasing every `Arc`-backed pool handle
    /// we hold is how this port models "initiates pool close and awaits
    /// completion".
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let PoolSource::Lazy { pools, .. } = &self.source {
            pools.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_manager_rejects_acquire() {
        let cm = ConnectionManager::from_parameters(ConnectionParameters::new(
            "redis://127.0.0.1:1", // never actually dialed in this test
        ));
        cm.close().await;
        assert!(cm.is_closed());
        let result = cm.acquire(|_conn| async { Ok(()) }).await;
        assert!(matches!(result, Err(BusError::TransportIsClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let cm = ConnectionManager::from_parameters(ConnectionParameters::default());
        cm.close().await;
        cm.close().await;
        assert!(cm.is_closed());
    }
}
