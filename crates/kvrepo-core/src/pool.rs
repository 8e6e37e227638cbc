//! Round-robin connection pool.
//!
//! The pool opens `N` connections up front and hands them out in strict
//! rotation. Connections are multiplexed, so callers never wait for one to
//! become free; [`ConnectionPool::acquire`] is a single atomic increment.
//! Slots are never reconnected automatically and are closed only by
//! [`ConnectionPool::shutdown`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::join_all;
use kvrepo_store::{Connection, Endpoint, Timeouts};
use tracing::{debug, info};

use crate::error::RepoError;

/// One pooled connection and its position in the rotation.
#[derive(Debug)]
pub struct ConnectionSlot {
    index: usize,
    connection: Connection,
}

impl ConnectionSlot {
    /// Position of this slot in the pool.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The underlying connection.
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[derive(Debug)]
struct PoolInner {
    slots: Vec<Arc<ConnectionSlot>>,
    next: AtomicUsize,
    shut_down: AtomicBool,
}

/// Fixed-size pool of store connections. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open `size` connections to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Config`] if `size` is zero, or
    /// [`RepoError::Connect`] for the first connection that fails.
    pub async fn connect(
        endpoint: &Endpoint,
        size: usize,
        timeouts: Timeouts,
    ) -> Result<Self, RepoError> {
        if size < 1 {
            return Err(RepoError::Config(
                "connection pool needs at least one connection".to_owned(),
            ));
        }

        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let connection = Connection::open(endpoint, timeouts)
                .await
                .map_err(|source| RepoError::Connect {
                    endpoint: endpoint.describe().to_owned(),
                    source,
                })?;
            slots.push(Arc::new(ConnectionSlot { index, connection }));
        }

        info!(
            endpoint = endpoint.describe(),
            connections = size,
            "Connection pool ready"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                next: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Number of connections in the pool.
    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    /// Returns `true` once [`ConnectionPool::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// The next connection in rotation.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::PoolShutDown`] after shutdown.
    pub fn acquire(&self) -> Result<Arc<ConnectionSlot>, RepoError> {
        if self.is_shut_down() {
            return Err(RepoError::PoolShutDown);
        }
        let ticket = self.inner.next.fetch_add(1, Ordering::Relaxed);
        let slot = ticket
            .checked_rem(self.inner.slots.len())
            .and_then(|index| self.inner.slots.get(index))
            .ok_or(RepoError::PoolShutDown)?;
        debug!(connection = slot.index, "Acquired connection");
        Ok(Arc::clone(slot))
    }

    /// Close every connection. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::Aggregate`] with every connection that failed to
    /// close; the pool is shut down regardless.
    pub async fn shutdown(&self) -> Result<(), RepoError> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let results = join_all(
            self.inner
                .slots
                .iter()
                .map(|slot| slot.connection.quit()),
        )
        .await;
        let errors: Vec<RepoError> = results
            .into_iter()
            .filter_map(Result::err)
            .map(RepoError::Store)
            .collect();

        info!(
            connections = self.size(),
            failures = errors.len(),
            "Connection pool shut down"
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RepoError::Aggregate(errors))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kvrepo_store::MemoryStore;

    use super::*;

    async fn pool(size: usize) -> (MemoryStore, ConnectionPool) {
        let store = MemoryStore::new();
        let pool = ConnectionPool::connect(&Endpoint::Memory(store.clone()), size, Timeouts::default())
            .await
            .unwrap();
        (store, pool)
    }

    #[tokio::test]
    async fn rotates_through_every_slot() {
        let (store, pool) = pool(3).await;
        assert_eq!(store.connections_opened(), 3);

        let order: Vec<usize> = (0..7)
            .map(|_| pool.acquire().unwrap().index())
            .collect();
        assert_eq!(order, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn rejects_empty_pool() {
        let result = ConnectionPool::connect(
            &Endpoint::Memory(MemoryStore::new()),
            0,
            Timeouts::default(),
        )
        .await;
        assert!(matches!(result, Err(RepoError::Config(_))));
    }

    #[tokio::test]
    async fn acquire_fails_after_shutdown() {
        let (_store, pool) = pool(2).await;
        pool.shutdown().await.unwrap();

        assert!(pool.is_shut_down());
        assert_eq!(pool.acquire().unwrap_err(), RepoError::PoolShutDown);
        // Idempotent.
        assert!(pool.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn clones_share_the_rotation() {
        let (_store, pool) = pool(2).await;
        let other = pool.clone();
        assert_eq!(pool.acquire().unwrap().index(), 0);
        assert_eq!(other.acquire().unwrap().index(), 1);
        other.shutdown().await.unwrap();
        assert!(pool.is_shut_down());
    }
}
