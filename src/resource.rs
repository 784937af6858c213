//! Connection handle returned by the pool.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Instant,
};

use crate::{connection::ConnectionFactory, pool::Pool};

/// Connection checked out of a [`Pool`].
///
/// Dereferences to the underlying connection. The connection goes back to the pool when
/// the handle is dropped, on every exit path including unwinding.
pub struct PooledConnection<F: ConnectionFactory> {
    /// Originating pool.
    pool: Pool<F>,
    /// Connection identifier, unique within the pool.
    id: u64,
    /// Retrieval time.
    time: Instant,
    /// Wrapped connection, taken out on release.
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Bundle connection and the pool it belongs to.
    pub(crate) fn new(pool: Pool<F>, id: u64, conn: F::Connection) -> Self {
        Self {
            pool,
            id,
            // This is different from time used in wait_time metric.
            time: Instant::now(),
            conn: Some(conn),
        }
    }

    /// Connection identifier, unique within the originating pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check whether this handle was issued by `pool`.
    pub(crate) fn belongs_to(&self, pool: &Pool<F>) -> bool {
        Arc::ptr_eq(&self.pool.shared, &pool.shared)
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already returned to pool")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already returned to pool")
    }
}

impl<F: ConnectionFactory> AsRef<F::Connection> for PooledConnection<F> {
    fn as_ref(&self) -> &F::Connection {
        self
    }
}

impl<F: ConnectionFactory> AsMut<F::Connection> for PooledConnection<F> {
    fn as_mut(&mut self) -> &mut F::Connection {
        self
    }
}

impl<F> fmt::Debug for PooledConnection<F>
where
    F: ConnectionFactory,
    F::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.config().label())
            .field("id", &self.id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let shared = &self.pool.shared;
            // Record time spent outside the pool.
            shared
                .metrics
                .use_time
                .record(self.time.elapsed().as_secs_f64(), &shared.label);
            shared.put_back(self.id, conn);
        }
    }
}
