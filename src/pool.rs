//! Bounded, thread-safe connection pool.

use std::{
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use opentelemetry::KeyValue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, info, warn};

use crate::{
    config::{check_bounds, PoolConfig},
    connection::{ConnError, Connection, ConnectionFactory},
    error::Error,
    metrics::{pool_kv, Metrics, PoolState, POOL_METRICS},
    reaper::Reaper,
    resource::PooledConnection,
};

// TODO: make state gathering interval configurable
const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Connection resting in the idle set.
struct IdleConnection<C> {
    id: u64,
    conn: C,
    /// Time of return to the idle set.
    since: Instant,
}

impl<C> IdleConnection<C> {
    fn new(id: u64, conn: C) -> Self {
        Self {
            id,
            conn,
            since: Instant::now(),
        }
    }
}

/// Pool bookkeeping, only ever accessed under a single lock.
struct Inventory<C> {
    /// Idle connections, most recently released last.
    idle: Vec<IdleConnection<C>>,
    /// Live connections, both idle and checked out.
    outstanding: usize,
    /// Connections being opened outside of the lock.
    reserved: usize,
    /// Callers blocked waiting for a connection.
    waiting: usize,
    min: usize,
    max: usize,
    closed: bool,
    next_id: u64,
}

impl<C> Inventory<C> {
    fn has_capacity(&self) -> bool {
        self.outstanding + self.reserved < self.max
    }

    /// Whether a released connection may go back to the idle set.
    fn keeps_released(&self) -> bool {
        !self.closed && self.outstanding <= self.max && self.idle.len() < self.max
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// How long a checkout may block.
#[derive(Clone, Copy, Debug)]
enum Wait {
    Never,
    Until(Instant),
    Forever,
}

impl Wait {
    /// Wait for `timeout` from now, or without limit if the deadline is not representable.
    fn timeout(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Forever, Self::Until)
    }
}

/// State shared by all handles of a single pool.
pub(crate) struct Shared<F: ConnectionFactory> {
    /// Pool configuration, as supplied at creation.
    config: PoolConfig,
    /// Source of new connections.
    factory: F,
    /// Idle set and counters.
    inventory: Mutex<Inventory<F::Connection>>,
    /// Signalled whenever a connection or capacity frees up.
    available: Condvar,
    /// Pool label.
    pub(crate) label: [KeyValue; 1],
    /// Linked metrics storage.
    pub(crate) metrics: Arc<Metrics>,
    /// Time of last gathering of common pool metrics.
    last_gathered_at: Mutex<Instant>,
    /// Dead idle connections replaced on checkout.
    stale_replaced: AtomicU64,
    /// Idle reaper, if enabled.
    reaper: Mutex<Option<Reaper>>,
}

impl<F: ConnectionFactory> Shared<F> {
    fn name(&self) -> &str {
        self.config.label()
    }

    /// Close connection, logging any failure.
    ///
    /// Returns `true` if the connection was closed cleanly.
    fn close_connection(&self, id: u64, mut conn: F::Connection) -> bool {
        match conn.close() {
            Ok(()) => {
                debug!(pool = self.name(), id, "connection closed");
                true
            }
            Err(err) => {
                warn!(pool = self.name(), id, error = %err, "unable to close connection");
                false
            }
        }
    }

    /// Take a connection out of the pool, opening a new one if allowed.
    fn checkout(&self, wait: Wait) -> Result<(u64, F::Connection), Error<ConnError<F>>> {
        let mut inv = self.inventory.lock();
        loop {
            if inv.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(IdleConnection { id, mut conn, .. }) = inv.idle.pop() {
                drop(inv);
                match conn.ensure_alive() {
                    Ok(()) => return Ok((id, conn)),
                    Err(err) => {
                        warn!(pool = self.name(), id, error = %err, "replacing dead idle connection");
                        self.stale_replaced.fetch_add(1, Ordering::Relaxed);
                        self.metrics.stale_replaced.add(1, &self.label);
                        self.close_connection(id, conn);
                        inv = self.inventory.lock();
                        // Freed slot is picked up by this caller on the next iteration.
                        inv.outstanding -= 1;
                        continue;
                    }
                }
            }
            if inv.has_capacity() {
                inv.reserved += 1;
                drop(inv);
                let started = Instant::now();
                let opened = self.factory.open();
                self.metrics
                    .create_time
                    .record(started.elapsed().as_secs_f64(), &self.label);
                inv = self.inventory.lock();
                inv.reserved -= 1;
                return match opened {
                    Ok(conn) => {
                        let id = inv.next_id();
                        if inv.closed {
                            drop(inv);
                            self.close_connection(id, conn);
                            return Err(Error::PoolClosed);
                        }
                        inv.outstanding += 1;
                        drop(inv);
                        debug!(pool = self.name(), id, "connection opened");
                        Ok((id, conn))
                    }
                    Err(err) => {
                        drop(inv);
                        // Reservation is gone, let someone else try.
                        self.available.notify_one();
                        Err(Error::Connect(err))
                    }
                };
            }
            let deadline = match wait {
                Wait::Never => return Err(Error::WouldBlock),
                Wait::Until(deadline) => Some(deadline),
                Wait::Forever => None,
            };
            inv.waiting += 1;
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut inv, deadline).timed_out(),
                None => {
                    self.available.wait(&mut inv);
                    false
                }
            };
            inv.waiting -= 1;
            if timed_out {
                drop(inv);
                self.metrics.timeouts.add(1, &self.label);
                debug!(pool = self.name(), "timed out waiting for connection");
                return Err(Error::AcquireTimeout);
            }
        }
    }

    /// Return a checked-out connection to the pool.
    ///
    /// Never fails: connections that cannot be kept are closed.
    pub(crate) fn put_back(&self, id: u64, conn: F::Connection) {
        let mut inv = self.inventory.lock();
        if inv.keeps_released() {
            inv.idle.push(IdleConnection::new(id, conn));
            drop(inv);
            self.available.notify_one();
            return;
        }
        inv.outstanding -= 1;
        let closed = inv.closed;
        drop(inv);
        if !closed {
            debug!(pool = self.name(), id, "pool above capacity, closing released connection");
        }
        self.close_connection(id, conn);
        self.available.notify_one();
    }

    /// Close connections idle for longer than `max_idle`, oldest first.
    ///
    /// Never shrinks the pool below its minimum size. Returns number of connections removed.
    pub(crate) fn reap_idle(&self, max_idle: Duration) -> usize {
        let expired = {
            let mut inv = self.inventory.lock();
            if inv.closed {
                return 0;
            }
            let removable = inv.outstanding.saturating_sub(inv.min);
            let count = inv
                .idle
                .iter()
                .take_while(|entry| entry.since.elapsed() > max_idle)
                .count()
                .min(removable);
            let expired: Vec<_> = inv.idle.drain(..count).collect();
            inv.outstanding -= expired.len();
            expired
        };
        let count = expired.len();
        if count > 0 {
            debug!(pool = self.name(), count, "reaping idle connections");
            for entry in expired {
                self.close_connection(entry.id, entry.conn);
            }
            self.available.notify_all();
        }
        count
    }

    fn state(&self) -> PoolState {
        let inv = self.inventory.lock();
        PoolState {
            max_size: inv.max,
            min_size: inv.min,
            size: inv.outstanding,
            idle: inv.idle.len(),
            in_use: inv.outstanding - inv.idle.len(),
            waiting: inv.waiting,
            stale_replaced: self.stale_replaced.load(Ordering::Relaxed),
        }
    }
}

impl<F: ConnectionFactory> Drop for Shared<F> {
    fn drop(&mut self) {
        drop(self.reaper.get_mut().take());
        let idle = mem::take(&mut self.inventory.get_mut().idle);
        for entry in idle {
            self.close_connection(entry.id, entry.conn);
        }
    }
}

/// Outcome of [`Pool::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ShutdownSummary {
    /// Idle connections closed cleanly.
    pub closed: usize,
    /// Idle connections that reported an error while closing.
    pub failed: usize,
    /// Connections still checked out at shutdown time.
    ///
    /// These are closed as they are released.
    pub in_use: usize,
}

/// Connection pool.
///
/// Cheap to clone: all clones share the same connections. Opens `min_connections`
/// connections on creation, and never keeps more than `max_connections` alive.
pub struct Pool<F: ConnectionFactory> {
    pub(crate) shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create new pool, opening the minimum number of connections.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// * Configuration is invalid.
    /// * Any of the initial connections cannot be opened.
    /// * Idle reaper is enabled but cannot be started.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self, Error<ConnError<F>>> {
        config.validate()?;
        let label = pool_kv(config.label());
        let mut idle = Vec::with_capacity(config.max_connections);
        for id in 0..config.min_connections as u64 {
            match factory.open() {
                Ok(conn) => idle.push(IdleConnection::new(id, conn)),
                Err(err) => {
                    for mut entry in idle {
                        if let Err(close_err) = entry.conn.close() {
                            warn!(
                                pool = config.label(),
                                id = entry.id,
                                error = %close_err,
                                "unable to close connection"
                            );
                        }
                    }
                    return Err(Error::Connect(err));
                }
            }
        }
        let inventory = Inventory {
            outstanding: idle.len(),
            next_id: idle.len() as u64,
            idle,
            reserved: 0,
            waiting: 0,
            min: config.min_connections,
            max: config.max_connections,
            closed: false,
        };
        let shared = Arc::new(Shared {
            factory,
            inventory: Mutex::new(inventory),
            available: Condvar::new(),
            label,
            metrics: POOL_METRICS.clone(),
            last_gathered_at: Mutex::new(Instant::now()),
            stale_replaced: AtomicU64::new(0),
            reaper: Mutex::new(None),
            config,
        });
        if let Some(max_idle) = shared.config.max_idle_timeout {
            let reaper = Reaper::spawn(
                Arc::downgrade(&shared),
                shared.name(),
                shared.config.reap_interval,
                max_idle,
            )
            .map_err(Error::Reaper)?;
            *shared.reaper.lock() = Some(reaper);
        }
        shared.metrics.record_state(&shared.label, &shared.state());
        info!(
            pool = shared.name(),
            min = shared.config.min_connections,
            max = shared.config.max_connections,
            "connection pool created"
        );
        Ok(Self { shared })
    }

    /// Pool configuration, as supplied at creation.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire a connection, waiting up to the configured acquire timeout.
    ///
    /// Idle connections are handed out most-recently-released first, and are probed for
    /// liveness before that. Dead ones are closed and silently replaced.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// * No connection became available in time ([`Error::AcquireTimeout`]).
    /// * A new connection had to be opened and that failed ([`Error::Connect`]).
    /// * The pool was shut down ([`Error::PoolClosed`]).
    pub fn acquire(&self) -> Result<PooledConnection<F>, Error<ConnError<F>>> {
        self.acquire_timeout(self.shared.config.acquire_timeout)
    }

    /// Acquire a connection, waiting for at most `timeout` in total.
    ///
    /// # Errors
    ///
    /// See [`Self::acquire`].
    pub fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F>, Error<ConnError<F>>> {
        self.checkout(Wait::timeout(timeout), "acquire")
    }

    /// Acquire a connection without blocking.
    ///
    /// Might still open a new connection if the pool has spare capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WouldBlock`] if the pool is at capacity with no idle connections,
    /// otherwise same as [`Self::acquire`].
    pub fn try_acquire(&self) -> Result<PooledConnection<F>, Error<ConnError<F>>> {
        self.checkout(Wait::Never, "try_acquire")
    }

    fn checkout(
        &self,
        wait: Wait,
        op: &'static str,
    ) -> Result<PooledConnection<F>, Error<ConnError<F>>> {
        let now = Instant::now();
        let span = debug_span!("pool_acquire", op, pool = self.shared.name()).entered();
        let (id, conn) = self.shared.checkout(wait)?;
        drop(span);
        self.shared
            .metrics
            .wait_time
            .record(now.elapsed().as_secs_f64(), &self.shared.label);
        self.update_metrics();
        Ok(PooledConnection::new(self.clone(), id, conn))
    }

    /// Return a connection to the pool.
    ///
    /// Dropping the handle has the same effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRelease`] if the connection was acquired from a different
    /// pool. Such a connection is still returned to its own pool.
    pub fn release(&self, conn: PooledConnection<F>) -> Result<(), Error<ConnError<F>>> {
        if !conn.belongs_to(self) {
            warn!(
                pool = self.shared.name(),
                id = conn.id(),
                "rejected release of foreign connection"
            );
            return Err(Error::InvalidRelease);
        }
        drop(conn);
        Ok(())
    }

    /// Run `f` with a pooled connection.
    ///
    /// The connection is released exactly once, whatever way `f` exits.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a connection could not be acquired, or if `f` failed.
    pub fn with_connection<T, E, C>(&self, f: C) -> Result<T, E>
    where
        C: FnOnce(&mut F::Connection) -> Result<T, E>,
        E: From<Error<ConnError<F>>>,
    {
        let mut conn = self.acquire()?;
        f(&mut *conn)
    }

    /// Change maximum number of live connections.
    ///
    /// Surplus idle connections are closed right away, surplus checked-out connections are
    /// closed when released.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `max` is lower than the configured minimum.
    pub fn resize(&self, max: usize) -> Result<(), Error<ConnError<F>>> {
        let surplus = {
            let mut inv = self.shared.inventory.lock();
            check_bounds(inv.min, max)?;
            inv.max = max;
            let excess = inv.outstanding.saturating_sub(max).min(inv.idle.len());
            let surplus: Vec<_> = inv.idle.drain(..excess).collect();
            inv.outstanding -= surplus.len();
            surplus
        };
        info!(pool = self.shared.name(), max, "pool resized");
        for entry in surplus {
            self.shared.close_connection(entry.id, entry.conn);
        }
        self.shared.available.notify_all();
        self.shared
            .metrics
            .record_state(&self.shared.label, &self.shared.state());
        Ok(())
    }

    /// Get current pool counters.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    /// Manually update pool metrics.
    ///
    /// Normally you wouldn't need to call this directly, as metrics collection occurs
    /// automatically as you use the pool.
    pub fn update_metrics(&self) {
        let mut last_gathered_at = self.shared.last_gathered_at.lock();
        if last_gathered_at.elapsed() > PROBE_INTERVAL {
            *last_gathered_at = Instant::now();
            drop(last_gathered_at);
            self.shared
                .metrics
                .record_state(&self.shared.label, &self.shared.state());
        }
    }

    /// Check whether the pool was shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.inventory.lock().closed
    }

    /// Close all idle connections and stop handing out new ones.
    ///
    /// Blocked callers are woken and fail with [`Error::PoolClosed`]. Checked-out connections
    /// are not waited for: they are closed as they are released. Calling this more than once
    /// is harmless.
    pub fn shutdown(&self) -> ShutdownSummary {
        let reaper = self.shared.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop();
        }
        let (drained, in_use) = {
            let mut inv = self.shared.inventory.lock();
            inv.closed = true;
            let drained = mem::take(&mut inv.idle);
            inv.outstanding -= drained.len();
            (drained, inv.outstanding)
        };
        self.shared.available.notify_all();
        let mut summary = ShutdownSummary {
            in_use,
            ..ShutdownSummary::default()
        };
        for entry in drained {
            if self.shared.close_connection(entry.id, entry.conn) {
                summary.closed += 1;
            } else {
                summary.failed += 1;
            }
        }
        info!(
            pool = self.shared.name(),
            closed = summary.closed,
            failed = summary.failed,
            in_use,
            "connection pool shut down"
        );
        self.shared
            .metrics
            .record_state(&self.shared.label, &self.shared.state());
        summary
    }
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
