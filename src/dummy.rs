//! In-memory connections for testing purposes.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::connection::{Connection, ConnectionFactory};

/// Dummy connection error.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DummyError {
    #[error("connection refused")]
    Refused,
    #[error("connection is dead")]
    Dead,
    #[error("unable to close connection")]
    CloseFailed,
}

/// Counters shared between a dummy factory and its connections.
#[derive(Debug, Default)]
pub(crate) struct DummyStats {
    pub(crate) opened: AtomicUsize,
    pub(crate) closed: AtomicUsize,
    pub(crate) probes: AtomicUsize,
    /// Number of upcoming open attempts that will fail.
    pub(crate) fail_opens: AtomicUsize,
    /// Number of upcoming open attempts that succeed before failures kick in.
    pub(crate) skip_opens: AtomicUsize,
}

impl DummyStats {
    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.fail_opens_after(0, count);
    }

    pub(crate) fn fail_opens_after(&self, skip: usize, count: usize) {
        self.skip_opens.store(skip, Ordering::SeqCst);
        self.fail_opens.store(count, Ordering::SeqCst);
    }
}

/// Dummy connection factory for testing purposes.
#[derive(Debug, Default)]
pub(crate) struct DummyFactory {
    stats: Arc<DummyStats>,
}

impl DummyFactory {
    pub(crate) fn new() -> (Self, Arc<DummyStats>) {
        let factory = Self::default();
        let stats = factory.stats.clone();
        (factory, stats)
    }
}

impl ConnectionFactory for DummyFactory {
    type Connection = DummyConnection;

    fn open(&self) -> Result<Self::Connection, DummyError> {
        let skipped = self
            .stats
            .skip_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let failed = !skipped
            && self
                .stats
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failed {
            return Err(DummyError::Refused);
        }
        let serial = self.stats.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(DummyConnection {
            serial,
            alive: true,
            fail_close: false,
            closed: false,
            stats: self.stats.clone(),
        })
    }
}

/// Dummy connection for testing purposes.
#[derive(Debug)]
pub(crate) struct DummyConnection {
    /// Order in which this connection was opened, starting from 1.
    pub(crate) serial: usize,
    /// Dead connections fail their liveness probe.
    pub(crate) alive: bool,
    /// Report an error when closing.
    pub(crate) fail_close: bool,
    closed: bool,
    stats: Arc<DummyStats>,
}

impl Connection for DummyConnection {
    type Error = DummyError;

    fn ensure_alive(&mut self) -> Result<(), Self::Error> {
        self.stats.probes.fetch_add(1, Ordering::SeqCst);
        if self.alive && !self.closed {
            Ok(())
        } else {
            Err(DummyError::Dead)
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if !self.closed {
            self.closed = true;
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail_close {
            Err(DummyError::CloseFailed)
        } else {
            Ok(())
        }
    }
}
