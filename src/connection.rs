//! Connection capability consumed by the pool.
//!
//! The pool never looks inside a connection: it only opens, probes and closes
//! them through these traits.

/// Live database session managed by a pool.
pub trait Connection: Send + 'static {
    /// Error type used by the connection implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Make sure the session is usable, reconnecting if the transport was dropped.
    ///
    /// Called on every connection taken from the idle set, since long idle periods
    /// can silently invalidate a session on the server side.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if the session is dead and could not be re-established.
    fn ensure_alive(&mut self) -> Result<(), Self::Error>;

    /// Release the session.
    ///
    /// Must be idempotent. Closed connections are never reused by the pool.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the session could not be shut down cleanly. The pool only
    /// logs such errors.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Factory for new connections.
///
/// Captures all parameters needed to open a session at construction time.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced by this factory.
    type Connection: Connection;

    /// Open new database session.
    ///
    /// # Errors
    ///
    /// Returns `Err` on network or authentication failure.
    fn open(&self) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

/// Error type of connections produced by factory `F`.
pub type ConnError<F> = <<F as ConnectionFactory>::Connection as Connection>::Error;
