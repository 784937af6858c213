//! Error types and error support code.

use crate::config::PoolConfigError;

/// Error type returned by pool operations.
///
/// `E` is the error type of the underlying connection implementation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error<E>
where
    E: std::error::Error + 'static,
{
    /// Unable to open a new database connection.
    #[error("unable to open connection: {0}")]
    Connect(#[source] E),
    /// Resource acquisition took longer than the allowed wait time.
    #[error("connection acquisition timeout")]
    AcquireTimeout,
    /// Call would block the thread, and non-blocking operation was requested.
    #[error("acquisition from pool would block execution")]
    WouldBlock,
    /// Connection handle was released to a pool that does not own it.
    #[error("connection does not belong to this pool")]
    InvalidRelease,
    /// Pool was shut down.
    #[error("pool is shut down")]
    PoolClosed,
    /// Unable to start idle reaper thread.
    #[error("unable to start idle reaper: {0}")]
    Reaper(#[source] std::io::Error),
    /// Invalid pool configuration.
    #[error(transparent)]
    Config(#[from] PoolConfigError),
}

impl<E> Error<E>
where
    E: std::error::Error + 'static,
{
    /// Check whether this error was caused by exhausted pool capacity.
    ///
    /// Both blocking timeouts and non-blocking refusals count.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::AcquireTimeout | Self::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn connect_error_keeps_source() {
        let err: Error<io::Error> =
            Error::Connect(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(err.to_string(), "unable to open connection: refused");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("refused"));
    }

    #[test]
    fn exhaustion_kinds() {
        assert!(Error::<io::Error>::AcquireTimeout.is_exhausted());
        assert!(Error::<io::Error>::WouldBlock.is_exhausted());
        assert!(!Error::<io::Error>::PoolClosed.is_exhausted());
        assert!(!Error::<io::Error>::InvalidRelease.is_exhausted());
    }
}
