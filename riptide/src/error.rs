use std::io;

use thiserror::Error;

/// Errors returned by the riptide runtime.
///
/// Transient errno values (`EAGAIN`, `EINTR`) are consumed at the syscall
/// sites and never appear here.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Peer closed its end of the connection.
    #[error("end of file")]
    Eof,
    /// Operation on a connection that has already been closed.
    #[error("connection closed")]
    Closed,
    /// Readiness backend setup failed.
    #[error("poller setup: {0}")]
    PollerSetup(String),
    /// System resource limit too low (e.g., RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
    /// Configuration rejected by `Config::validate`.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True for the transient kinds a caller may retry.
    pub(crate) fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}
